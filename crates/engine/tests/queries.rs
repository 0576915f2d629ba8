mod common;

use common::*;
use sea_query::SqliteQueryBuilder;
use warden_engine::{AuthzError, Checker, Select, Subject};
use warden_models::Context;

fn person(id: i64) -> Context {
    Context::new("person", id)
}

async fn people_allowed(fx: &Fixture, user: i64, action: &str) -> Vec<i64> {
    let mut out = Vec::new();
    for id in 1..=4 {
        if fx.engine.can(user, action, &person(id)).await.unwrap() {
            out.push(id);
        }
    }
    out
}

fn person_query() -> Select {
    Select::with_columns("person", &["id", "name"])
}

#[tokio::test]
async fn rewrite_joins_the_single_needed_relation() {
    let fx = geo_fixture(|b| {
        b.action("person", "read", Checker::path("read", ["city"]))
    })
    .await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine
        .grant(Subject::Group(1), "reader", &Context::new("city", MILAN))
        .await
        .unwrap();

    let query = engine
        .accessible_query(ALICE, person_query(), "read")
        .await
        .unwrap();
    let sql = query.statement().to_string(SqliteQueryBuilder);
    assert!(sql.contains("LEFT JOIN \"city\" ON \"city\".\"id\" = \"person\".\"city_id\""));
    assert!(sql.contains("\"city\".\"id\" IN (1)"));

    let ids = fetch_ids(&fx.db, &query).await;
    assert_eq!(ids, people_allowed(&fx, ALICE, "read").await);
    assert_eq!(ids, vec![3, 4]); // Joe and Jill live in Milan

    // Bob holds nothing: the rewrite collapses to WHERE FALSE.
    let query = engine
        .accessible_query(BOB, person_query(), "read")
        .await
        .unwrap();
    assert!(query
        .statement()
        .to_string(SqliteQueryBuilder)
        .to_lowercase()
        .contains("false"));
    assert!(fetch_ids(&fx.db, &query).await.is_empty());
}

#[tokio::test]
async fn rewrite_of_a_path_tree_joins_only_matched_branches() {
    let fx = geo_fixture(|b| {
        b.action(
            "person",
            "read",
            Checker::path("read", ["city", "city.department", "city.department.country"]),
        )
        .action(
            "person",
            "write",
            Checker::path(
                "write",
                ["city", "city.department", "city.department.country", "job", "hobby"],
            ),
        )
    })
    .await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine.assign("manager", &["read", "write"]).await.unwrap();

    engine
        .grant(Subject::Group(1), "reader", &Context::new("city", MILAN))
        .await
        .unwrap();
    engine
        .grant(Subject::Group(1), "reader", &Context::new("hobby", 5))
        .await
        .unwrap();
    engine
        .grant(Subject::Group(1), "reader", &Context::new("job", 4))
        .await
        .unwrap();

    let query = engine
        .accessible_query(ALICE, person_query(), "read")
        .await
        .unwrap();
    let sql = query.statement().to_string(SqliteQueryBuilder);
    assert!(sql.contains("LEFT JOIN \"city\""));
    assert!(!sql.contains("LEFT JOIN \"department\""));
    assert!(!sql.contains("LEFT JOIN \"country\""));
    assert!(!sql.contains("LEFT JOIN \"job\""));
    assert!(!sql.contains("LEFT JOIN \"hobby\""));
    assert!(sql.contains("\"city\".\"id\" IN (1)"));

    let ids = fetch_ids(&fx.db, &query).await;
    assert_eq!(ids, people_allowed(&fx, ALICE, "read").await);
    assert_eq!(ids, vec![3, 4]);

    // No write grants yet.
    let query = engine
        .accessible_query(ALICE, person_query(), "write")
        .await
        .unwrap();
    assert!(query
        .statement()
        .to_string(SqliteQueryBuilder)
        .to_lowercase()
        .contains("false"));
    assert!(fetch_ids(&fx.db, &query).await.is_empty());

    engine
        .grant(Subject::Group(1), "manager", &Context::new("job", 4))
        .await
        .unwrap();
    engine
        .grant(Subject::Group(1), "manager", &Context::new("city", PALERMO))
        .await
        .unwrap();
    engine
        .grant(Subject::Group(1), "manager", &Context::new("city", PARIS))
        .await
        .unwrap();
    engine
        .grant(Subject::Group(1), "manager", &Context::new("country", GERMANY))
        .await
        .unwrap();

    let query = engine
        .accessible_query(ALICE, person_query(), "write")
        .await
        .unwrap();
    let sql = query.statement().to_string(SqliteQueryBuilder);
    assert!(sql.contains("LEFT JOIN \"city\" ON \"city\".\"id\" = \"person\".\"city_id\""));
    assert!(sql
        .contains("LEFT JOIN \"department\" ON \"department\".\"id\" = \"city\".\"department_id\""));
    assert!(sql
        .contains("LEFT JOIN \"country\" ON \"country\".\"id\" = \"department\".\"country_id\""));
    assert!(sql.contains("LEFT JOIN \"job\" ON \"job\".\"id\" = \"person\".\"job_id\""));
    assert!(!sql.contains("LEFT JOIN \"hobby\""));
    assert!(sql.contains("\"city\".\"id\" IN (3, 5)"));
    assert!(sql.contains("\"country\".\"id\" IN (3)"));
    assert!(sql.contains("\"job\".\"id\" IN (4)"));

    let ids = fetch_ids(&fx.db, &query).await;
    assert_eq!(ids, people_allowed(&fx, ALICE, "write").await);
    assert_eq!(ids, vec![2, 4]); // Jane via Palermo, Jill via her job
}

#[tokio::test]
async fn rewrite_preserves_the_callers_projection_and_order() {
    let fx = geo_fixture(|b| {
        b.action("person", "read", Checker::path("read", ["city"]))
    })
    .await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine
        .grant(Subject::Group(1), "reader", &Context::new("city", MILAN))
        .await
        .unwrap();

    let query = person_query().order_by("person", "name", sea_query::Order::Desc);
    let before = query.statement().to_string(SqliteQueryBuilder);
    let rewritten = engine.accessible_query(ALICE, query, "read").await.unwrap();
    let after = rewritten.statement().to_string(SqliteQueryBuilder);

    let projection = "SELECT \"person\".\"id\", \"person\".\"name\" FROM \"person\"";
    assert!(before.starts_with(projection));
    assert!(after.starts_with(projection));
    assert!(before.ends_with("ORDER BY \"person\".\"name\" DESC"));
    assert!(after.ends_with("ORDER BY \"person\".\"name\" DESC"));
}

#[tokio::test]
async fn rewrite_skips_joins_the_caller_already_has() {
    let fx = geo_fixture(|b| {
        b.action("person", "read", Checker::path("read", ["city"]))
    })
    .await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine
        .grant(Subject::Group(1), "reader", &Context::new("city", MILAN))
        .await
        .unwrap();

    let query = person_query().inner_join(
        "city",
        sea_query::Expr::col((sea_query::Alias::new("city"), sea_query::Alias::new("id")))
            .equals((sea_query::Alias::new("person"), sea_query::Alias::new("city_id"))),
    );
    let rewritten = engine.accessible_query(ALICE, query, "read").await.unwrap();
    let sql = rewritten.statement().to_string(SqliteQueryBuilder);

    assert!(sql.contains("INNER JOIN \"city\""));
    assert!(!sql.contains("LEFT JOIN \"city\""));
    assert_eq!(fetch_ids(&fx.db, &rewritten).await, vec![3, 4]);
}

#[tokio::test]
async fn global_permission_leaves_the_query_unrestricted() {
    let fx = geo_fixture(|b| b).await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine.set_permission_global(true, &["read"]).await.unwrap();
    engine
        .grant(Subject::Group(1), "reader", &Context::new("city", MILAN))
        .await
        .unwrap();

    // alice holds a reader role somewhere and read is global: every row of
    // every model is hers.
    assert!(engine
        .can(ALICE, "read", &Context::new("country", GERMANY))
        .await
        .unwrap());
    assert!(engine.can(ALICE, "read", &person(1)).await.unwrap());

    let before = person_query().statement().to_string(SqliteQueryBuilder);
    let query = engine
        .accessible_query(ALICE, person_query(), "read")
        .await
        .unwrap();
    assert_eq!(query.statement().to_string(SqliteQueryBuilder), before);
    assert_eq!(fetch_ids(&fx.db, &query).await, vec![1, 2, 3, 4]);

    // bob holds no role at all
    assert!(!engine.can(BOB, "read", &person(1)).await.unwrap());
    let query = engine
        .accessible_query(BOB, person_query(), "read")
        .await
        .unwrap();
    assert!(fetch_ids(&fx.db, &query).await.is_empty());
}

#[tokio::test]
async fn queries_without_a_single_target_are_rejected() {
    let fx = geo_fixture(|b| b).await;
    let err = fx
        .engine
        .accessible_query(ALICE, Select::from_tables(&["person", "city"]), "read")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::AmbiguousTarget));
}

#[tokio::test]
async fn negated_path_falls_back_to_per_row_evaluation() {
    let fx = geo_fixture(|b| {
        b.action("city", "read", !Checker::path("read", ["department"]))
    })
    .await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine
        .grant(Subject::Group(1), "reader", &Context::new("department", SICILY))
        .await
        .unwrap();

    // Sicilian cities are the denied ones.
    assert!(!engine.can(ALICE, "read", &Context::new("city", PALERMO)).await.unwrap());
    assert!(engine.can(ALICE, "read", &Context::new("city", MILAN)).await.unwrap());

    let query = engine
        .accessible_query(ALICE, Select::with_columns("city", &["id", "name"]), "read")
        .await
        .unwrap();
    let sql = query.statement().to_string(SqliteQueryBuilder);
    assert!(sql.contains("\"city\".\"id\" IN"));
    assert!(!sql.contains("LEFT JOIN"));

    let ids = fetch_ids(&fx.db, &query).await;
    let mut expected = Vec::new();
    for id in 1..=BONN {
        if engine
            .can(ALICE, "read", &Context::new("city", id))
            .await
            .unwrap()
        {
            expected.push(id);
        }
    }
    assert_eq!(ids, expected);
    assert!(!ids.contains(&PALERMO));
    assert!(!ids.contains(&CATANIA));
    assert_eq!(ids.len(), 9);
}

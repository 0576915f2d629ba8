mod common;

use common::*;
use std::collections::HashSet;
use warden_engine::{Select, Subject};
use warden_models::{Context, ContextSet};

fn city(id: i64) -> Context {
    Context::new("city", id)
}

fn country(id: i64) -> Context {
    Context::new("country", id)
}

fn configure(b: warden_engine::EngineBuilder) -> warden_engine::EngineBuilder {
    b.propagate("country", ["departments"])
        .propagate("department", ["cities"])
}

/// A record passes `can` exactly when the rewritten query returns it.
#[tokio::test]
async fn per_row_checks_agree_with_the_rewritten_query() {
    let fx = geo_fixture(configure).await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine.grant(Subject::Group(1), "reader", &country(ITALY)).await.unwrap();
    engine
        .grant(Subject::Group(1), "reader", &city(PARIS))
        .await
        .unwrap();

    let query = engine
        .accessible_query(ALICE, Select::with_columns("city", &["id", "name"]), "read")
        .await
        .unwrap();
    let from_query = fetch_ids(&fx.db, &query).await;

    let mut from_checks = Vec::new();
    for id in 1..=BONN {
        if engine.can(ALICE, "read", &city(id)).await.unwrap() {
            from_checks.push(id);
        }
    }
    assert_eq!(from_query, from_checks);
    assert_eq!(from_query, vec![MILAN, BERGAMO, PALERMO, CATANIA, PARIS]);
}

/// Adding a grant never revokes anything.
#[tokio::test]
async fn grants_are_monotonic() {
    let fx = geo_fixture(configure).await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();

    assert!(!engine.can(ALICE, "read", &city(CATANIA)).await.unwrap());
    engine.grant(Subject::Group(1), "reader", &country(ITALY)).await.unwrap();

    let before: Vec<bool> = {
        let mut out = Vec::new();
        for id in 1..=BONN {
            out.push(engine.can(ALICE, "read", &city(id)).await.unwrap());
        }
        out
    };
    assert!(before[(CATANIA - 1) as usize]);

    engine
        .grant(Subject::Group(1), "reader", &country(GERMANY))
        .await
        .unwrap();
    for id in 1..=BONN {
        let now = engine.can(ALICE, "read", &city(id)).await.unwrap();
        assert!(now >= before[(id - 1) as usize]);
    }
    assert!(engine.can(ALICE, "read", &city(MUNICH)).await.unwrap());
}

/// A globally-flagged permission opens every registered record.
#[tokio::test]
async fn global_permissions_open_every_record() {
    let fx = geo_fixture(configure).await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine.grant(Subject::Group(1), "reader", &city(PARIS)).await.unwrap();
    engine.set_permission_global(true, &["read"]).await.unwrap();

    for table in ["country", "department", "city", "person"] {
        assert!(engine.can(ALICE, "read", &Context::new(table, 1)).await.unwrap());
    }
    // bob holds no role anywhere
    assert!(!engine.can(BOB, "read", &city(PARIS)).await.unwrap());
}

/// contexts_by_permission equals the union of the groups' non-global
/// grants.
#[tokio::test]
async fn contexts_by_permission_unions_group_grants() {
    let fx = geo_fixture(configure).await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine.assign("admin", &["read", "write"]).await.unwrap();
    engine.grant(Subject::Group(1), "reader", &country(ITALY)).await.unwrap();
    engine.grant(Subject::Group(1), "admin", &city(PARIS)).await.unwrap();
    engine.grant(Subject::Group(2), "reader", &city(MILAN)).await.unwrap();

    let contexts = engine.contexts_by_permission(ALICE, "read").await.unwrap();
    assert_eq!(
        contexts,
        vec![
            ContextSet::new("city", [PARIS]).unwrap(),
            ContextSet::new("country", [ITALY]).unwrap(),
        ]
    );

    // Explicit group sets bypass membership resolution.
    let both: HashSet<i64> = HashSet::from([1, 2]);
    let contexts = engine.contexts_by_permission(both, "read").await.unwrap();
    assert_eq!(
        contexts,
        vec![
            ContextSet::new("city", [MILAN, PARIS]).unwrap(),
            ContextSet::new("country", [ITALY]).unwrap(),
        ]
    );

    assert!(engine
        .contexts_by_permission(ALICE, "unknown")
        .await
        .unwrap()
        .is_empty());

    // Global grants are excluded.
    engine
        .grant(Subject::Group(1), "reader", &Context::global())
        .await
        .unwrap();
    let contexts = engine.contexts_by_permission(ALICE, "read").await.unwrap();
    assert!(!contexts.iter().any(|set| set.table() == "global"));
}

/// Answers are identical with cold and warm caches.
#[tokio::test]
async fn caches_are_transparent() {
    let fx = geo_fixture(configure).await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();
    engine.grant(Subject::Group(1), "reader", &country(ITALY)).await.unwrap();

    let mut cold = Vec::new();
    for id in 1..=BONN {
        cold.push(engine.can(ALICE, "read", &city(id)).await.unwrap());
    }

    // Warm: same handle, request cache and shared store populated.
    let mut warm = Vec::new();
    for id in 1..=BONN {
        warm.push(engine.can(ALICE, "read", &city(id)).await.unwrap());
    }
    assert_eq!(cold, warm);

    // Cleared: fresh request scope, flushed shared store.
    fx.kv.flush_all().await;
    let scoped = engine.scoped();
    let mut cleared = Vec::new();
    for id in 1..=BONN {
        cleared.push(scoped.can(ALICE, "read", &city(id)).await.unwrap());
    }
    assert_eq!(cold, cleared);

    let warm_contexts = engine.contexts_by_permission(ALICE, "read").await.unwrap();
    fx.kv.flush_all().await;
    let cold_contexts = engine
        .scoped()
        .contexts_by_permission(ALICE, "read")
        .await
        .unwrap();
    assert_eq!(warm_contexts, cold_contexts);
}

/// Grant/revoke invalidation is published before the call returns: the same
/// request scope sees fresh data immediately.
#[tokio::test]
async fn mutations_invalidate_their_cache_entries() {
    let fx = geo_fixture(configure).await;
    let engine = &fx.engine;

    engine.assign("reader", &["read"]).await.unwrap();

    // Prime the (group, context) cache entry with an empty result.
    assert!(!engine.can(ALICE, "read", &country(ITALY)).await.unwrap());

    engine.grant(Subject::Group(1), "reader", &country(ITALY)).await.unwrap();
    assert!(engine.can(ALICE, "read", &country(ITALY)).await.unwrap());

    engine.revoke(1, "reader", &country(ITALY)).await.unwrap();
    assert!(!engine.can(ALICE, "read", &country(ITALY)).await.unwrap());

    // Assignment changes invalidate the permission→roles map.
    assert!(!engine.can(ALICE, "write", &country(ITALY)).await.unwrap());
    engine.grant(Subject::Group(1), "reader", &country(ITALY)).await.unwrap();
    engine.assign("reader", &["write"]).await.unwrap();
    assert!(engine.can(ALICE, "write", &country(ITALY)).await.unwrap());
}

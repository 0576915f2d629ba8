#![allow(dead_code)]

use sea_query::{Alias, ColumnDef, Query, SimpleExpr, Table, TableCreateStatement, Value};
use std::sync::Arc;
use warden_cache::MemoryStore;
use warden_database::{Executor, SqliteExecutor};
use warden_engine::{Engine, EngineBuilder};
use warden_schema::{ModelBuilder, SchemaRegistry};

pub struct Fixture {
    pub engine: Engine,
    pub kv: Arc<MemoryStore>,
    pub db: Arc<dyn Executor>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub const ALICE: i64 = 1;
pub const BOB: i64 = 2;
pub const CHARLIE: i64 = 3;

pub const ITALY: i64 = 1;
pub const FRANCE: i64 = 2;
pub const GERMANY: i64 = 3;

pub const LOMBARDY: i64 = 1;
pub const SICILY: i64 = 2;
pub const ILE_DE_FRANCE: i64 = 3;
pub const AIN: i64 = 4;
pub const BAVARIA: i64 = 5;
pub const NORTH_GERMANY: i64 = 6;

pub const MILAN: i64 = 1;
pub const BERGAMO: i64 = 2;
pub const PALERMO: i64 = 3;
pub const CATANIA: i64 = 4;
pub const PARIS: i64 = 5;
pub const CALAIS: i64 = 6;
pub const ANNECY: i64 = 7;
pub const LYON: i64 = 8;
pub const MUNICH: i64 = 9;
pub const BERLIN: i64 = 10;
pub const BONN: i64 = 11;

/// Country 1→* Department 1→* City, plus Person with Job/Hobby/City edges.
pub fn geo_schema() -> SchemaRegistry {
    SchemaRegistry::builder()
        .model(
            ModelBuilder::new("country")
                .column("name")
                .column("president_id"),
        )
        .model(
            ModelBuilder::new("department")
                .column("name")
                .column("president_id")
                .belongs_to("country", "country", "country_id", Some("departments")),
        )
        .model(
            ModelBuilder::new("city")
                .column("name")
                .column("mayor_id")
                .belongs_to("department", "department", "department_id", Some("cities")),
        )
        .model(ModelBuilder::new("job").column("name"))
        .model(ModelBuilder::new("hobby").column("name"))
        .model(
            ModelBuilder::new("person")
                .column("name")
                .belongs_to("job", "job", "job_id", Some("people"))
                .belongs_to("hobby", "hobby", "hobby_id", Some("people"))
                .belongs_to("city", "city", "city_id", Some("people")),
        )
        .build()
        .expect("geo schema")
}

fn id_col() -> ColumnDef {
    ColumnDef::new(Alias::new("id"))
        .integer()
        .not_null()
        .primary_key()
        .to_owned()
}

fn named(table: &str, extra_ints: &[&str]) -> TableCreateStatement {
    let mut stmt = Table::create();
    stmt.table(Alias::new(table))
        .col(id_col())
        .col(ColumnDef::new(Alias::new("name")).string().not_null());
    for column in extra_ints {
        stmt.col(ColumnDef::new(Alias::new(*column)).integer());
    }
    stmt.to_owned()
}

pub async fn insert_rows(
    db: &Arc<dyn Executor>,
    table: &str,
    columns: &[&str],
    rows: Vec<Vec<Value>>,
) {
    let mut stmt = Query::insert();
    stmt.into_table(Alias::new(table))
        .columns(columns.iter().map(|c| Alias::new(*c)));
    for row in rows {
        stmt.values(row.into_iter().map(SimpleExpr::from))
            .expect("row arity");
    }
    db.execute(&stmt.to_owned().into()).await.expect("insert");
}

fn null() -> Value {
    Value::BigInt(None)
}

async fn create_geo_tables(db: &Arc<dyn Executor>) {
    for stmt in [
        named("country", &["president_id"]),
        named("department", &["president_id", "country_id"]),
        named("city", &["mayor_id", "department_id"]),
        named("job", &[]),
        named("hobby", &[]),
        named("person", &["job_id", "hobby_id", "city_id"]),
    ] {
        db.create_table(&stmt).await.expect("create table");
    }
}

async fn insert_geo_data(db: &Arc<dyn Executor>) {
    insert_rows(
        db,
        "country",
        &["id", "name", "president_id"],
        vec![
            vec![ITALY.into(), "Italy".into(), BOB.into()],
            vec![FRANCE.into(), "France".into(), BOB.into()],
            vec![GERMANY.into(), "Germany".into(), null()],
        ],
    )
    .await;
    insert_rows(
        db,
        "department",
        &["id", "name", "president_id", "country_id"],
        vec![
            vec![LOMBARDY.into(), "Lombardy".into(), null(), ITALY.into()],
            vec![SICILY.into(), "Sicily".into(), null(), ITALY.into()],
            vec![
                ILE_DE_FRANCE.into(),
                "Ile de France".into(),
                null(),
                FRANCE.into(),
            ],
            vec![AIN.into(), "Ain".into(), ALICE.into(), FRANCE.into()],
            vec![BAVARIA.into(), "Bavaria".into(), CHARLIE.into(), GERMANY.into()],
            vec![
                NORTH_GERMANY.into(),
                "North Germany".into(),
                null(),
                GERMANY.into(),
            ],
        ],
    )
    .await;
    insert_rows(
        db,
        "city",
        &["id", "name", "mayor_id", "department_id"],
        vec![
            vec![MILAN.into(), "Milan".into(), null(), LOMBARDY.into()],
            vec![BERGAMO.into(), "Bergamo".into(), null(), LOMBARDY.into()],
            vec![PALERMO.into(), "Palermo".into(), ALICE.into(), SICILY.into()],
            vec![CATANIA.into(), "Catania".into(), null(), SICILY.into()],
            vec![PARIS.into(), "Paris".into(), null(), ILE_DE_FRANCE.into()],
            vec![CALAIS.into(), "Calais".into(), null(), ILE_DE_FRANCE.into()],
            vec![ANNECY.into(), "Annecy".into(), null(), AIN.into()],
            vec![LYON.into(), "Lyon".into(), null(), AIN.into()],
            vec![MUNICH.into(), "Munich".into(), null(), BAVARIA.into()],
            vec![BERLIN.into(), "Berlin".into(), null(), NORTH_GERMANY.into()],
            vec![BONN.into(), "Bonn".into(), null(), NORTH_GERMANY.into()],
        ],
    )
    .await;
    insert_rows(
        db,
        "job",
        &["id", "name"],
        vec![
            vec![1.into(), "Engineer".into()],
            vec![2.into(), "Architect".into()],
            vec![3.into(), "Designer".into()],
            vec![4.into(), "Programmer".into()],
            vec![5.into(), "Sales".into()],
        ],
    )
    .await;
    insert_rows(
        db,
        "hobby",
        &["id", "name"],
        vec![
            vec![1.into(), "Soccer".into()],
            vec![2.into(), "Football".into()],
            vec![3.into(), "Basketball".into()],
            vec![4.into(), "Baseball".into()],
            vec![5.into(), "Tennis".into()],
        ],
    )
    .await;
    insert_rows(
        db,
        "person",
        &["id", "name", "job_id", "hobby_id", "city_id"],
        vec![
            vec![1.into(), "John".into(), 1.into(), 5.into(), CATANIA.into()],
            vec![2.into(), "Jane".into(), 5.into(), 5.into(), PALERMO.into()],
            vec![3.into(), "Joe".into(), 3.into(), 2.into(), MILAN.into()],
            vec![4.into(), "Jill".into(), 4.into(), 3.into(), MILAN.into()],
        ],
    )
    .await;
}

/// alice/bob/charlie, each member of a group named after them.
pub async fn seed_users(engine: &Engine) {
    let store = engine.store();
    for name in ["alice", "bob", "charlie"] {
        let user_id = store.create_user(name).await.expect("user");
        let group_id = store
            .create_group(&warden_models::NewGroup {
                name: name.to_string(),
                is_personal: false,
                owner_id: None,
            })
            .await
            .expect("group");
        store
            .add_membership(user_id, group_id)
            .await
            .expect("membership");
    }
}

/// The original role catalogue: admin, read-only, editor.
pub async fn seed_roles(engine: &Engine) {
    for (role, permissions) in [
        ("admin", vec!["create", "read", "update", "delete"]),
        ("read-only", vec!["read"]),
        ("editor", vec!["create", "update"]),
    ] {
        engine.assign(role, &permissions).await.expect("assign");
    }
}

pub async fn geo_fixture(configure: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Fixture {
    init_tracing();
    let executor = SqliteExecutor::in_memory().await.expect("sqlite");
    let db: Arc<dyn Executor> = Arc::new(executor);
    create_geo_tables(&db).await;
    insert_geo_data(&db).await;

    let kv = Arc::new(MemoryStore::new());
    let builder = Engine::builder(geo_schema(), Arc::clone(&db))
        .kv_store(kv.clone());
    let engine = configure(builder).build().expect("engine");
    engine.install().await.expect("install");
    seed_users(&engine).await;

    Fixture { engine, kv, db }
}

// -- filesystem scenario ----------------------------------------------------

pub const MOUNT_ROOT: i64 = 1;
pub const HOME: i64 = 1;
pub const ALICE_HOME: i64 = 2;
pub const BOB_HOME: i64 = 3;
pub const ALICE_DESKTOP: i64 = 4;
pub const ALICE_DOCUMENTS: i64 = 5;
pub const BOB_STUFF: i64 = 6;

/// MountPoint, self-recursive Folder and File.
pub fn fs_schema() -> SchemaRegistry {
    SchemaRegistry::builder()
        .model(ModelBuilder::new("mountpoint").column("name"))
        .model(
            ModelBuilder::new("folder")
                .column("name")
                .belongs_to("parent", "folder", "parent_id", Some("children"))
                .belongs_to("mountpoint", "mountpoint", "mount_id", Some("folders")),
        )
        .model(
            ModelBuilder::new("file")
                .column("name")
                .belongs_to("folder", "folder", "folder_id", Some("files")),
        )
        .build()
        .expect("fs schema")
}

async fn create_fs_tables(db: &Arc<dyn Executor>) {
    for stmt in [
        named("mountpoint", &[]),
        named("folder", &["parent_id", "mount_id"]),
        named("file", &["folder_id"]),
    ] {
        db.create_table(&stmt).await.expect("create table");
    }
}

async fn insert_fs_data(db: &Arc<dyn Executor>) {
    insert_rows(
        db,
        "mountpoint",
        &["id", "name"],
        vec![vec![MOUNT_ROOT.into(), "root".into()]],
    )
    .await;
    insert_rows(
        db,
        "folder",
        &["id", "name", "parent_id", "mount_id"],
        vec![
            vec![HOME.into(), "home".into(), null(), MOUNT_ROOT.into()],
            vec![ALICE_HOME.into(), "alice".into(), HOME.into(), MOUNT_ROOT.into()],
            vec![BOB_HOME.into(), "bob".into(), HOME.into(), MOUNT_ROOT.into()],
            vec![
                ALICE_DESKTOP.into(),
                "Desktop".into(),
                ALICE_HOME.into(),
                MOUNT_ROOT.into(),
            ],
            vec![
                ALICE_DOCUMENTS.into(),
                "Documents".into(),
                ALICE_HOME.into(),
                MOUNT_ROOT.into(),
            ],
            vec![
                BOB_STUFF.into(),
                "Stuff".into(),
                BOB_HOME.into(),
                MOUNT_ROOT.into(),
            ],
        ],
    )
    .await;
    insert_rows(
        db,
        "file",
        &["id", "name", "folder_id"],
        vec![
            vec![1.into(), "a.txt".into(), ALICE_DESKTOP.into()],
            vec![2.into(), "b.txt".into(), ALICE_DOCUMENTS.into()],
            vec![3.into(), "c.txt".into(), ALICE_HOME.into()],
            vec![4.into(), "d.txt".into(), BOB_HOME.into()],
            vec![5.into(), "e.txt".into(), BOB_STUFF.into()],
            vec![6.into(), "root.txt".into(), HOME.into()],
        ],
    )
    .await;
}

pub async fn fs_fixture(configure: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Fixture {
    init_tracing();
    let executor = SqliteExecutor::in_memory().await.expect("sqlite");
    let db: Arc<dyn Executor> = Arc::new(executor);
    create_fs_tables(&db).await;
    insert_fs_data(&db).await;

    let kv = Arc::new(MemoryStore::new());
    let builder = Engine::builder(fs_schema(), Arc::clone(&db))
        .kv_store(kv.clone());
    let engine = configure(builder).build().expect("engine");
    engine.install().await.expect("install");
    seed_users(&engine).await;

    Fixture { engine, kv, db }
}

/// Ids returned by running `query` against the fixture database.
pub async fn fetch_ids(db: &Arc<dyn Executor>, query: &warden_engine::Select) -> Vec<i64> {
    let stmt = Query::select()
        .column((Alias::new("q"), Alias::new("id")))
        .from_subquery(query.statement().clone(), Alias::new("q"))
        .to_owned();
    let rows = db.fetch_all(&stmt).await.expect("fetch");
    let mut ids: Vec<i64> = rows.iter().map(|row| row.i64(0).expect("id")).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

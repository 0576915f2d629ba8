use crate::error::{DatabaseError, Result};
use async_trait::async_trait;
use sea_query::{
    Alias, DeleteStatement, InsertStatement, PostgresQueryBuilder, Query, SelectStatement,
    SqliteQueryBuilder, TableCreateStatement, UpdateStatement,
};
use sqlx::postgres::PgRow;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{PgPool, Row, SqlitePool, TypeInfo, ValueRef};

/// A decoded cell. The engine only ever selects integer keys, names and
/// flags, so this stays deliberately small.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Text(String),
    Bool(bool),
    Null,
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// SQLite surfaces booleans as integers; accept both.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(v) => Some(*v),
            SqlValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// One positionally-decoded result row.
#[derive(Debug, Clone)]
pub struct SqlRow(Vec<SqlValue>);

impl SqlRow {
    pub fn get(&self, idx: usize) -> &SqlValue {
        self.0.get(idx).unwrap_or(&SqlValue::Null)
    }

    pub fn i64(&self, idx: usize) -> Result<i64> {
        self.get(idx)
            .as_i64()
            .ok_or_else(|| DatabaseError::Decode(format!("column {} is not an integer", idx)))
    }

    pub fn opt_i64(&self, idx: usize) -> Result<Option<i64>> {
        let value = self.get(idx);
        if value.is_null() {
            return Ok(None);
        }
        self.i64(idx).map(Some)
    }

    pub fn text(&self, idx: usize) -> Result<String> {
        self.get(idx)
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DatabaseError::Decode(format!("column {} is not text", idx)))
    }

    pub fn opt_text(&self, idx: usize) -> Result<Option<String>> {
        let value = self.get(idx);
        if value.is_null() {
            return Ok(None);
        }
        self.text(idx).map(Some)
    }

    pub fn bool(&self, idx: usize) -> Result<bool> {
        self.get(idx)
            .as_bool()
            .ok_or_else(|| DatabaseError::Decode(format!("column {} is not a boolean", idx)))
    }
}

/// A mutation to run through an [`Executor`].
#[derive(Debug, Clone)]
pub enum WriteStatement {
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl From<InsertStatement> for WriteStatement {
    fn from(stmt: InsertStatement) -> Self {
        WriteStatement::Insert(stmt)
    }
}

impl From<UpdateStatement> for WriteStatement {
    fn from(stmt: UpdateStatement) -> Self {
        WriteStatement::Update(stmt)
    }
}

impl From<DeleteStatement> for WriteStatement {
    fn from(stmt: DeleteStatement) -> Self {
        WriteStatement::Delete(stmt)
    }
}

/// Async access to the backing database. Statements are sea-query values;
/// each implementation renders them for its own backend.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn fetch_all(&self, stmt: &SelectStatement) -> Result<Vec<SqlRow>>;

    async fn execute(&self, stmt: &WriteStatement) -> Result<u64>;

    /// Run several writes inside one transaction; either all commit or none.
    async fn execute_batch(&self, stmts: &[WriteStatement]) -> Result<u64>;

    /// Insert and return the generated primary key.
    async fn insert_returning_id(&self, stmt: &InsertStatement) -> Result<i64>;

    async fn create_table(&self, stmt: &TableCreateStatement) -> Result<()>;
}

fn with_returning_id(stmt: &InsertStatement) -> InsertStatement {
    let mut stmt = stmt.clone();
    stmt.returning(Query::returning().column(Alias::new("id")));
    stmt
}

// ---------------------------------------------------------------------------
// PostgreSQL

#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_pg(row: &PgRow) -> Result<SqlRow> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_uppercase();
        let value = match type_name.as_str() {
            "INT2" => SqlValue::Int(row.try_get::<i16, _>(idx)? as i64),
            "INT4" => SqlValue::Int(row.try_get::<i32, _>(idx)? as i64),
            "INT8" => SqlValue::Int(row.try_get::<i64, _>(idx)?),
            "BOOL" => SqlValue::Bool(row.try_get::<bool, _>(idx)?),
            _ => SqlValue::Text(row.try_get::<String, _>(idx)?),
        };
        values.push(value);
    }
    Ok(SqlRow(values))
}

fn render_pg(stmt: &WriteStatement) -> String {
    match stmt {
        WriteStatement::Insert(s) => s.to_string(PostgresQueryBuilder),
        WriteStatement::Update(s) => s.to_string(PostgresQueryBuilder),
        WriteStatement::Delete(s) => s.to_string(PostgresQueryBuilder),
    }
}

#[async_trait]
impl Executor for PgExecutor {
    async fn fetch_all(&self, stmt: &SelectStatement) -> Result<Vec<SqlRow>> {
        let sql = stmt.to_string(PostgresQueryBuilder);
        tracing::trace!(%sql, "fetch");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(decode_pg).collect()
    }

    async fn execute(&self, stmt: &WriteStatement) -> Result<u64> {
        let sql = render_pg(stmt);
        tracing::trace!(%sql, "execute");
        Ok(sqlx::query(&sql).execute(&self.pool).await?.rows_affected())
    }

    async fn execute_batch(&self, stmts: &[WriteStatement]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for stmt in stmts {
            let sql = render_pg(stmt);
            affected += sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn insert_returning_id(&self, stmt: &InsertStatement) -> Result<i64> {
        let sql = with_returning_id(stmt).to_string(PostgresQueryBuilder);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        decode_pg(&row)?.i64(0)
    }

    async fn create_table(&self, stmt: &TableCreateStatement) -> Result<()> {
        let sql = stmt.to_string(PostgresQueryBuilder);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite

#[derive(Clone)]
pub struct SqliteExecutor {
    pool: SqlitePool,
}

impl SqliteExecutor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// A private in-memory database. Pinned to one connection, otherwise
    /// every pooled connection would see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }
}

fn decode_sqlite(row: &SqliteRow) -> Result<SqlRow> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_uppercase();
        let value = match type_name.as_str() {
            "INTEGER" | "INT" | "BIGINT" => SqlValue::Int(row.try_get::<i64, _>(idx)?),
            "BOOLEAN" => SqlValue::Bool(row.try_get::<bool, _>(idx)?),
            _ => SqlValue::Text(row.try_get::<String, _>(idx)?),
        };
        values.push(value);
    }
    Ok(SqlRow(values))
}

fn render_sqlite(stmt: &WriteStatement) -> String {
    match stmt {
        WriteStatement::Insert(s) => s.to_string(SqliteQueryBuilder),
        WriteStatement::Update(s) => s.to_string(SqliteQueryBuilder),
        WriteStatement::Delete(s) => s.to_string(SqliteQueryBuilder),
    }
}

#[async_trait]
impl Executor for SqliteExecutor {
    async fn fetch_all(&self, stmt: &SelectStatement) -> Result<Vec<SqlRow>> {
        let sql = stmt.to_string(SqliteQueryBuilder);
        tracing::trace!(%sql, "fetch");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(decode_sqlite).collect()
    }

    async fn execute(&self, stmt: &WriteStatement) -> Result<u64> {
        let sql = render_sqlite(stmt);
        tracing::trace!(%sql, "execute");
        Ok(sqlx::query(&sql).execute(&self.pool).await?.rows_affected())
    }

    async fn execute_batch(&self, stmts: &[WriteStatement]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for stmt in stmts {
            let sql = render_sqlite(stmt);
            affected += sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn insert_returning_id(&self, stmt: &InsertStatement) -> Result<i64> {
        let sql = with_returning_id(stmt).to_string(SqliteQueryBuilder);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        decode_sqlite(&row)?.i64(0)
    }

    async fn create_table(&self, stmt: &TableCreateStatement) -> Result<()> {
        let sql = stmt.to_string(SqliteQueryBuilder);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

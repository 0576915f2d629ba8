use crate::error::{AuthzError, Result};
use sea_query::{Alias, Asterisk, Condition, Expr, Order, Query, SelectStatement, SimpleExpr};

/// A select over one target model, carrying the FROM/JOIN bookkeeping the
/// rewriter needs. The wrapped statement is only ever appended to: existing
/// columns, joins and ordering stay untouched.
#[derive(Debug, Clone)]
pub struct Select {
    from: Vec<String>,
    joined: Vec<String>,
    stmt: SelectStatement,
}

impl Select {
    /// `SELECT * FROM table`.
    pub fn from_table(table: impl Into<String>) -> Self {
        let table = table.into();
        let stmt = Query::select()
            .column(Asterisk)
            .from(Alias::new(&table))
            .to_owned();
        Self {
            from: vec![table],
            joined: Vec::new(),
            stmt,
        }
    }

    /// An explicit projection instead of `*`.
    pub fn with_columns(table: impl Into<String>, columns: &[&str]) -> Self {
        let table = table.into();
        let mut stmt = Query::select();
        for column in columns {
            stmt.column((Alias::new(&table), Alias::new(*column)));
        }
        stmt.from(Alias::new(&table));
        Self {
            from: vec![table],
            joined: Vec::new(),
            stmt: stmt.to_owned(),
        }
    }

    /// A cartesian select over several tables; such a query has no single
    /// rewrite target.
    pub fn from_tables(tables: &[&str]) -> Self {
        let mut stmt = Query::select();
        stmt.column(Asterisk);
        for table in tables {
            stmt.from(Alias::new(*table));
        }
        Self {
            from: tables.iter().map(|t| t.to_string()).collect(),
            joined: Vec::new(),
            stmt: stmt.to_owned(),
        }
    }

    pub fn and_where(mut self, expr: SimpleExpr) -> Self {
        self.stmt.and_where(expr);
        self
    }

    pub fn order_by(mut self, table: &str, column: &str, order: Order) -> Self {
        self.stmt
            .order_by((Alias::new(table), Alias::new(column)), order);
        self
    }

    /// Join added by the caller before rewriting; recorded so the rewriter
    /// skips duplicates.
    pub fn inner_join(mut self, table: &str, on: SimpleExpr) -> Self {
        self.stmt.inner_join(Alias::new(table), on);
        self.joined.push(table.to_string());
        self
    }

    /// The single table this query selects from.
    pub fn target(&self) -> Result<&str> {
        match self.from.as_slice() {
            [table] => Ok(table),
            _ => Err(AuthzError::AmbiguousTarget),
        }
    }

    pub fn has_join(&self, table: &str) -> bool {
        self.joined.iter().any(|t| t == table) || self.from.iter().any(|t| t == table)
    }

    pub(crate) fn append_left_join(&mut self, table: &str, on: SimpleExpr) {
        self.stmt.left_join(Alias::new(table), on);
        self.joined.push(table.to_string());
    }

    pub(crate) fn append_condition(&mut self, condition: Condition) {
        self.stmt.cond_where(condition);
    }

    pub(crate) fn append_false(&mut self) {
        self.stmt.and_where(Expr::value(false));
    }

    pub fn statement(&self) -> &SelectStatement {
        &self.stmt
    }

    pub fn into_statement(self) -> SelectStatement {
        self.stmt
    }
}

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// A named bundle of permissions, grantable to a group in a context.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: i64,
    pub name: String,
    /// Comma-separated whitelist of context tables this role may be granted
    /// on. Unset means all tables.
    pub tables: Option<String>,
}

impl Role {
    pub fn allows_table(&self, table: &str) -> bool {
        match self.tables.as_deref() {
            None | Some("") => true,
            Some(list) => list.split(',').any(|t| t.trim() == table),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewRole {
    #[validate(length(min = 1, max = 150))]
    pub name: String,

    pub tables: Option<String>,
}

impl NewRole {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: None,
        }
    }
}

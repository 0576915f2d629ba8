use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// An atomic named privilege. A global permission authorizes in any context
/// once the user holds a role bearing it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Permission {
    pub id: i64,
    pub name: String,
    pub is_global: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewPermission {
    #[validate(length(min = 1, max = 150))]
    pub name: String,

    pub is_global: bool,
}

impl NewPermission {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_global: false,
        }
    }
}

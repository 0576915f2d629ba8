use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// A named set of users; the unit roles are granted to.
///
/// A personal group is the singleton container materialized when a grant is
/// expressed against a user rather than a group.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub is_personal: bool,
    pub owner_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewGroup {
    #[validate(length(min = 1, max = 150))]
    pub name: String,

    pub is_personal: bool,

    pub owner_id: Option<i64>,
}

impl NewGroup {
    /// The personal group created on demand for `user_id`.
    pub fn personal(user_id: i64) -> Self {
        Self {
            name: format!("private:{}", user_id),
            is_personal: true,
            owner_id: Some(user_id),
        }
    }
}

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Membership of a user in a group; primary key is the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Membership {
    pub user_id: i64,
    pub group_id: i64,
}

/// Assignment of a permission to a role; primary key is the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RolePermission {
    pub role_id: i64,
    pub permission_id: i64,
}

/// The unit of contextual authorization: a role granted to a group in the
/// context of one database row. `("global", 0)` denotes the global context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RoleGrant {
    pub group_id: i64,
    pub role_id: i64,
    pub context_table: String,
    pub context_id: i64,
}

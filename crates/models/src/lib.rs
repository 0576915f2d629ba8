pub mod context;
pub mod error;
pub mod grant;
pub mod group;
pub mod permission;
pub mod role;
pub mod user;

// Re-export commonly used types
pub use context::{Context, ContextSet, GLOBAL_CONTEXT_ID, GLOBAL_TABLE};
pub use error::{ContextError, Result};
pub use grant::{Membership, RoleGrant, RolePermission};
pub use group::{Group, NewGroup};
pub use permission::{NewPermission, Permission};
pub use role::{NewRole, Role};
pub use user::User;

/// Table names the engine persists its own state into.
pub mod tables {
    pub const USERS: &str = "users";
    pub const GROUPS: &str = "groups";
    pub const ROLES: &str = "roles";
    pub const PERMISSIONS: &str = "permissions";
    pub const MEMBERSHIPS: &str = "memberships";
    pub const ROLE_PERMISSIONS: &str = "role_permissions";
    pub const ROLE_GRANTS: &str = "role_grants";
}

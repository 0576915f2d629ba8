use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuthzError>;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("grant rejected: {0}")]
    GrantRejected(String),

    #[error(transparent)]
    Context(#[from] warden_models::ContextError),

    #[error(transparent)]
    Schema(#[from] warden_schema::SchemaError),

    #[error("cannot determine a single target table for the query")]
    AmbiguousTarget,

    #[error("checker cannot be rewritten as a query predicate")]
    NotRewritable,

    #[error(transparent)]
    Database(#[from] warden_database::DatabaseError),

    #[error(transparent)]
    Cache(#[from] warden_cache::CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuthzError {
    /// I/O-shaped failures collapse to a deny in `can`/`has_permission`;
    /// everything else is a programmer error and surfaces.
    pub(crate) fn is_lookup_failure(&self) -> bool {
        matches!(
            self,
            AuthzError::Database(_) | AuthzError::Cache(_) | AuthzError::Serialization(_)
        )
    }
}

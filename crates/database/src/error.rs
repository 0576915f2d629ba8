use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Query build error: {0}")]
    QueryBuild(#[from] sea_query::error::Error),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unexpected row shape: {0}")]
    Decode(String),
}

impl DatabaseError {
    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{} with id {} not found", entity, id))
    }
}

impl From<validator::ValidationErrors> for DatabaseError {
    fn from(err: validator::ValidationErrors) -> Self {
        DatabaseError::InvalidInput(err.to_string())
    }
}

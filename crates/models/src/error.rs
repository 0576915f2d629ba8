use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("model mismatch: {left} vs {right}")]
    ModelMismatch { left: String, right: String },
}

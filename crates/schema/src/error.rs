use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchemaError>;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model {model} has no attribute {attribute}")]
    UnknownAttribute { model: String, attribute: String },

    #[error("model {model} has no relationship {relation}")]
    UnknownRelation { model: String, relation: String },

    #[error("relationship {model}.{relation} has no inverse")]
    NoInverse { model: String, relation: String },

    #[error("relationship {model}.{relation} is missing its column mapping")]
    InvalidRelation { model: String, relation: String },

    #[error("duplicate model definition: {0}")]
    DuplicateModel(String),

    #[error("duplicate attribute {attribute} on model {model}")]
    DuplicateAttribute { model: String, attribute: String },
}

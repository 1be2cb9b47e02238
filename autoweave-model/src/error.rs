use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid hex identifier: {0}")]
    InvalidHex(String),

    #[error("missing stream field: {0}")]
    MissingField(&'static str),

    #[error("invalid stream field {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

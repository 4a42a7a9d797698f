use thiserror::Error;

pub type AudienceResult<T> = Result<T, AudienceError>;

#[derive(Error, Debug)]
pub enum AudienceError {
    #[error("Invalid segment condition: {0}")]
    BadSegmentCondition(String),

    #[error("Invalid scoring condition: {0}")]
    BadScoringCondition(String),

    #[error("{item_type} '{id}' not found")]
    NotFound { item_type: &'static str, id: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AudienceError {
    fn from(e: config::ConfigError) -> Self {
        AudienceError::Config(e.to_string())
    }
}

//! Crate-level error type for the query layer and binary

use crate::config::ConfigError;
use crate::encoding::EncodingError;
use crate::retrieval::RetrievalError;
use crate::vision::ChatError;

#[derive(Debug, thiserror::Error)]
pub enum DoculensError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("No matching pages found for query: {0}")]
    NoResults(String),

    #[error("Backend not configured: {0}")]
    BackendUnavailable(String),
}

pub type Result<T> = std::result::Result<T, DoculensError>;

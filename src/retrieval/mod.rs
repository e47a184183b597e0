//! Page retrieval over an indexed document collection
//!
//! Indexing and search run in an external service; this module only defines
//! the seam the query layer consumes and an HTTP client for it.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::encoding::{decode_base64_image, EncodingError};

pub use client::{RemoteRetriever, RetrievalConfig};

/// Retrieval error types
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid page image: {0}")]
    Image(#[from] EncodingError),
}

/// A page returned by a search, with its rendered image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMatch {
    pub doc_id: u32,
    pub page_num: u32,
    pub score: f32,
    /// Base64-encoded page image
    pub base64: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl PageMatch {
    /// Decode the page image to raw bytes
    pub fn image_bytes(&self) -> Result<Vec<u8>, RetrievalError> {
        Ok(decode_base64_image(&self.base64)?)
    }
}

/// Acknowledgement returned after indexing a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSummary {
    pub index_name: String,
    #[serde(default)]
    pub pages_indexed: Option<u32>,
}

/// Search and indexing over page images
#[async_trait]
pub trait PageRetriever: Send + Sync {
    /// Index a document, optionally replacing an existing index of the same name
    async fn index(
        &self,
        document_path: &str,
        index_name: &str,
        overwrite: bool,
    ) -> Result<IndexSummary, RetrievalError>;

    /// Return up to `k` best-matching pages, best first
    async fn search(&self, query: &str, k: usize) -> Result<Vec<PageMatch>, RetrievalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_image_decoding() {
        let page = PageMatch {
            doc_id: 0,
            page_num: 9,
            score: 17.5,
            base64: "aGVsbG8=".to_string(),
            metadata: Default::default(),
        };
        assert_eq!(page.image_bytes().unwrap(), b"hello");

        let broken = PageMatch {
            base64: "%%%".to_string(),
            ..page
        };
        assert!(matches!(broken.image_bytes(), Err(RetrievalError::Image(_))));
    }
}

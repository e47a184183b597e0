//! HTTP client for an external page index service

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{IndexSummary, PageMatch, PageRetriever, RetrievalError};

/// Index service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Index service URL
    #[serde(default = "default_service_url")]
    pub service_url: String,

    /// Index queried and (re)built by this application
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Document indexed by the `index` command
    #[serde(default = "default_document_path")]
    pub document_path: String,

    /// Request timeout in seconds; indexing large PDFs is slow
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_service_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_index_name() -> String {
    "attention".to_string()
}

fn default_document_path() -> String {
    "docs/attention.pdf".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
            index_name: default_index_name(),
            document_path: default_document_path(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Page retriever backed by a remote index service
pub struct RemoteRetriever {
    config: RetrievalConfig,
    client: Client,
}

impl RemoteRetriever {
    pub fn new(config: RetrievalConfig) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RetrievalError::RequestFailed(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.service_url.trim_end_matches('/'), path)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, RetrievalError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RetrievalError::Timeout(e.to_string())
                } else {
                    RetrievalError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RetrievalError::UpstreamError(format!(
                "Status {}: {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RetrievalError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl PageRetriever for RemoteRetriever {
    async fn index(
        &self,
        document_path: &str,
        index_name: &str,
        overwrite: bool,
    ) -> Result<IndexSummary, RetrievalError> {
        debug!("Indexing document: path={}, index={}", document_path, index_name);

        let request = IndexRequest {
            input_path: document_path,
            index_name,
            store_collection_with_index: true,
            overwrite,
        };

        self.post("index", &request).await
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<PageMatch>, RetrievalError> {
        debug!("Searching pages: query={}, k={}", query, k);

        let request = SearchRequest {
            query,
            k,
            index_name: &self.config.index_name,
        };

        let response: SearchResponse = self.post("search", &request).await?;
        Ok(response.results)
    }
}

#[derive(Debug, Serialize)]
struct IndexRequest<'a> {
    input_path: &'a str,
    index_name: &'a str,
    store_collection_with_index: bool,
    overwrite: bool,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    k: usize,
    index_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<PageMatch>,
}

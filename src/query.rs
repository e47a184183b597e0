//! Document query orchestration: retrieve the best page, then ask a vision model about it

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DoculensError, Result};
use crate::retrieval::{PageMatch, PageRetriever};
use crate::vision::{ChatOptions, ChatResponse, SharedVisionChatModel};

/// Selectable chat backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    #[serde(alias = "gpt-4o")]
    OpenAi,
    #[serde(alias = "claude")]
    Anthropic,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "gpt-4o" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            other => Err(format!("unknown backend '{}', expected openai or anthropic", other)),
        }
    }
}

/// Answer to a document query
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub backend: Backend,
    pub doc_id: u32,
    pub page_num: u32,
    pub score: f32,
    pub response: ChatResponse,
}

/// Runs retrieve-then-chat queries against the registered backends
pub struct DocumentQuery {
    retriever: Arc<dyn PageRetriever>,
    backends: HashMap<Backend, SharedVisionChatModel>,
}

impl DocumentQuery {
    pub fn new(retriever: Arc<dyn PageRetriever>) -> Self {
        Self {
            retriever,
            backends: HashMap::new(),
        }
    }

    pub fn with_backend(mut self, backend: Backend, model: SharedVisionChatModel) -> Self {
        self.backends.insert(backend, model);
        self
    }

    pub fn has_backend(&self, backend: Backend) -> bool {
        self.backends.contains_key(&backend)
    }

    /// Top page for the query
    pub async fn best_page(&self, query: &str) -> Result<PageMatch> {
        let mut results = self.retriever.search(query, 1).await?;
        debug!("Search returned {} result(s)", results.len());

        if results.is_empty() {
            return Err(DoculensError::NoResults(query.to_string()));
        }

        Ok(results.swap_remove(0))
    }

    /// Retrieve the best page for `query` and ask `backend` about it
    pub async fn ask(
        &self,
        query: &str,
        backend: Backend,
        options: &ChatOptions,
    ) -> Result<QueryAnswer> {
        let model = self
            .backends
            .get(&backend)
            .ok_or_else(|| DoculensError::BackendUnavailable(backend.to_string()))?;

        let page = self.best_page(query).await?;
        let image = page.image_bytes()?;

        info!(
            "Querying {} ({}) with page {} of document {}",
            backend,
            model.model(),
            page.page_num,
            page.doc_id
        );

        let response = model.chat(image.into(), query, options).await?;

        Ok(QueryAnswer {
            backend,
            doc_id: page.doc_id,
            page_num: page.page_num,
            score: page.score,
            response,
        })
    }

    /// Unload every registered backend
    pub fn shutdown(&self) {
        for model in self.backends.values() {
            model.unload();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("openai".parse::<Backend>().unwrap(), Backend::OpenAi);
        assert_eq!("GPT-4O".parse::<Backend>().unwrap(), Backend::OpenAi);
        assert_eq!("Claude".parse::<Backend>().unwrap(), Backend::Anthropic);
        assert!("llava".parse::<Backend>().is_err());
    }

    #[test]
    fn test_backend_serde() {
        assert_eq!(serde_json::to_string(&Backend::Anthropic).unwrap(), "\"anthropic\"");
        assert_eq!(
            serde_json::from_str::<Backend>("\"claude\"").unwrap(),
            Backend::Anthropic
        );
    }
}

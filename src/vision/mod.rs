//! Vision-language chat models
//!
//! [`VisionChatModel`] is the contract every backend implements: send one
//! image and a text prompt, get text back. Two hosted adapters are provided:
//! - [`OpenAiVisionChat`]: OpenAI-compatible chat completions
//! - [`AnthropicVisionChat`]: Anthropic messages API
//!
//! Each chat call is a single request attempt. Failures propagate to the
//! caller unchanged; there is no retry, caching, or fallback.

pub mod anthropic;
pub mod models;
pub mod openai;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::ChatMetrics;
use crate::telemetry::{GenerationGuard, GenerationStart, Telemetry};

pub use anthropic::{AnthropicConfig, AnthropicVisionChat};
pub use models::{ChatImages, ChatOptions, ChatResponse, ChatTurn, ImageDetail, SYSTEM_INSTRUCTION};
pub use openai::{OpenAiConfig, OpenAiVisionChat};

/// Vision chat error types
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Authentication failed (HTTP {status}): {body}")]
    Authentication { status: u16, body: String },

    #[error("Rate limited{}: {body}", .retry_after.map(|s| format!(" (retry after {}s)", s)).unwrap_or_default())]
    RateLimited { retry_after: Option<u64>, body: String },

    #[error("Upstream error (HTTP {status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ChatError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InvalidInput(_) => "invalid_input",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Authentication { .. } => "authentication",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream { .. } => "upstream",
            Self::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// A chat-capable vision-language model.
///
/// Local and hosted backends are interchangeable behind this trait.
#[async_trait]
pub trait VisionChatModel: Send + Sync {
    /// Backend identifier used in logs, metrics, and telemetry
    fn name(&self) -> &'static str;

    /// Model identifier sent to the backend
    fn model(&self) -> &str;

    /// Ask the model about the given image(s)
    ///
    /// Implementations may restrict how many images they accept, but must
    /// reject unsupported input instead of dropping images.
    async fn chat(
        &self,
        images: ChatImages,
        prompt: &str,
        options: &ChatOptions,
    ) -> Result<ChatResponse, ChatError>;

    /// Release backend resources. Idempotent and infallible; failures are logged.
    fn unload(&self);
}

/// Shared handle to any backend
pub type SharedVisionChatModel = Arc<dyn VisionChatModel>;

/// Run one chat request inside a generation span, recording metrics.
pub(crate) async fn observed<F>(
    telemetry: &dyn Telemetry,
    metrics: Option<&ChatMetrics>,
    start: GenerationStart,
    request: F,
) -> Result<ChatResponse, ChatError>
where
    F: Future<Output = Result<ChatResponse, ChatError>>,
{
    let started = Instant::now();
    let guard = GenerationGuard::start(telemetry, &start);

    let outcome = request.await;

    guard.finish(&outcome);
    if let Some(metrics) = metrics {
        let status = match &outcome {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics.record_chat(&start.backend, status, started.elapsed());
    }

    outcome
}

/// Map a reqwest send failure onto the chat error taxonomy
pub(crate) fn send_error(e: reqwest::Error) -> ChatError {
    if e.is_timeout() {
        ChatError::Timeout(e.to_string())
    } else {
        ChatError::Transport(e.to_string())
    }
}

/// Pass successful responses through, classify failure statuses
pub(crate) async fn check_status(response: Response) -> Result<Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChatError::Authentication {
            status: status.as_u16(),
            body,
        },
        StatusCode::TOO_MANY_REQUESTS => ChatError::RateLimited { retry_after, body },
        _ => ChatError::Upstream {
            status: status.as_u16(),
            body,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ChatError::RateLimited {
            retry_after: Some(20),
            body: "slow down".to_string(),
        };
        assert_eq!(err.to_string(), "Rate limited (retry after 20s): slow down");

        let err = ChatError::RateLimited {
            retry_after: None,
            body: "slow down".to_string(),
        };
        assert_eq!(err.to_string(), "Rate limited: slow down");

        let err = ChatError::Authentication {
            status: 401,
            body: "bad key".to_string(),
        };
        assert_eq!(err.kind(), "authentication");
        assert!(err.to_string().contains("401"));
    }
}

//! Data models for vision chat requests and responses

use super::ChatError;
use crate::telemetry::TraceContext;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// System instruction shared by the hosted adapters
pub const SYSTEM_INSTRUCTION: &str = "You are a helpful assistant that reads off pictures, \
extracting text passages and analyzing graphics.";

/// Request fields owned by the adapters; passthrough options may not override them.
pub(crate) const RESERVED_KEYS: &[&str] = &["model", "messages", "max_tokens", "temperature", "system"];

/// Image detail hint forwarded to the provider unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    High,
    Auto,
}

impl Default for ImageDetail {
    fn default() -> Self {
        Self::High
    }
}

impl ImageDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for ImageDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageDetail {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "high" => Ok(Self::High),
            "auto" => Ok(Self::Auto),
            other => Err(ChatError::InvalidInput(format!(
                "unknown image detail level '{}', expected one of low, high, auto",
                other
            ))),
        }
    }
}

/// Images attached to a chat call
///
/// The hosted adapters accept exactly one image per call. `Many` exists so
/// callers holding a list can pass it through; a list of any other length is
/// rejected rather than truncated.
#[derive(Debug, Clone)]
pub enum ChatImages {
    One(Bytes),
    Many(Vec<Bytes>),
}

impl ChatImages {
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(images) => images.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unwrap the single image, failing if there is not exactly one non-empty image
    pub fn into_single(self) -> Result<Bytes, ChatError> {
        let image = match self {
            Self::One(image) => image,
            Self::Many(mut images) => {
                if images.len() != 1 {
                    return Err(ChatError::InvalidInput(format!(
                        "exactly one image is supported per chat call, got {}",
                        images.len()
                    )));
                }
                images.remove(0)
            }
        };

        if image.is_empty() {
            return Err(ChatError::InvalidInput("image payload is empty".to_string()));
        }

        Ok(image)
    }
}

impl From<Bytes> for ChatImages {
    fn from(image: Bytes) -> Self {
        Self::One(image)
    }
}

impl From<Vec<u8>> for ChatImages {
    fn from(image: Vec<u8>) -> Self {
        Self::One(Bytes::from(image))
    }
}

impl From<&[u8]> for ChatImages {
    fn from(image: &[u8]) -> Self {
        Self::One(Bytes::copy_from_slice(image))
    }
}

impl From<Vec<Bytes>> for ChatImages {
    fn from(images: Vec<Bytes>) -> Self {
        Self::Many(images)
    }
}

/// Per-call generation options
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Output token budget, must be positive
    pub max_tokens: u32,
    pub temperature: f32,
    pub detail: ImageDetail,
    /// Transport timeout for this call; falls back to the client timeout
    pub timeout: Option<Duration>,
    /// Caller's active trace, linked as parent of the generation span
    pub trace: Option<TraceContext>,
    /// Provider-specific fields merged into the request body
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 300,
            temperature: 0.1,
            detail: ImageDetail::High,
            timeout: None,
            trace: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl ChatOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_detail(mut self, detail: ImageDetail) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Reject option values the providers would refuse anyway
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.max_tokens == 0 {
            return Err(ChatError::InvalidInput(
                "max_tokens must be a positive integer".to_string(),
            ));
        }

        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ChatError::InvalidInput(format!(
                "temperature must be a finite non-negative number, got {}",
                self.temperature
            )));
        }

        if let Some(key) = self.extra.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
            return Err(ChatError::InvalidInput(format!(
                "extra option '{}' conflicts with a field set by the adapter",
                key
            )));
        }

        Ok(())
    }
}

/// One prompt/answer exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub prompt: String,
    pub response: String,
}

/// Result of a chat call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    /// Conversation so far; single-turn adapters return only this exchange
    pub history: Vec<ChatTurn>,
}

impl ChatResponse {
    pub(crate) fn single_turn(prompt: &str, text: String) -> Self {
        Self {
            history: vec![ChatTurn {
                prompt: prompt.to_string(),
                response: text.clone(),
            }],
            text,
        }
    }
}

//! Vision chat over the Anthropic messages API

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::models::{ChatImages, ChatOptions, ChatResponse, SYSTEM_INSTRUCTION};
use super::{check_status, observed, send_error, ChatError, VisionChatModel};
use crate::encoding::{encode_bytes, sniff_media_type};
use crate::metrics::ChatMetrics;
use crate::telemetry::{GenerationStart, NoopTelemetry, Telemetry};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";

/// Anthropic adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicConfig {
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (read from env ANTHROPIC_API_KEY if not set)
    #[serde(default)]
    pub api_key: Option<SecretString>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model() -> String {
    "claude-3-5-sonnet-20240620".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl AnthropicConfig {
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(api_key.into()));
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn from_env(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }

    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.api_key.is_none() {
            if let Some(val) = lookup("ANTHROPIC_API_KEY") {
                self.api_key = Some(SecretString::new(val));
            }
        }

        if self.base_url.is_none() {
            self.base_url = lookup("ANTHROPIC_BASE_URL").filter(|v| !v.trim().is_empty());
        }

        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn endpoint(&self) -> String {
        let base = self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/v1/messages", base.trim_end_matches('/'))
    }
}

/// Hosted vision chat adapter for Anthropic models
///
/// Anthropic has no image detail setting, so [`ChatOptions::detail`] is
/// validated but not sent.
pub struct AnthropicVisionChat {
    http: Client,
    model: String,
    api_key: SecretString,
    endpoint: String,
    telemetry: Arc<dyn Telemetry>,
    metrics: Option<Arc<ChatMetrics>>,
}

impl AnthropicVisionChat {
    pub fn new(config: AnthropicConfig) -> Result<Self, ChatError> {
        Self::with_telemetry(config, Arc::new(NoopTelemetry))
    }

    pub fn with_telemetry(
        config: AnthropicConfig,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, ChatError> {
        let api_key = config
            .api_key
            .as_ref()
            .filter(|key| !key.expose_secret().trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                ChatError::Configuration(
                    "Anthropic API key is not set; configure api_key or ANTHROPIC_API_KEY"
                        .to_string(),
                )
            })?;

        let endpoint = config.endpoint();
        reqwest::Url::parse(&endpoint)
            .map_err(|e| ChatError::Configuration(format!("invalid base URL '{}': {}", endpoint, e)))?;

        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ChatError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            model: config.model,
            api_key,
            endpoint,
            telemetry,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<ChatMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn build_request<'a>(
        &'a self,
        image: &[u8],
        prompt: &'a str,
        options: &'a ChatOptions,
    ) -> MessagesRequest<'a> {
        let mut content = vec![ContentBlock::Image {
            source: ImageSource {
                kind: "base64",
                media_type: sniff_media_type(image),
                data: encode_bytes(image),
            },
        }];
        if !prompt.trim().is_empty() {
            content.push(ContentBlock::Text { text: prompt });
        }

        MessagesRequest {
            model: &self.model,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            system: SYSTEM_INSTRUCTION,
            messages: vec![UserMessage {
                role: "user",
                content,
            }],
            extra: &options.extra,
        }
    }

    async fn complete(
        &self,
        image: &[u8],
        prompt: &str,
        options: &ChatOptions,
    ) -> Result<ChatResponse, ChatError> {
        let body = self.build_request(image, prompt, options);

        debug!(
            "Calling messages API: model={}, max_tokens={}, image_bytes={}",
            self.model,
            options.max_tokens,
            image.len()
        );

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body);

        if let Some(timeout) = options.timeout {
            req = req.timeout(timeout);
        }

        let response = check_status(req.send().await.map_err(send_error)?).await?;
        let payload = response.bytes().await.map_err(send_error)?;
        let text = extract_text(&payload)?;

        Ok(ChatResponse::single_turn(prompt, text))
    }
}

#[async_trait]
impl VisionChatModel for AnthropicVisionChat {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        images: ChatImages,
        prompt: &str,
        options: &ChatOptions,
    ) -> Result<ChatResponse, ChatError> {
        let image = images.into_single()?;
        options.validate()?;

        let start = GenerationStart::chat(
            self.name(),
            &self.model,
            options.max_tokens,
            options.temperature,
        )
        .with_trace(options.trace.clone());

        observed(
            self.telemetry.as_ref(),
            self.metrics.as_deref(),
            start,
            self.complete(&image, prompt, options),
        )
        .await
    }

    fn unload(&self) {
        debug!("Unload requested for {} adapter; nothing to release", self.model);
    }
}

/// Concatenate the text blocks of a messages response
fn extract_text(payload: &[u8]) -> Result<String, ChatError> {
    let response: MessagesResponse = serde_json::from_slice(payload)
        .map_err(|e| ChatError::MalformedResponse(format!("undecodable message: {}", e)))?;

    let text: String = response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect();

    if text.is_empty() {
        return Err(ChatError::MalformedResponse(
            "message has no text content".to_string(),
        ));
    }

    Ok(text)
}

// Wire types for the messages API

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'static str,
    messages: Vec<UserMessage<'a>>,
    #[serde(flatten)]
    extra: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Image { source: ImageSource },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_api_key() {
        assert!(matches!(
            AnthropicVisionChat::new(AnthropicConfig::default()),
            Err(ChatError::Configuration(_))
        ));
    }

    #[test]
    fn test_apply_env() {
        let config = AnthropicConfig::default().apply_env(|k| match k {
            "ANTHROPIC_API_KEY" => Some("sk-ant".to_string()),
            _ => None,
        });
        assert_eq!(config.api_key.unwrap().expose_secret(), "sk-ant");
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_request_shape() {
        let chat = AnthropicVisionChat::new(AnthropicConfig::default().with_api_key("k")).unwrap();
        let options = ChatOptions::default().with_max_tokens(4096);
        let image = [0xFF, 0xD8, 0xFF, 0xE0];

        let body = serde_json::to_value(chat.build_request(&image, "Summarize", &options)).unwrap();

        assert_eq!(body["model"], "claude-3-5-sonnet-20240620");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["system"], SYSTEM_INSTRUCTION);
        assert!(body.get("detail").is_none());

        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["type"], "image");
        assert_eq!(content[0]["source"]["type"], "base64");
        assert_eq!(content[0]["source"]["media_type"], "image/jpeg");
        assert_eq!(content[0]["source"]["data"], encode_bytes(&image));
        assert_eq!(content[1], json!({"type": "text", "text": "Summarize"}));
    }

    #[test]
    fn test_extract_text() {
        let ok = json!({
            "content": [
                {"type": "text", "text": "BLEU "},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "27.3"}
            ]
        });
        assert_eq!(extract_text(ok.to_string().as_bytes()).unwrap(), "BLEU 27.3");

        let empty = json!({"content": []});
        assert!(matches!(
            extract_text(empty.to_string().as_bytes()),
            Err(ChatError::MalformedResponse(_))
        ));
    }
}

//! Vision chat over an OpenAI-compatible chat completions endpoint

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::models::{ChatImages, ChatOptions, ChatResponse, ImageDetail, SYSTEM_INSTRUCTION};
use super::{check_status, observed, send_error, ChatError, VisionChatModel};
use crate::encoding::{encode_bytes, sniff_media_type};
use crate::metrics::ChatMetrics;
use crate::telemetry::{GenerationStart, NoopTelemetry, Telemetry};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (read from env OPENAI_API_KEY if not set)
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Custom endpoint, e.g. a proxy or compatible gateway (env OPENAI_API_BASE)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Client-wide request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl OpenAiConfig {
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(api_key.into()));
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Load configuration from environment variables
    pub fn from_env(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Override unset fields from a variable lookup
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.api_key.is_none() {
            if let Some(val) = lookup("OPENAI_API_KEY") {
                self.api_key = Some(SecretString::new(val));
            }
        }

        if self.base_url.is_none() {
            self.base_url = lookup("OPENAI_API_BASE").filter(|v| !v.trim().is_empty());
        }

        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Full chat completions URL
    pub fn endpoint(&self) -> String {
        let base = self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

/// Hosted vision chat adapter for OpenAI-compatible APIs
pub struct OpenAiVisionChat {
    http: Client,
    model: String,
    api_key: SecretString,
    endpoint: String,
    telemetry: Arc<dyn Telemetry>,
    metrics: Option<Arc<ChatMetrics>>,
}

impl OpenAiVisionChat {
    /// Create an adapter without telemetry
    pub fn new(config: OpenAiConfig) -> Result<Self, ChatError> {
        Self::with_telemetry(config, Arc::new(NoopTelemetry))
    }

    /// Create an adapter reporting generations to `telemetry`
    ///
    /// Fails with [`ChatError::Configuration`] when no usable API key is set.
    pub fn with_telemetry(
        config: OpenAiConfig,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, ChatError> {
        let api_key = config
            .api_key
            .as_ref()
            .filter(|key| !key.expose_secret().trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                ChatError::Configuration(
                    "OpenAI API key is not set; configure api_key or OPENAI_API_KEY".to_string(),
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

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request<'a>(
        &'a self,
        image: &[u8],
        prompt: &'a str,
        options: &'a ChatOptions,
    ) -> ChatCompletionRequest<'a> {
        let mut parts = Vec::with_capacity(2);
        if !prompt.trim().is_empty() {
            parts.push(ContentPart::Text { text: prompt });
        }
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{};base64,{}", sniff_media_type(image), encode_bytes(image)),
                detail: options.detail,
            },
        });

        ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                RequestMessage {
                    role: "system",
                    content: MessageContent::Text(SYSTEM_INSTRUCTION),
                },
                RequestMessage {
                    role: "user",
                    content: MessageContent::Parts(parts),
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
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
            "Calling chat completions: model={}, max_tokens={}, detail={}, image_bytes={}",
            self.model,
            options.max_tokens,
            options.detail,
            image.len()
        );

        let mut req = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
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
impl VisionChatModel for OpenAiVisionChat {
    fn name(&self) -> &'static str {
        "openai"
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

    /// Holds only an HTTP client handle, so there is nothing to release.
    fn unload(&self) {
        debug!("Unload requested for {} adapter; nothing to release", self.model);
    }
}

/// Pull the first completion's text out of a response body
fn extract_text(payload: &[u8]) -> Result<String, ChatError> {
    let response: ChatCompletionResponse = serde_json::from_slice(payload)
        .map_err(|e| ChatError::MalformedResponse(format!("undecodable completion: {}", e)))?;

    let message = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ChatError::MalformedResponse("response contains no choices".to_string()))?
        .message
        .ok_or_else(|| ChatError::MalformedResponse("first choice has no message".to_string()))?;

    match message.content {
        Some(content) if !content.is_empty() => Ok(content),
        _ => Err(ChatError::MalformedResponse(match message.refusal {
            Some(refusal) => format!("model refused: {}", refusal),
            None => "first choice has no text content".to_string(),
        })),
    }
}

// Wire types for the chat completions API

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(flatten)]
    extra: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: ImageDetail,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn adapter() -> OpenAiVisionChat {
        OpenAiVisionChat::new(OpenAiConfig::default().with_api_key("sk-test")).unwrap()
    }

    #[test]
    fn test_missing_api_key() {
        let result = OpenAiVisionChat::new(OpenAiConfig::default());
        assert!(matches!(result, Err(ChatError::Configuration(_))));
    }

    #[test]
    fn test_blank_api_key() {
        let result = OpenAiVisionChat::new(OpenAiConfig::default().with_api_key(""));
        assert!(matches!(result, Err(ChatError::Configuration(_))));

        let result = OpenAiVisionChat::new(OpenAiConfig::default().with_api_key("   "));
        assert!(matches!(result, Err(ChatError::Configuration(_))));
    }

    #[test]
    fn test_invalid_base_url() {
        let config = OpenAiConfig::default()
            .with_api_key("sk-test")
            .with_base_url("not a url");
        assert!(matches!(
            OpenAiVisionChat::new(config),
            Err(ChatError::Configuration(_))
        ));
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            OpenAiConfig::default().endpoint(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            OpenAiConfig::default()
                .with_base_url("http://gateway:4000/v1/")
                .endpoint(),
            "http://gateway:4000/v1/chat/completions"
        );
    }

    #[test]
    fn test_apply_env() {
        let vars: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-env"),
            ("OPENAI_API_BASE", "http://proxy:8000/v1"),
        ]
        .into_iter()
        .collect();

        let config = OpenAiConfig::default().apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.api_key.unwrap().expose_secret(), "sk-env");
        assert_eq!(config.base_url.as_deref(), Some("http://proxy:8000/v1"));

        let explicit = OpenAiConfig::default()
            .with_api_key("sk-explicit")
            .apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(explicit.api_key.unwrap().expose_secret(), "sk-explicit");
    }

    #[test]
    fn test_request_shape() {
        let chat = adapter();
        let options = ChatOptions::default()
            .with_detail(ImageDetail::Low)
            .with_extra("seed", json!(7));
        let image = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

        let body = serde_json::to_value(chat.build_request(&image, "Read the table", &options)).unwrap();

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["seed"], 7);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], SYSTEM_INSTRUCTION);

        let content = &body["messages"][1]["content"];
        assert_eq!(content[0], json!({"type": "text", "text": "Read the table"}));
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["detail"], "low");
        assert_eq!(
            content[1]["image_url"]["url"],
            format!("data:image/png;base64,{}", encode_bytes(&image))
        );
    }

    #[test]
    fn test_image_only_request() {
        let chat = adapter();
        let options = ChatOptions::default();
        let body = serde_json::to_value(chat.build_request(b"raw", "", &options)).unwrap();

        let content = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["type"], "image_url");
    }

    #[test]
    fn test_extract_text() {
        let ok = json!({"choices": [{"message": {"role": "assistant", "content": "27.3"}}]});
        assert_eq!(extract_text(ok.to_string().as_bytes()).unwrap(), "27.3");

        let no_choices = json!({"choices": []});
        assert!(matches!(
            extract_text(no_choices.to_string().as_bytes()),
            Err(ChatError::MalformedResponse(_))
        ));

        let null_content = json!({"choices": [{"message": {"content": null}}]});
        assert!(matches!(
            extract_text(null_content.to_string().as_bytes()),
            Err(ChatError::MalformedResponse(_))
        ));

        let refusal = json!({"choices": [{"message": {"content": null, "refusal": "no"}}]});
        match extract_text(refusal.to_string().as_bytes()) {
            Err(ChatError::MalformedResponse(msg)) => assert!(msg.contains("refused")),
            other => panic!("Expected MalformedResponse, got {:?}", other),
        }

        assert!(matches!(
            extract_text(b"<html>bad gateway</html>"),
            Err(ChatError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_unload_is_idempotent() {
        let chat = adapter();
        chat.unload();
        chat.unload();
    }
}

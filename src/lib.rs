//! Doculens: ask questions about indexed PDF pages with hosted vision models
//!
//! A query retrieves the best-matching page image from an external index
//! service and sends it, with the question, to a vision-language chat model.
//!
//! # Example
//!
//! ```rust,ignore
//! use doculens::vision::{ChatOptions, OpenAiConfig, OpenAiVisionChat, VisionChatModel};
//!
//! let chat = OpenAiVisionChat::new(OpenAiConfig::default().from_env())?;
//! let image = std::fs::read("page.png")?;
//! let response = chat
//!     .chat(image.into(), "What is the BLEU score?", &ChatOptions::default())
//!     .await?;
//! println!("{}", response.text);
//! ```

pub mod config;
pub mod encoding;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod query;
pub mod retrieval;
pub mod telemetry;
pub mod vision;

pub use config::AppConfig;
pub use error::{DoculensError, Result};
pub use query::{Backend, DocumentQuery, QueryAnswer};
pub use vision::{
    AnthropicVisionChat, ChatError, ChatImages, ChatOptions, ChatResponse, ImageDetail,
    OpenAiVisionChat, VisionChatModel,
};

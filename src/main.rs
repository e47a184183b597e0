use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use doculens::config::AppConfig;
use doculens::encoding::encode_image_to_base64_async;
use doculens::metrics::ChatMetrics;
use doculens::retrieval::{PageRetriever, RemoteRetriever};
use doculens::telemetry::{Telemetry, TracingTelemetry};
use doculens::vision::SharedVisionChatModel;
use doculens::{
    logging, AnthropicVisionChat, Backend, ChatOptions, DocumentQuery, ImageDetail,
    OpenAiVisionChat,
};

/// Ask questions about document pages with vision-language models
#[derive(Parser, Debug)]
#[command(name = "doculens", version)]
#[command(about = "Query indexed PDF pages with hosted vision models", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file (defaults to ./doculens.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print collected chat metrics (Prometheus text format) to stderr on exit
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a model about a local image file
    Chat {
        /// Image file to send
        #[arg(short, long)]
        image: PathBuf,

        #[command(flatten)]
        generation: GenerationArgs,
    },

    /// Retrieve the best page from the index and ask a model about it
    Query {
        #[command(flatten)]
        generation: GenerationArgs,
    },

    /// Ask the index service to index a document
    Index {
        /// Document to index (defaults to retrieval.document_path)
        #[arg(short, long)]
        document: Option<String>,

        /// Index name (defaults to retrieval.index_name)
        #[arg(short = 'n', long)]
        index_name: Option<String>,

        /// Replace an existing index with the same name
        #[arg(long)]
        overwrite: bool,
    },

    /// Print the base64 encoding of an image file
    Encode {
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct GenerationArgs {
    /// Question to ask (defaults to generation.default_query)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Backend: openai or anthropic
    #[arg(short, long)]
    backend: Option<Backend>,

    #[arg(long)]
    max_tokens: Option<u32>,

    #[arg(long)]
    temperature: Option<f32>,

    /// Image detail: low, high or auto
    #[arg(long)]
    detail: Option<ImageDetail>,
}

impl GenerationArgs {
    fn options(&self, config: &AppConfig) -> ChatOptions {
        let mut options = config.generation.chat_options();
        if let Some(max_tokens) = self.max_tokens {
            options.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            options.temperature = temperature;
        }
        if let Some(detail) = self.detail {
            options.detail = detail;
        }
        options
    }

    fn prompt(&self, config: &AppConfig) -> String {
        self.prompt
            .clone()
            .unwrap_or_else(|| config.generation.default_query.clone())
    }

    fn backend(&self, config: &AppConfig) -> Backend {
        self.backend.unwrap_or(config.generation.backend)
    }
}

fn build_model(
    backend: Backend,
    config: &AppConfig,
    telemetry: Arc<dyn Telemetry>,
    metrics: Arc<ChatMetrics>,
) -> Result<SharedVisionChatModel> {
    let model: SharedVisionChatModel = match backend {
        Backend::OpenAi => Arc::new(
            OpenAiVisionChat::with_telemetry(config.openai.clone(), telemetry)?
                .with_metrics(metrics),
        ),
        Backend::Anthropic => Arc::new(
            AnthropicVisionChat::with_telemetry(config.anthropic.clone(), telemetry)?
                .with_metrics(metrics),
        ),
    };
    Ok(model)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init(&config.logging);

    let telemetry: Arc<dyn Telemetry> = Arc::new(TracingTelemetry::new());
    let metrics = Arc::new(ChatMetrics::new().context("Failed to initialize metrics")?);

    let outcome = run(cli.command, &config, telemetry, Arc::clone(&metrics)).await;

    if cli.metrics {
        eprint!("{}", metrics.export());
    }

    outcome
}

async fn run(
    command: Command,
    config: &AppConfig,
    telemetry: Arc<dyn Telemetry>,
    metrics: Arc<ChatMetrics>,
) -> Result<()> {
    match command {
        Command::Chat { image, generation } => {
            let backend = generation.backend(config);
            let model = build_model(backend, config, telemetry, metrics)?;

            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("Failed to read image {}", image.display()))?;

            let response = model
                .chat(bytes.into(), &generation.prompt(config), &generation.options(config))
                .await?;
            model.unload();

            println!("{}", response.text);
        }
        Command::Query { generation } => {
            let backend = generation.backend(config);
            let model = build_model(backend, config, telemetry, metrics)?;
            let retriever = Arc::new(RemoteRetriever::new(config.retrieval.clone())?);

            let query = DocumentQuery::new(retriever).with_backend(backend, model);
            let prompt = generation.prompt(config);

            info!("Searching the document for: {}", prompt);
            let answer = query
                .ask(&prompt, backend, &generation.options(config))
                .await;
            query.shutdown();
            let answer = answer?;

            println!(
                "Page {} (doc {}, score {:.2}) via {}:\n\n{}",
                answer.page_num, answer.doc_id, answer.score, answer.backend, answer.response.text
            );
        }
        Command::Index {
            document,
            index_name,
            overwrite,
        } => {
            let retriever = RemoteRetriever::new(config.retrieval.clone())?;
            let document = document.unwrap_or_else(|| config.retrieval.document_path.clone());
            let index_name = index_name.unwrap_or_else(|| config.retrieval.index_name.clone());

            let summary = retriever.index(&document, &index_name, overwrite).await?;
            match summary.pages_indexed {
                Some(pages) => println!("Indexed {} pages into '{}'", pages, summary.index_name),
                None => println!("Indexed '{}' into '{}'", document, summary.index_name),
            }
        }
        Command::Encode { path } => {
            println!("{}", encode_image_to_base64_async(&path).await?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_flag_is_global() {
        let cli = Cli::try_parse_from(["doculens", "encode", "page.png", "--metrics"]).unwrap();
        assert!(cli.metrics);
        assert!(matches!(cli.command, Command::Encode { .. }));

        let cli = Cli::try_parse_from(["doculens", "query", "-b", "claude"]).unwrap();
        assert!(!cli.metrics);
        match cli.command {
            Command::Query { generation } => assert_eq!(generation.backend, Some(Backend::Anthropic)),
            other => panic!("Expected query, got {:?}", other),
        }
    }
}

//! Kassenbon CLI: run the receipt pipeline against local image files.
//!
//! Files passed on the command line stand in for source-provider items;
//! each file's path is its logical id. Results are printed as JSON, one
//! object per line, so the output can be piped into exporters.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kassenbon::{
    BatchImage, CancelToken, Config, HashMethod, HttpVisionEngine, OcrEngine, ReceiptPipeline, TesseractCliEngine,
    VisionMode,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "kassenbon", version, about = "Receipt intelligence: OCR, extraction, validation, dedup")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct EngineArgs {
    /// Vision-API-compatible OCR endpoint. Falls back to the
    /// KASSENBON_VISION_ENDPOINT environment variable.
    #[arg(long)]
    vision_endpoint: Option<String>,

    /// Bearer token for the vision endpoint. Falls back to
    /// KASSENBON_VISION_TOKEN.
    #[arg(long)]
    vision_token: Option<String>,

    /// Tesseract binary used as the local fallback engine.
    #[arg(long, default_value = "tesseract")]
    tesseract: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline on image files and print scored records.
    Process {
        #[command(flatten)]
        engines: EngineArgs,

        /// Receipt image files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print perceptual fingerprints for image files.
    Hash {
        /// Hash algorithm: frequency, gradient, or blur_diff.
        #[arg(long, default_value = "frequency")]
        method: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Find perceptual duplicates among image files.
    Dedup {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Report OCR engine availability and cache statistics.
    Status {
        #[command(flatten)]
        engines: EngineArgs,
    },

    /// Content cache maintenance.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Print cache statistics.
    Stats,
    /// Evict aged entries, then enforce the size budget.
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kassenbon=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Process { engines, files } => process(config, engines, files).await,
        Command::Hash { method, files } => hash(method, files),
        Command::Dedup { files } => dedup(config, files).await,
        Command::Status { engines } => status(config, engines).await,
        Command::Cache { command } => cache(config, command).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_toml_file(path).with_context(|| format!("loading config {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn build_engines(args: &EngineArgs) -> Vec<Arc<dyn OcrEngine>> {
    let endpoint = args
        .vision_endpoint
        .clone()
        .or_else(|| std::env::var("KASSENBON_VISION_ENDPOINT").ok());
    let token = args
        .vision_token
        .clone()
        .or_else(|| std::env::var("KASSENBON_VISION_TOKEN").ok());

    let mut engines: Vec<Arc<dyn OcrEngine>> = Vec::new();
    if let Some(endpoint) = endpoint {
        engines.push(Arc::new(HttpVisionEngine::new(
            endpoint.clone(),
            token.clone(),
            VisionMode::Text,
        )));
        engines.push(Arc::new(HttpVisionEngine::new(endpoint, token, VisionMode::Document)));
    }
    engines.push(Arc::new(TesseractCliEngine::new(args.tesseract.clone(), "eng")));
    engines
}

async fn process(config: Config, engine_args: EngineArgs, files: Vec<PathBuf>) -> Result<()> {
    let engines = build_engines(&engine_args);
    let pipeline = Arc::new(ReceiptPipeline::new(config, engines).await?);

    let mut items = Vec::with_capacity(files.len());
    for file in &files {
        let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        items.push((file.to_string_lossy().into_owned(), bytes));
    }

    let results = pipeline.process_batch(items, &CancelToken::new()).await;
    let failed = results.iter().filter(|r| !r.success).count();

    for result in &results {
        println!("{}", serde_json::to_string(result)?);
    }

    if failed > 0 {
        tracing::warn!(failed, total = results.len(), "some items failed");
    }
    Ok(())
}

fn hash(method: String, files: Vec<PathBuf>) -> Result<()> {
    let method = parse_hash_method(&method)?;

    for file in &files {
        let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        match kassenbon::image::hash_bytes(&bytes, method) {
            Ok(fingerprint) => println!("{}  {}", fingerprint.to_hex(), file.display()),
            Err(e) => tracing::warn!("skipping {}: {}", file.display(), e),
        }
    }
    Ok(())
}

fn parse_hash_method(name: &str) -> Result<HashMethod> {
    match name {
        "frequency" => Ok(HashMethod::Frequency),
        "gradient" => Ok(HashMethod::Gradient),
        "blur_diff" => Ok(HashMethod::BlurDiff),
        other => anyhow::bail!("unknown hash method '{}' (expected frequency, gradient, or blur_diff)", other),
    }
}

async fn dedup(config: Config, files: Vec<PathBuf>) -> Result<()> {
    let pipeline = Arc::new(ReceiptPipeline::new(config, vec![]).await?);

    let mut batch = Vec::with_capacity(files.len());
    for file in &files {
        let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        batch.push(BatchImage::new(file.to_string_lossy(), bytes));
    }

    let (matches, groups) = pipeline.find_duplicates(&batch)?;
    let report = serde_json::json!({ "matches": matches, "groups": groups });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn status(config: Config, engine_args: EngineArgs) -> Result<()> {
    let engines = build_engines(&engine_args);
    let pipeline = ReceiptPipeline::new(config, engines).await?;

    let report = serde_json::json!({
        "ocr": pipeline.ocr_status(),
        "cache": pipeline.cache_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cache(config: Config, command: CacheCommand) -> Result<()> {
    let pipeline = ReceiptPipeline::new(config, vec![]).await?;

    match command {
        CacheCommand::Stats => {
            println!("{}", serde_json::to_string_pretty(&pipeline.cache_stats())?);
        }
        CacheCommand::Clean => {
            let stats = pipeline.maintain_cache()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

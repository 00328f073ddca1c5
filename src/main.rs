use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;

use pillscan::catalog::{CatalogStore, InMemoryCatalog};
use pillscan::pipeline::Pipeline;
use pillscan::providers::{CloudOcr, GeminiVision, HttpDetector};
use pillscan::settings::{Settings, load_settings};

#[derive(Parser, Debug)]
#[command(
    name = "pillscan",
    version,
    about = "Identify pills from a photograph against a catalog"
)]
struct Cli {
    /// Image file to analyze (omit when using --serve)
    image: Option<String>,

    /// Run the HTTP API instead of a one-shot analysis
    #[arg(long = "serve")]
    serve: bool,

    /// Listen address for --serve
    #[arg(short = 'a', long = "addr", default_value = "127.0.0.1:8080")]
    addr: String,

    /// Pill catalog snapshot (JSON array of records)
    #[arg(short = 'c', long = "catalog")]
    catalog: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pillscan::logging::init(cli.verbose)?;

    let settings = load_settings(cli.read_settings.as_deref().map(Path::new))?;
    let catalog: Arc<dyn CatalogStore> = match cli.catalog.as_deref() {
        Some(path) => Arc::new(InMemoryCatalog::load(Path::new(path))?),
        None => Arc::new(InMemoryCatalog::default()),
    };
    let pipeline = build_pipeline(settings, catalog.clone());

    if cli.serve {
        return pillscan::server::run_server(pipeline, catalog, cli.addr).await;
    }

    let path = cli
        .image
        .ok_or_else(|| anyhow!("an image path is required unless --serve is set"))?;
    let bytes =
        std::fs::read(&path).with_context(|| format!("failed to read image file: {}", path))?;
    let analysis = pipeline.analyze(&bytes).await?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

/// Remote collaborators are wired up from the environment; any that are
/// not configured leave their pipeline steps degraded rather than broken.
fn build_pipeline(settings: Settings, catalog: Arc<dyn CatalogStore>) -> Pipeline {
    let model = settings.remote.gemini_model.clone();
    let mut pipeline = Pipeline::new(settings, catalog);
    if let Some(url) = HttpDetector::url_from_env() {
        pipeline = pipeline.with_detector(Arc::new(HttpDetector::new(url)));
    }
    if let Some(key) = GeminiVision::key_from_env() {
        pipeline = pipeline.with_vision(Arc::new(GeminiVision::new(key, model)));
    }
    if let Some(key) = CloudOcr::key_from_env() {
        pipeline = pipeline.with_reader(Arc::new(CloudOcr::new(key)));
    }
    pipeline
}

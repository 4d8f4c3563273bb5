//! BottleFinder - Bottle identification service
//!
//! Detects bottles in an uploaded photo, reads their labels and matches the
//! text against a product catalog.

mod catalog;
mod config;
mod error;
mod matcher;
mod pipeline;
mod server;
mod staging;
mod storage;
mod vision;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::matcher::{HttpImageFetcher, Matcher};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::server::AppState;
use crate::staging::StagingArea;
use crate::vision::{
    DetectionParams, Detector, ModelManager, PaddleOcrEngine, YoloModel,
};

/// BottleFinder - Bottle identification service
#[derive(Parser, Debug)]
#[command(name = "bottle-finder")]
#[command(about = "Identifies bottles in photos and matches them to a product catalog")]
struct Args {
    /// Configuration file (defaults to config.toml in the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    bind: Option<String>,

    /// Write the default configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if let Some(path) = &args.write_default_config {
        config::save_config(&AppConfig::default(), path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    info!("BottleFinder starting...");

    let mut config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => load_or_create_config(),
    };
    config.apply_env_overrides();
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    if config.server.api_key == config::ServerConfig::default().api_key {
        warn!("Using the default API key; set {} in production", config::API_KEY_ENV);
    }

    let pipeline = build_pipeline(&config).await?;

    let state = AppState {
        pipeline: Arc::new(pipeline),
        api_key: Arc::from(config.server.api_key.as_str()),
        products_file: Arc::new(config.catalog.products_file.clone()),
    };
    let app = server::router(state, &config.catalog.images_dir, config.server.max_upload_bytes);

    server::start_server(&config.server.bind, app).await?;

    info!("BottleFinder shutdown complete");
    Ok(())
}

/// Load configuration from file or create default
fn load_or_create_config() -> AppConfig {
    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            match config::load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return config;
                }
                Err(e) => warn!("Ignoring invalid configuration: {:#}", e),
            }
        }
    }
    info!("Using default configuration");
    AppConfig::default()
}

/// Fetch models and wire up every pipeline stage
async fn build_pipeline(config: &AppConfig) -> Result<Pipeline> {
    let models = ModelManager::new()?;
    let detector_path = models.ensure(&config.detector.model).await?;
    let ocr_det_path = models.ensure(&config.ocr.detection_model).await?;
    let ocr_rec_path = models.ensure(&config.ocr.recognition_model).await?;
    let dictionary_path = models.ensure(&config.ocr.dictionary).await?;

    let device = config.detector.device;
    let yolo = YoloModel::load(&detector_path, device)
        .with_context(|| format!("Failed to load detector {:?}", detector_path))?;
    let detector = Detector::new(Arc::new(yolo), DetectionParams::from(&config.detector));

    let ocr = PaddleOcrEngine::new(&ocr_det_path, &ocr_rec_path, &dictionary_path, device, &config.ocr)?;

    let catalog = load_catalog(&config.catalog.products_file)?;
    let fetcher = HttpImageFetcher::new(Duration::from_secs(config.fetch.timeout_secs))?;
    let matcher = Matcher::new(catalog, Arc::new(fetcher), config.matcher.clone());

    let staging = StagingArea::new(&config.staging.root)?;

    Ok(Pipeline::new(
        staging,
        detector,
        Arc::new(ocr),
        matcher,
        PipelineSettings::from_config(config),
    ))
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    let catalog = Catalog::load(path)?;
    if catalog.is_empty() {
        warn!("Catalog {:?} has no products; nothing will match", path);
    }
    Ok(catalog)
}

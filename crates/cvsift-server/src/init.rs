// Initialization utilities for the server binary
//
// Storage backend, analyzer adapter, and logging/tracing setup

use std::sync::Arc;

use anyhow::{Context, Result};
use cvsift_config::{LogFormat, RuntimeConfig, StorageBackend};
use cvsift_engine::{Analyzer, HttpAnalyzer};
use cvsift_store::ObjectStore;
use tracing::info;

/// Initialize the object store gateway from RuntimeConfig
pub(crate) fn init_object_store(config: &RuntimeConfig) -> Result<ObjectStore> {
    info!(
        "Initializing object storage backend: {}",
        config.storage.backend
    );

    let store = match config.storage.backend {
        StorageBackend::Fs => {
            let fs = config
                .storage
                .fs
                .as_ref()
                .context("fs config required for filesystem backend")?;
            info!("Using filesystem storage at: {}", fs.path);
            ObjectStore::new_fs(&fs.path)?
        }
        StorageBackend::S3 => {
            let s3 = config
                .storage
                .s3
                .as_ref()
                .context("s3 config required for S3 backend")?;
            info!(
                "Using S3 storage: bucket={}, region={}",
                s3.bucket, s3.region
            );
            ObjectStore::new_s3(&s3.bucket, &s3.region, s3.endpoint.as_deref())?
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage (bytes do not survive a restart)");
            ObjectStore::new_memory()?
        }
    };

    Ok(store)
}

/// Initialize the analyzer adapter from RuntimeConfig
pub(crate) fn init_analyzer(config: &RuntimeConfig) -> Result<Arc<dyn Analyzer>> {
    let analyzer = config
        .analyzer
        .as_ref()
        .context("analyzer configuration required (set CVSIFT_ANALYZER_ENDPOINT)")?;

    info!("Using analyzer at: {}", analyzer.endpoint);
    let http = HttpAnalyzer::new(&analyzer.endpoint, analyzer.timeout())
        .context("Failed to build analyzer client")?;
    Ok(Arc::new(http))
}

/// Initialize tracing/logging from RuntimeConfig
pub(crate) fn init_tracing(config: &RuntimeConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = config
        .server
        .as_ref()
        .map(|s| s.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let env_filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    let format = config
        .server
        .as_ref()
        .map(|s| s.log_format)
        .unwrap_or(LogFormat::Text);
    match format {
        LogFormat::Json => {
            registry.with(fmt::layer().json()).init();
        }
        LogFormat::Text => {
            registry.with(fmt::layer()).init();
        }
    }
}

// Configuration validation

use crate::{RuntimeConfig, StorageBackend};
use anyhow::{bail, Result};

/// Validate the fully-resolved configuration
pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    if config.engine.lease_seconds == 0 {
        bail!("engine.lease_seconds must be greater than zero");
    }
    if config.engine.watchdog_interval_ms == 0 {
        bail!("engine.watchdog_interval_ms must be greater than zero");
    }
    if config.engine.worker_backoff_base_ms == 0 {
        bail!("engine.worker_backoff_base_ms must be greater than zero");
    }
    if config.engine.worker_backoff_max_ms < config.engine.worker_backoff_base_ms {
        bail!("engine.worker_backoff_max_ms must be at least worker_backoff_base_ms");
    }

    match config.storage.backend {
        StorageBackend::Fs => {
            let fs = config
                .storage
                .fs
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("storage.fs section required for fs backend"))?;
            if fs.path.is_empty() {
                bail!("storage.fs.path must not be empty");
            }
        }
        StorageBackend::S3 => {
            let s3 = config
                .storage
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("storage.s3 section required for s3 backend"))?;
            if s3.bucket.is_empty() {
                bail!("storage.s3.bucket must not be empty");
            }
            if s3.region.is_empty() {
                bail!("storage.s3.region must not be empty");
            }
        }
        StorageBackend::Memory => {}
    }

    if let Some(analyzer) = &config.analyzer {
        if analyzer.endpoint.is_empty() {
            bail!("analyzer.endpoint must not be empty");
        }
        if analyzer.timeout_secs == 0 {
            bail!("analyzer.timeout_secs must be greater than zero");
        }
    }

    if let Some(server) = &config.server {
        if server.listen_addr.is_empty() {
            bail!("server.listen_addr must not be empty");
        }
        if server.max_payload_bytes == 0 {
            bail!("server.max_payload_bytes must be greater than zero");
        }
    }

    Ok(())
}

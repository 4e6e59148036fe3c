// Configuration source loading
//
// Loads configuration from multiple sources with priority:
// 1. Environment variables (highest)
// 2. Config file from CVSIFT_CONFIG path
// 3. Inline config from CVSIFT_CONFIG_CONTENT
// 4. Default config files (./cvsift.toml, ./config.toml)
// 5. Built-in defaults (lowest)

use crate::*;
use anyhow::{Context, Result};
use std::env;
use std::path::Path;

const ENV_PREFIX: &str = "CVSIFT_";

/// Load configuration from all sources
pub fn load_config() -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::default();

    if let Some(file_config) = load_from_file()? {
        merge_config(&mut config, file_config);
    }

    apply_env_overrides(&mut config)?;

    config.validate()?;

    Ok(config)
}

/// Load configuration from file
fn load_from_file() -> Result<Option<RuntimeConfig>> {
    // Check for explicit config file path
    if let Ok(path) = env::var("CVSIFT_CONFIG") {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: RuntimeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        return Ok(Some(config));
    }

    // Check for inline config content
    if let Ok(content) = env::var("CVSIFT_CONFIG_CONTENT") {
        let config: RuntimeConfig = toml::from_str(&content)
            .context("Failed to parse inline config from CVSIFT_CONFIG_CONTENT")?;
        return Ok(Some(config));
    }

    // Try default config file locations
    for path in &["./cvsift.toml", "./config.toml"] {
        if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            let config: RuntimeConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?;
            return Ok(Some(config));
        }
    }

    Ok(None)
}

/// Merge file-based config into base config
fn merge_config(base: &mut RuntimeConfig, file: RuntimeConfig) {
    base.engine = file.engine;
    base.storage = file.storage;

    if file.analyzer.is_some() {
        base.analyzer = file.analyzer;
    }
    if file.server.is_some() {
        base.server = file.server;
    }
}

/// Apply environment variable overrides (highest priority)
fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
    // Engine configuration
    if let Some(val) = get_env_u64("LEASE_SECONDS")? {
        config.engine.lease_seconds = val;
    }
    if let Some(val) = get_env_u32("MAX_RETRIES")? {
        config.engine.max_retries = val;
    }
    if let Some(val) = get_env_u64("WORKER_BACKOFF_BASE_MS")? {
        config.engine.worker_backoff_base_ms = val;
    }
    if let Some(val) = get_env_u64("WORKER_BACKOFF_MAX_MS")? {
        config.engine.worker_backoff_max_ms = val;
    }
    if let Some(val) = get_env_u64("WATCHDOG_INTERVAL_MS")? {
        config.engine.watchdog_interval_ms = val;
    }
    if let Some(val) = get_env_u32("CLAIM_RETRIES")? {
        config.engine.claim_retries = val;
    }

    // Storage backend
    if let Some(backend) = get_env_string("STORAGE_BACKEND")? {
        config.storage.backend = backend
            .parse::<StorageBackend>()
            .context("Invalid CVSIFT_STORAGE_BACKEND value")?;
    }
    if let Some(path) = get_env_string("STORAGE_PATH")? {
        config.storage.fs = Some(FsConfig { path });
    }
    if let Some(bucket) = get_env_string("STORAGE_BUCKET")? {
        let s3 = config.storage.s3.get_or_insert_with(|| S3Config {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
        });
        s3.bucket = bucket;
    }
    if let Some(region) = get_env_string("S3_REGION")? {
        if let Some(ref mut s3) = config.storage.s3 {
            s3.region = region;
        }
    }
    if let Some(endpoint) = get_env_string("S3_ENDPOINT")? {
        if let Some(ref mut s3) = config.storage.s3 {
            s3.endpoint = Some(endpoint);
        }
    }

    // Analyzer configuration
    if let Some(endpoint) = get_env_string("ANALYZER_ENDPOINT")? {
        let analyzer = config.analyzer.get_or_insert_with(|| AnalyzerConfig {
            endpoint: String::new(),
            timeout_secs: default_analyzer_timeout_secs(),
        });
        analyzer.endpoint = endpoint;
    }
    if let Some(val) = get_env_u64("ANALYZER_TIMEOUT_SECS")? {
        if let Some(ref mut analyzer) = config.analyzer {
            analyzer.timeout_secs = val;
        }
    }

    // Server configuration
    if config.server.is_none() {
        config.server = Some(ServerConfig::default());
    }
    if let Some(ref mut server) = config.server {
        if let Some(addr) = get_env_string("LISTEN_ADDR")? {
            server.listen_addr = addr;
        }
        if let Some(level) = get_env_string("LOG_LEVEL")? {
            server.log_level = level;
        }
        if let Some(format) = get_env_string("LOG_FORMAT")? {
            server.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Text,
            };
        }
        if let Some(val) = get_env_usize("MAX_PAYLOAD_BYTES")? {
            server.max_payload_bytes = val;
        }
    }

    Ok(())
}

/// Helper: Get environment variable as string
fn get_env_string(key: &str) -> Result<Option<String>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match env::var(&full_key) {
        Ok(val) if !val.is_empty() => Ok(Some(val)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read env var {}", full_key)),
    }
}

/// Helper: Get environment variable as u64
fn get_env_u64(key: &str) -> Result<Option<u64>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<u64>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Helper: Get environment variable as u32
fn get_env_u32(key: &str) -> Result<Option<u32>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<u32>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Helper: Get environment variable as usize
fn get_env_usize(key: &str) -> Result<Option<usize>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<usize>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

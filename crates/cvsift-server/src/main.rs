use anyhow::{Context, Result};
use clap::Parser;
use cvsift_config::RuntimeConfig;
use std::path::PathBuf;

/// Batch resume-screening engine with an HTTP control surface
#[derive(Parser)]
#[command(name = "cvsift")]
#[command(version)]
#[command(about = "Durable batch engine scoring resumes against a job description", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config file)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // An explicit --config wins over the default lookup chain.
    if let Some(config_path) = &cli.config {
        std::env::set_var("CVSIFT_CONFIG", config_path);
    }

    let mut config = RuntimeConfig::load().context("Failed to load configuration")?;
    apply_cli_overrides(&mut config, &cli);
    config.validate()?;

    cvsift_server::run_with_config(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    use cvsift_config::ServerConfig;

    if let Some(listen) = &cli.listen {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.listen_addr = listen.clone();
    }

    if let Some(level) = &cli.log_level {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.log_level = level.clone();
    }
}

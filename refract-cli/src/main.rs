//! Refract CLI - runs the image transformation proxy.
//!
//! # Architecture
//!
//! - `Cli` / `Commands`: argument parsing (clap)
//! - `CliError`: centralized error handling with exit codes
//!
//! Settings come from a YAML configuration file; the `--listen` flag
//! overrides the configured listen address when specified.

mod error;

use clap::{Parser, Subcommand};
use error::CliError;
use refract::config::Config;
use refract::engine::ImageEngine;
use refract::object::BucketRouter;
use refract::processor::RequestProcessor;
use refract::server::AppState;
use refract::storage::BucketStorage;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "refract")]
#[command(version = refract::VERSION)]
#[command(about = "On-demand image transformation proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Serve {
        /// Path to the YAML configuration file
        #[arg(long, default_value = "refract.yml")]
        config: PathBuf,

        /// Override the configured listen address
        #[arg(long)]
        listen: Option<String>,
    },

    /// Validate a configuration file and exit
    Check {
        /// Path to the YAML configuration file
        #[arg(long, default_value = "refract.yml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config, listen } => run_serve(config, listen).await,
        Commands::Check { config } => run_check(config),
    };

    if let Err(e) = result {
        e.exit();
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

async fn run_serve(config_path: PathBuf, listen: Option<String>) -> Result<(), CliError> {
    init_logging();

    let config = Config::load(&config_path)?;
    let listen = listen.unwrap_or_else(|| config.server.listen.clone());

    let state = AppState {
        processor: Arc::new(RequestProcessor::new(
            &config,
            Arc::new(BucketStorage::from_config(&config)?),
            Arc::new(ImageEngine::new()),
        )),
        router: Arc::new(BucketRouter::from_config(&config)?),
    };

    println!("Refract v{}", refract::VERSION);
    println!("==========");
    println!();
    println!("Config:  {}", config_path.display());
    println!("Buckets: {}", config.buckets.len());
    println!("Listen:  http://{}", listen);
    println!();
    println!("Press Ctrl+C to stop");

    tracing::info!(
        listen = %listen,
        buckets = config.buckets.len(),
        request_timeout_secs = config.server.request_timeout,
        "starting server"
    );

    let listener = TcpListener::bind(&listen).await.map_err(|source| {
        CliError::Bind {
            addr: listen.clone(),
            source,
        }
    })?;

    refract::server::serve(listener, state)
        .await
        .map_err(CliError::Serve)?;

    println!("Server stopped.");
    Ok(())
}

fn run_check(config_path: PathBuf) -> Result<(), CliError> {
    let config = Config::load(&config_path)?;
    BucketRouter::from_config(&config)?;
    BucketStorage::from_config(&config)?;

    println!("Configuration OK: {}", config_path.display());
    println!("  buckets:           {}", config.buckets.len());
    println!("  header rules:      {}", config.headers.len());
    println!("  request timeout:   {}s", config.server.request_timeout);
    println!("  cache size:        {}", config.server.cache_size);
    println!("  queue length:      {}", config.server.queue_len);
    Ok(())
}

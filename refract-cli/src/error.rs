//! CLI error handling with user-friendly messages.

use refract::config::ConfigError;
use refract::object::ObjectError;
use refract::storage::StorageError;
use std::process;
use thiserror::Error;

/// CLI-specific errors with consistent formatting and exit behavior.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid bucket rules: {0}")]
    BucketRules(#[from] ObjectError),

    #[error("storage setup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

impl CliError {
    /// Exit the process with an error message and a non-zero code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::Bind { .. } = self {
            eprintln!();
            eprintln!("Another process may already be listening on that address,");
            eprintln!("or the port may require elevated privileges.");
        }

        process::exit(1)
    }
}

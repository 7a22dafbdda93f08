//! Refract - on-demand image transformation proxy.
//!
//! Refract fronts an object storage backend and produces derived images
//! (resized, cropped, re-encoded) on first request. Concurrent requests
//! for the same derivative collapse onto a single production; results are
//! cached in memory and persisted back to storage asynchronously.
//!
//! # High-Level API
//!
//! ```ignore
//! use refract::config::Config;
//! use refract::engine::ImageEngine;
//! use refract::object::BucketRouter;
//! use refract::processor::RequestProcessor;
//! use refract::server::AppState;
//! use refract::storage::BucketStorage;
//! use std::sync::Arc;
//!
//! let config = Config::load(path)?;
//! let state = AppState {
//!     processor: Arc::new(RequestProcessor::new(
//!         &config,
//!         Arc::new(BucketStorage::from_config(&config)?),
//!         Arc::new(ImageEngine::new()),
//!     )),
//!     router: Arc::new(BucketRouter::from_config(&config)?),
//! };
//! refract::server::serve(listener, state).await?;
//! ```

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod engine;
pub mod object;
pub mod processor;
pub mod response;
pub mod server;
pub mod storage;
pub mod throttler;
pub mod transform;

/// Version of the refract library and CLI.
///
/// This is synchronized across all components in the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Shared types, error model, and configuration for MeshHarvest.
//!
//! This crate is the foundation depended on by all other MeshHarvest crates.
//! It provides:
//! - [`HarvestError`] — the unified error type
//! - Domain types ([`RawRecord`], [`CleanRecord`], [`DownloadJob`], [`DownloadResult`])
//! - Configuration ([`AppConfig`], output layout, config loading)
//! - [`RetryPolicy`] — the shared exponential-backoff retry schedule

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, EndpointsConfig, OutputConfig, OutputLayout, RetryConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{HarvestError, Result};
pub use retry::RetryPolicy;
pub use types::{
    AssetKind, CleanRecord, DownloadJob, DownloadResult, DownloadStatus, JobKey, ModelRef,
    RawRecord, RecordId,
};

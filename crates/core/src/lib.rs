//! Core pipeline orchestration for MeshHarvest.
//!
//! This crate ties grid parsing, crawling, cleaning, downloading, and
//! conversion into one streaming run and produces the end-of-run report.

pub mod cleaner;
pub mod pipeline;
pub mod records;
pub mod report;

// Stage configs, re-exported so binaries only depend on the core crate.
pub use meshharvest_crawler::CrawlerConfig;
pub use meshharvest_downloader::DownloaderConfig;

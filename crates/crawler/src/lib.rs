//! Paginated, concurrency-bounded record crawler.
//!
//! This crate provides:
//! - [`engine`] — the crawl engine: per-cell pagination, retry, dedup
//! - [`Crawler`] — the entry point; streams [`RawRecord`]s through a channel
//!
//! [`RawRecord`]: meshharvest_shared::RawRecord

pub mod engine;

pub use engine::{CrawlSummary, Crawler, CrawlerConfig, UnitOutcome};

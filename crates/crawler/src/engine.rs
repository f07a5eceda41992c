//! Crawl engine: walks the paginated listing endpoint for each grid cell.
//!
//! Cells are crawled with bounded parallelism; pages within one cell are
//! strictly sequential (page N's existence is only known after page N-1).
//! Records stream into an mpsc channel as pages arrive, so downstream
//! stages start working before the crawl finishes. A cell whose pagination
//! fails after retry exhaustion is marked failed in the summary; its
//! partial records are kept and the crawl moves on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use meshharvest_grid::CrawlUnit;
use meshharvest_shared::{HarvestError, RawRecord, RecordId, Result, RetryPolicy};

/// User-Agent string for crawl requests.
const USER_AGENT: &str = concat!("meshharvest/", env!("CARGO_PKG_VERSION"));

/// Capacity of the record channel between crawler and cleaner.
const RECORD_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for the crawl engine.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Base URL of the listing endpoint.
    pub listing_url: Url,
    /// Camera zoom level sent with each listing request.
    pub zoom: f64,
    /// Safety bound on pages per cell; the authoritative stop is an empty page.
    pub page_cap: u32,
    /// Cells crawled in parallel.
    pub concurrency: usize,
    /// Per-page-fetch timeout.
    pub timeout: Duration,
    /// Retry schedule for transient page-fetch failures.
    pub retry: RetryPolicy,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal outcome of crawling one cell.
#[derive(Debug, Clone)]
pub enum UnitOutcome {
    /// Pagination ran to its stop condition (empty page or page cap).
    Completed { pages: u32, records: usize },
    /// Pagination failed after retry exhaustion; partial records were kept.
    Failed { error: String, records: usize },
}

impl UnitOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn records(&self) -> usize {
        match self {
            Self::Completed { records, .. } | Self::Failed { records, .. } => *records,
        }
    }
}

/// Summary of a completed crawl, returned by the driver task.
#[derive(Debug, Default)]
pub struct CrawlSummary {
    /// Per-cell outcomes, `(cell_id, outcome)`.
    pub outcomes: Vec<(String, UnitOutcome)>,
    /// Records sent into the channel (deduplicated per cell).
    pub records_emitted: usize,
    /// Listing items that failed schema validation and were dropped.
    pub invalid_items: usize,
}

impl CrawlSummary {
    /// Cell ids whose pagination failed.
    pub fn failed_units(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_failed())
            .map(|(cell, _)| cell.clone())
            .collect()
    }

    /// True when every cell failed — the fatal case for the orchestrator.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|(_, o)| o.is_failed())
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Listing endpoint response envelope: `{"result": {"objects": [...]}}`.
#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    result: ListingResult,
}

#[derive(Debug, Default, Deserialize)]
struct ListingResult {
    #[serde(default)]
    objects: Vec<serde_json::Value>,
}

/// Page-fetch error with retryability classification.
#[derive(Debug, thiserror::Error)]
enum PageError {
    /// Timeout, connection failure, or 5xx — worth retrying.
    #[error("{0}")]
    Transient(String),
    /// 4xx or malformed payload — retrying will not help.
    #[error("{0}")]
    Terminal(String),
}

impl PageError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// Concurrent listing crawler with per-cell pagination.
pub struct Crawler {
    config: CrawlerConfig,
    client: Client,
}

impl Crawler {
    /// Create a new crawler with the given configuration.
    pub fn new(config: CrawlerConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Crawl `units`, streaming deduplicated raw records through the
    /// returned channel. The join handle resolves to the crawl summary once
    /// every cell has reached a terminal outcome.
    ///
    /// At most `concurrency` cells are in flight at once. Flipping `cancel`
    /// to `true` stops new pages and cells from being started; in-flight
    /// page fetches finish normally.
    #[instrument(skip_all, fields(cells = units.len()))]
    pub fn crawl(
        self: Arc<Self>,
        units: Vec<CrawlUnit>,
        cancel: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<RawRecord>, JoinHandle<CrawlSummary>) {
        let (tx, rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        info!(
            cells = units.len(),
            concurrency = self.config.concurrency,
            page_cap = self.config.page_cap,
            "starting crawl"
        );

        let handle = tokio::spawn(async move {
            let mut tasks = Vec::with_capacity(units.len());

            for unit in units {
                let crawler = Arc::clone(&self);
                let tx = tx.clone();
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();

                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    if *cancel.borrow() {
                        debug!(cell = %unit.cell_id, "cancelled before start");
                        return (
                            unit.cell_id.clone(),
                            UnitOutcome::Completed {
                                pages: 0,
                                records: 0,
                            },
                            0,
                        );
                    }
                    let cell_id = unit.cell_id.clone();
                    let (outcome, invalid) = crawler.crawl_unit(&unit, &tx, &cancel).await;
                    (cell_id, outcome, invalid)
                }));
            }
            // Drop the original sender so the channel closes once every
            // cell task is done.
            drop(tx);

            let mut summary = CrawlSummary::default();
            for task in tasks {
                match task.await {
                    Ok((cell_id, outcome, invalid)) => {
                        summary.records_emitted += outcome.records();
                        summary.invalid_items += invalid;
                        summary.outcomes.push((cell_id, outcome));
                    }
                    Err(e) => {
                        warn!(error = %e, "cell task panicked");
                        summary.outcomes.push((
                            "unknown".into(),
                            UnitOutcome::Failed {
                                error: e.to_string(),
                                records: 0,
                            },
                        ));
                    }
                }
            }

            info!(
                records = summary.records_emitted,
                invalid = summary.invalid_items,
                failed_cells = summary.failed_units().len(),
                "crawl finished"
            );
            summary
        });

        (rx, handle)
    }

    /// Walk pages for one cell until an empty page, the page cap, or a
    /// terminal fetch error. Returns the outcome and the count of listing
    /// items dropped for failing schema validation.
    async fn crawl_unit(
        &self,
        unit: &CrawlUnit,
        tx: &mpsc::Sender<RawRecord>,
        cancel: &watch::Receiver<bool>,
    ) -> (UnitOutcome, usize) {
        let mut seen: HashSet<RecordId> = HashSet::new();
        let mut emitted = 0usize;
        let mut invalid = 0usize;
        let mut pages_done = 0u32;

        for page in 1..=self.config.page_cap {
            if *cancel.borrow() {
                debug!(cell = %unit.cell_id, page, "cancelled mid-cell");
                break;
            }

            let items = match self.fetch_page(unit, page).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(cell = %unit.cell_id, page, error = %e, "cell failed");
                    return (
                        UnitOutcome::Failed {
                            error: e.to_string(),
                            records: emitted,
                        },
                        invalid,
                    );
                }
            };

            pages_done += 1;
            if items.is_empty() {
                debug!(cell = %unit.cell_id, page, "empty page, cell exhausted");
                break;
            }

            for item in items {
                match serde_json::from_value::<RawRecord>(item) {
                    Ok(record) => {
                        // Per-cell dedup: endpoints can repeat items across
                        // pages under concurrent remote writes.
                        if seen.insert(record.id.clone()) {
                            if tx.send(record).await.is_err() {
                                // Receiver dropped; stop producing.
                                return (
                                    UnitOutcome::Completed {
                                        pages: pages_done,
                                        records: emitted,
                                    },
                                    invalid,
                                );
                            }
                            emitted += 1;
                        }
                    }
                    Err(e) => {
                        warn!(cell = %unit.cell_id, page, error = %e, "listing item failed validation");
                        invalid += 1;
                    }
                }
            }
        }

        (
            UnitOutcome::Completed {
                pages: pages_done,
                records: emitted,
            },
            invalid,
        )
    }

    /// Fetch one page with retries for transient failures.
    async fn fetch_page(
        &self,
        unit: &CrawlUnit,
        page: u32,
    ) -> std::result::Result<Vec<serde_json::Value>, PageError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch_page_once(unit, page).await {
                Ok(items) => return Ok(items),
                Err(e) if e.is_transient() && self.config.retry.allows_retry(attempt) => {
                    let delay = self.config.retry.delay_after(attempt);
                    debug!(
                        cell = %unit.cell_id,
                        page,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient page failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_page_once(
        &self,
        unit: &CrawlUnit,
        page: u32,
    ) -> std::result::Result<Vec<serde_json::Value>, PageError> {
        let camera = format!(
            "{},{},{:.2},0.0,0.0,d",
            unit.lat, unit.lng, self.config.zoom
        );

        let response = self
            .client
            .get(self.config.listing_url.clone())
            .query(&[
                ("cell", unit.cell_id.as_str()),
                ("camera", camera.as_str()),
                ("mode", "3d"),
            ])
            .query(&[("page", page)])
            .send()
            .await
            .map_err(|e| PageError::Transient(format!("page {page}: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PageError::Transient(format!("page {page}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(PageError::Terminal(format!("page {page}: HTTP {status}")));
        }

        let body: ListingPage = response
            .json()
            .await
            .map_err(|e| PageError::Terminal(format!("page {page}: invalid listing JSON: {e}")))?;

        Ok(body.result.objects)
    }
}

//! Asset download scheduler: clean records → download jobs → results.
//!
//! Each clean record expands into one model job and, when a texture is
//! present, one texture job. Jobs are deduplicated by `(record_id, kind)`
//! against a run-scoped set and dispatched to a fixed-size worker pool.
//! Workers stream response bytes to a `.part` temp file and atomically
//! rename it into place on completion, so an interrupted run never leaves a
//! partial file at a destination path. A destination that already exists is
//! reported as skipped without a fetch, which makes reruns over overlapping
//! input idempotent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, instrument, warn};

use meshharvest_shared::{
    AssetKind, CleanRecord, DownloadJob, DownloadResult, DownloadStatus, HarvestError, JobKey,
    Result, RetryPolicy,
};

/// User-Agent string for asset requests.
const USER_AGENT: &str = concat!("meshharvest/", env!("CARGO_PKG_VERSION"));

/// Capacity of the result channel toward the orchestrator.
const RESULT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for the download scheduler.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Destination directory for model files.
    pub obj_dir: PathBuf,
    /// Destination directory for texture files.
    pub texture_dir: PathBuf,
    /// Worker pool size.
    pub concurrency: usize,
    /// Per-download timeout.
    pub timeout: Duration,
    /// Retry schedule for transient download failures.
    pub retry: RetryPolicy,
}

/// Download error with retryability classification.
#[derive(Debug, thiserror::Error)]
enum FetchError {
    /// Timeout, connection failure, 5xx, or a broken body stream.
    #[error("{0}")]
    Transient(String),
    /// 4xx or a local filesystem error.
    #[error("{0}")]
    Terminal(String),
}

impl FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// DownloadScheduler
// ---------------------------------------------------------------------------

/// Bounded worker-pool download engine with run-scoped dedup.
pub struct DownloadScheduler {
    config: DownloaderConfig,
    client: Client,
}

impl DownloadScheduler {
    /// Create a new scheduler. Destination directories are created here.
    pub fn new(config: DownloaderConfig) -> Result<Self> {
        for dir in [&config.obj_dir, &config.texture_dir] {
            std::fs::create_dir_all(dir).map_err(|e| HarvestError::io(dir, e))?;
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Consume clean records from `records`, returning a stream of terminal
    /// download results. Exactly one result is emitted per unique job key;
    /// the channel closes once the input is exhausted and all workers have
    /// drained.
    #[instrument(skip_all, fields(concurrency = self.config.concurrency))]
    pub fn schedule(
        self: Arc<Self>,
        mut records: mpsc::Receiver<CleanRecord>,
        cancel: watch::Receiver<bool>,
    ) -> mpsc::Receiver<DownloadResult> {
        let (results_tx, results_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let (jobs_tx, jobs_rx) = mpsc::channel::<DownloadJob>(self.config.concurrency.max(1) * 2);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let seen: Arc<std::sync::Mutex<HashSet<JobKey>>> =
            Arc::new(std::sync::Mutex::new(HashSet::new()));

        info!(
            obj_dir = %self.config.obj_dir.display(),
            texture_dir = %self.config.texture_dir.display(),
            "starting download scheduler"
        );

        // Worker pool: each worker pulls one job at a time from the shared
        // queue. The dedup gate upstream guarantees no two workers ever hold
        // jobs with the same destination path.
        for worker in 0..self.config.concurrency.max(1) {
            let scheduler = Arc::clone(&self);
            let jobs_rx = Arc::clone(&jobs_rx);
            let results_tx = results_tx.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = jobs_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };
                    // On cancellation, drain queued jobs without starting
                    // them; the partial run is reflected in the report.
                    if *cancel.borrow() {
                        debug!(worker, record_id = %job.record_id, "cancelled, job not started");
                        continue;
                    }
                    let result = scheduler.run_job(job).await;
                    if results_tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Expander: turns records into jobs, gated by the dedup set.
        let scheduler = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                if *cancel.borrow() {
                    debug!("cancelled, no new jobs dispatched");
                    break;
                }
                for job in scheduler.expand(&record) {
                    let fresh = seen
                        .lock()
                        .expect("dedup set lock poisoned")
                        .insert(job.key());

                    if !fresh {
                        debug!(record_id = %job.record_id, kind = %job.kind, "duplicate job key, skipping");
                        let _ = results_tx.send(skipped(job)).await;
                        continue;
                    }
                    if job.dest.exists() {
                        debug!(dest = %job.dest.display(), "destination exists, skipping");
                        let _ = results_tx.send(skipped(job)).await;
                        continue;
                    }
                    if jobs_tx.send(job).await.is_err() {
                        return;
                    }
                }
            }
            // jobs_tx drops here; workers drain the queue and exit, and the
            // last worker's results_tx clone closes the result channel.
        });

        results_rx
    }

    /// Expand one clean record into its download jobs.
    ///
    /// Destinations are keyed by record id, never by the advertised file
    /// name: listings can advertise the same name for different records,
    /// and two jobs must never share a destination path.
    fn expand(&self, record: &CleanRecord) -> Vec<DownloadJob> {
        let mut jobs = vec![DownloadJob {
            record_id: record.id.clone(),
            kind: AssetKind::Model,
            url: record.model_url.clone(),
            dest: self.config.obj_dir.join(format!("{}.obj", record.id)),
        }];

        if let Some(url) = &record.texture_url {
            let ext = record
                .texture_name
                .as_deref()
                .and_then(|name| Path::new(name).extension())
                .and_then(|ext| ext.to_str())
                .unwrap_or("jpg");
            jobs.push(DownloadJob {
                record_id: record.id.clone(),
                kind: AssetKind::Texture,
                url: url.clone(),
                dest: self.config.texture_dir.join(format!("{}.{ext}", record.id)),
            });
        }

        jobs
    }

    /// Execute one job to its terminal result, retrying transient failures.
    async fn run_job(&self, job: DownloadJob) -> DownloadResult {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch_to_dest(&job).await {
                Ok(checksum) => {
                    debug!(record_id = %job.record_id, kind = %job.kind, attempts = attempt, "downloaded");
                    return DownloadResult {
                        job,
                        status: DownloadStatus::Succeeded,
                        attempts: attempt,
                        checksum: Some(checksum),
                        error: None,
                    };
                }
                Err(e) if e.is_transient() && self.config.retry.allows_retry(attempt) => {
                    let delay = self.config.retry.delay_after(attempt);
                    debug!(
                        record_id = %job.record_id,
                        kind = %job.kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient download failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(record_id = %job.record_id, kind = %job.kind, attempts = attempt, error = %e, "download failed");
                    return DownloadResult {
                        job,
                        status: DownloadStatus::Failed,
                        attempts: attempt,
                        checksum: None,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    }

    /// Stream the response body to `<dest>.part`, then rename into place.
    /// Returns the SHA-256 of the written bytes.
    async fn fetch_to_dest(&self, job: &DownloadJob) -> std::result::Result<String, FetchError> {
        let response = self
            .client
            .get(&job.url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("{}: {e}", job.url)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("{}: HTTP {status}", job.url)));
        }
        if !status.is_success() {
            return Err(FetchError::Terminal(format!("{}: HTTP {status}", job.url)));
        }

        let temp = temp_path(&job.dest);
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| FetchError::Terminal(format!("{}: {e}", temp.display())))?;

        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    hasher.update(&bytes);
                    if let Err(e) = file.write_all(&bytes).await {
                        drop(file);
                        let _ = tokio::fs::remove_file(&temp).await;
                        return Err(FetchError::Terminal(format!("{}: {e}", temp.display())));
                    }
                }
                Err(e) => {
                    // Body stream broke mid-transfer; remove the partial
                    // temp file so no truncated bytes survive the attempt.
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp).await;
                    return Err(FetchError::Transient(format!("{}: body: {e}", job.url)));
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::Terminal(format!("{}: {e}", temp.display())))?;
        drop(file);

        tokio::fs::rename(&temp, &job.dest)
            .await
            .map_err(|e| FetchError::Terminal(format!("{}: rename: {e}", job.dest.display())))?;

        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Build a terminal skip result (no fetch was attempted).
fn skipped(job: DownloadJob) -> DownloadResult {
    DownloadResult {
        job,
        status: DownloadStatus::Skipped,
        attempts: 0,
        checksum: None,
        error: None,
    }
}

/// Temp path a download is staged at before the atomic rename.
fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".into());
    dest.with_file_name(format!("{name}.part"))
}

//! Pipeline orchestration: grid → crawl → clean → download → convert.
//!
//! Crawling, cleaning, and downloading run as one streaming graph: raw
//! records flow from the crawler channel through the cleaner into the
//! download scheduler while the crawl is still in progress. Conversion is
//! the exception: the converter boundary is not safe to run concurrently,
//! so conversions start only after every download has reached a terminal
//! result and then run one at a time.
//!
//! Failure policy: an unreadable or malformed grid is fatal and returns
//! `Err` before any stage starts. Every cell failing to crawl aborts the
//! run (the report comes back with state `Aborted`). Anything narrower
//! degrades the run and is tallied in the report.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

use meshharvest_converter::ModelConverter;
use meshharvest_crawler::{Crawler, CrawlerConfig, CrawlSummary};
use meshharvest_downloader::{DownloadScheduler, DownloaderConfig};
use meshharvest_grid::load_grid;
use meshharvest_shared::{
    AssetKind, CleanRecord, DownloadResult, DownloadStatus, JobKey, OutputLayout, RecordId, Result,
};

use crate::cleaner::RecordCleaner;
use crate::records::JsonlSink;
use crate::report::{RunReport, RunState};

/// Capacity of the clean-record channel toward the download scheduler.
const CLEAN_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Observer for pipeline progress. All methods default to no-ops so
/// implementations only override what they display.
pub trait ProgressReporter: Send + Sync {
    fn stage_changed(&self, _state: RunState) {}
    fn record_crawled(&self, _total: u64) {}
    fn download_completed(&self, _result: &DownloadResult) {}
    fn model_converted(&self, _id: &RecordId, _ok: bool) {}
}

/// No-op reporter for tests and non-interactive runs.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything a single pipeline run needs.
pub struct PipelineConfig {
    /// Path to the GeoJSON grid file.
    pub grid_file: PathBuf,
    /// Stage output directories.
    pub layout: OutputLayout,
    pub crawler: CrawlerConfig,
    pub downloader: DownloaderConfig,
    /// Run the conversion stage after downloads finish.
    pub convert: bool,
}

// ---------------------------------------------------------------------------
// run_pipeline
// ---------------------------------------------------------------------------

/// Execute one full run, returning the end-of-run report.
///
/// Flipping `cancel` to `true` stops new work from being started at every
/// stage; in-flight fetches finish and the report reflects the partial run
/// with `cancelled` set.
#[instrument(skip_all, fields(grid = %config.grid_file.display()))]
pub async fn run_pipeline(
    config: PipelineConfig,
    cleaner: &dyn RecordCleaner,
    converter: &dyn ModelConverter,
    progress: &dyn ProgressReporter,
    cancel: watch::Receiver<bool>,
) -> Result<RunReport> {
    let started = Instant::now();
    let mut report = RunReport::new();

    let units = load_grid(&config.grid_file)?;
    config.layout.create_dirs()?;
    report.units_total = units.len();

    let mut raw_sink = JsonlSink::create(config.layout.crawler_dir.join("records.jsonl"))?;
    let mut clean_sink = JsonlSink::create(config.layout.cleaner_dir.join("records.jsonl"))?;

    let state = std::sync::Mutex::new(RunState::Idle);
    let advance = |next: RunState| {
        let mut current = state.lock().expect("state lock poisoned");
        if next > *current {
            *current = next;
            progress.stage_changed(next);
        }
    };

    info!(run_id = %report.run_id, cells = units.len(), "pipeline run starting");
    advance(RunState::Crawling);

    let crawler = Arc::new(Crawler::new(config.crawler)?);
    let (mut raw_rx, crawl_handle) = crawler.crawl(units, cancel.clone());

    let scheduler = Arc::new(DownloadScheduler::new(config.downloader)?);
    let (clean_tx, clean_rx) = mpsc::channel::<CleanRecord>(CLEAN_CHANNEL_CAPACITY);
    let mut results_rx = scheduler.schedule(clean_rx, cancel.clone());

    // Bridge: raw records → sinks → cleaner → download scheduler. Runs
    // concurrently with result consumption so the scheduler's bounded
    // channels keep draining.
    let bridge = async {
        let mut discovered = 0u64;
        let mut duplicates = 0u64;
        let mut dropped = 0u64;
        let mut cleaned: Vec<CleanRecord> = Vec::new();
        // Run-global dedup: a record can legitimately appear in more than
        // one grid cell when the remote index overlaps cell boundaries.
        let mut seen: HashSet<RecordId> = HashSet::new();

        while let Some(raw) = raw_rx.recv().await {
            raw_sink.append(&raw)?;
            discovered += 1;
            progress.record_crawled(discovered);

            if !seen.insert(raw.id.clone()) {
                duplicates += 1;
                continue;
            }

            advance(RunState::Cleaning);
            match cleaner.clean(&raw) {
                Some(record) => {
                    clean_sink.append(&record)?;
                    cleaned.push(record.clone());
                    if clean_tx.send(record).await.is_err() {
                        break;
                    }
                }
                None => {
                    warn!(id = %raw.id, "record dropped by cleaner");
                    dropped += 1;
                }
            }
        }
        drop(clean_tx);

        raw_sink.finish()?;
        clean_sink.finish()?;
        Ok::<_, meshharvest_shared::HarvestError>((discovered, duplicates, dropped, cleaned))
    };

    // Consumer: tally terminal download results and remember destinations
    // for the conversion stage.
    let consume = async {
        let mut succeeded = 0u64;
        let mut failed = 0u64;
        let mut skipped = 0u64;
        let mut failed_jobs: Vec<String> = Vec::new();
        let mut outcomes: HashMap<JobKey, (DownloadStatus, PathBuf)> = HashMap::new();

        while let Some(result) = results_rx.recv().await {
            advance(RunState::Downloading);
            progress.download_completed(&result);
            match result.status {
                DownloadStatus::Succeeded => succeeded += 1,
                DownloadStatus::Skipped => skipped += 1,
                DownloadStatus::Failed => {
                    failed += 1;
                    failed_jobs.push(format!("{}/{}", result.job.record_id, result.job.kind));
                }
            }
            outcomes.insert(result.job.key(), (result.status, result.job.dest));
        }

        (succeeded, failed, skipped, failed_jobs, outcomes)
    };

    let (bridge_out, consume_out) = tokio::join!(bridge, consume);
    let (discovered, duplicates, dropped, cleaned) = bridge_out?;
    let (dl_succeeded, dl_failed, dl_skipped, failed_jobs, outcomes) = consume_out;

    let summary = match crawl_handle.await {
        Ok(summary) => summary,
        Err(e) => {
            warn!(error = %e, "crawl driver task panicked");
            CrawlSummary::default()
        }
    };

    report.records_discovered = discovered;
    report.invalid_items = summary.invalid_items as u64;
    report.duplicates_collapsed = duplicates;
    report.records_dropped = dropped;
    report.records_cleaned = cleaned.len() as u64;
    report.failed_units = summary.failed_units();
    report.downloads_succeeded = dl_succeeded;
    report.downloads_failed = dl_failed;
    report.downloads_skipped = dl_skipped;
    report.failed_jobs = failed_jobs;
    report.cancelled = *cancel.borrow();

    if summary.all_failed() {
        warn!("every grid cell failed to crawl, aborting run");
        advance(RunState::Aborted);
        report.state = RunState::Aborted;
        report.elapsed_secs = started.elapsed().as_secs_f64();
        return Ok(report);
    }

    if config.convert && !report.cancelled {
        advance(RunState::Converting);
        run_conversions(&cleaned, &outcomes, converter, progress, &cancel, &mut report).await;
    }

    advance(RunState::Done);
    report.state = RunState::Done;
    report.cancelled = *cancel.borrow();
    report.elapsed_secs = started.elapsed().as_secs_f64();

    info!(
        run_id = %report.run_id,
        records = report.records_cleaned,
        downloads_ok = report.downloads_succeeded,
        conversions_ok = report.conversions_succeeded,
        elapsed_secs = report.elapsed_secs,
        "pipeline run finished"
    );
    Ok(report)
}

/// Convert every cleaned record whose model file is on disk, one at a time.
async fn run_conversions(
    cleaned: &[CleanRecord],
    outcomes: &HashMap<JobKey, (DownloadStatus, PathBuf)>,
    converter: &dyn ModelConverter,
    progress: &dyn ProgressReporter,
    cancel: &watch::Receiver<bool>,
    report: &mut RunReport,
) {
    for record in cleaned {
        if *cancel.borrow() {
            report.cancelled = true;
            break;
        }

        let Some((status, model_path)) = outcomes.get(&(record.id.clone(), AssetKind::Model))
        else {
            continue;
        };
        if *status == DownloadStatus::Failed {
            continue;
        }

        let texture_path = outcomes
            .get(&(record.id.clone(), AssetKind::Texture))
            .filter(|(status, path)| *status != DownloadStatus::Failed && path.exists())
            .map(|(_, path)| path.clone());

        match converter.convert(model_path, texture_path.as_deref()).await {
            Ok(out) => {
                info!(id = %record.id, out = %out.display(), "converted");
                report.conversions_succeeded += 1;
                progress.model_converted(&record.id, true);
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "conversion failed");
                report.conversions_failed += 1;
                report.failed_conversions.push(record.id.to_string());
                progress.model_converted(&record.id, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::ModelCleaner;
    use async_trait::async_trait;
    use meshharvest_shared::{HarvestError, RetryPolicy};
    use std::path::Path;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{method, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records conversion calls; optionally fails for one record stem.
    struct FakeConverter {
        calls: std::sync::Mutex<Vec<(PathBuf, Option<PathBuf>)>>,
        fail_stem: Option<String>,
    }

    impl FakeConverter {
        fn new() -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
                fail_stem: None,
            }
        }

        fn failing_on(stem: &str) -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
                fail_stem: Some(stem.into()),
            }
        }

        fn calls(&self) -> Vec<(PathBuf, Option<PathBuf>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelConverter for FakeConverter {
        async fn convert(
            &self,
            model_path: &Path,
            texture_path: Option<&Path>,
        ) -> Result<PathBuf> {
            self.calls
                .lock()
                .unwrap()
                .push((model_path.to_path_buf(), texture_path.map(Path::to_path_buf)));

            let stem = model_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if self.fail_stem.as_deref() == Some(stem.as_str()) {
                return Err(HarvestError::Conversion(format!("{stem}: boom")));
            }
            Ok(model_path.with_extension("glb"))
        }
    }

    fn grid_file(dir: &Path, cells: &[(&str, f64, f64)]) -> PathBuf {
        let features: Vec<serde_json::Value> = cells
            .iter()
            .map(|(id, lat, lng)| {
                serde_json::json!({
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [lng, lat]},
                    "properties": {"id": id, "lat": lat, "lng": lng}
                })
            })
            .collect();
        let content = serde_json::json!({"type": "FeatureCollection", "features": features});

        let path = dir.join("grid.geojson");
        std::fs::write(&path, content.to_string()).unwrap();
        path
    }

    fn listing_item(id: &str, asset_uri: &str, texture: bool) -> serde_json::Value {
        let mut model = serde_json::json!({
            "objUrl": format!("{asset_uri}/obj/{id}.obj"),
            "objName": format!("{id}.obj"),
        });
        if texture {
            model["textureUrl"] = format!("{asset_uri}/tex/{id}.jpg").into();
            model["textureName"] = format!("{id}.jpg").into();
        }
        serde_json::json!({"id": id, "name": format!("building {id}"), "model": model})
    }

    async fn mount_listing(server: &MockServer, cell: &str, page: u32, items: &[serde_json::Value]) {
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/listing"))
            .and(query_param("cell", cell))
            .and(query_param("page", page.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"result": {"objects": items}})),
            )
            .mount(server)
            .await;
    }

    async fn mount_assets(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/(obj|tex)/.+"))
            .respond_with(ResponseTemplate::new(200).set_body_string("asset-bytes"))
            .mount(server)
            .await;
    }

    fn test_config(root: &Path, grid: PathBuf, listing_uri: &str, convert: bool) -> PipelineConfig {
        let layout = OutputLayout::new(root.join("out"));
        PipelineConfig {
            grid_file: grid,
            crawler: CrawlerConfig {
                listing_url: Url::parse(&format!("{listing_uri}/listing")).unwrap(),
                zoom: 19.0,
                page_cap: 10,
                concurrency: 2,
                timeout: Duration::from_secs(5),
                retry: RetryPolicy::immediate(2),
            },
            downloader: DownloaderConfig {
                obj_dir: layout.obj_dir.clone(),
                texture_dir: layout.texture_dir.clone(),
                concurrency: 2,
                timeout: Duration::from_secs(5),
                retry: RetryPolicy::immediate(2),
            },
            layout,
            convert,
        }
    }

    fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn full_run_crawls_downloads_and_converts() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();

        mount_assets(&server).await;
        let uri = server.uri();
        mount_listing(
            &server,
            "A",
            1,
            &[listing_item("r1", &uri, true), listing_item("r2", &uri, false)],
        )
        .await;
        mount_listing(&server, "A", 2, &[]).await;
        mount_listing(&server, "B", 1, &[listing_item("r3", &uri, false)]).await;
        mount_listing(&server, "B", 2, &[]).await;

        let grid = grid_file(tmp.path(), &[("A", 37.56, 126.97), ("B", 37.57, 126.98)]);
        let config = test_config(tmp.path(), grid, &uri, true);
        let out_root = tmp.path().join("out");

        let converter = FakeConverter::new();
        let (_keep, cancel) = no_cancel();
        let report = run_pipeline(config, &ModelCleaner::new(), &converter, &SilentProgress, cancel)
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Done);
        assert!(report.is_clean());
        assert_eq!(report.units_total, 2);
        assert_eq!(report.records_discovered, 3);
        assert_eq!(report.records_cleaned, 3);
        // 3 models + 1 texture
        assert_eq!(report.downloads_succeeded, 4);
        assert_eq!(report.conversions_succeeded, 3);

        // Stage artifacts landed
        assert!(out_root.join("downloader/obj/r1.obj").is_file());
        assert!(out_root.join("downloader/texture/r1.jpg").is_file());
        let raw_lines = std::fs::read_to_string(out_root.join("crawler/records.jsonl")).unwrap();
        assert_eq!(raw_lines.lines().count(), 3);
        let clean_lines = std::fs::read_to_string(out_root.join("cleaner/records.jsonl")).unwrap();
        assert_eq!(clean_lines.lines().count(), 3);

        // r1 converted with its texture, the others without
        let calls = converter.calls();
        assert_eq!(calls.len(), 3);
        let r1 = calls
            .iter()
            .find(|(m, _)| m.ends_with("r1.obj"))
            .unwrap();
        assert!(r1.1.as_ref().unwrap().ends_with("r1.jpg"));
        assert!(calls.iter().any(|(m, t)| m.ends_with("r2.obj") && t.is_none()));
    }

    #[tokio::test]
    async fn cross_cell_duplicates_collapse_before_cleaning() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();

        mount_assets(&server).await;
        let uri = server.uri();
        // Both cells return the same record.
        mount_listing(&server, "A", 1, &[listing_item("shared", &uri, false)]).await;
        mount_listing(&server, "A", 2, &[]).await;
        mount_listing(&server, "B", 1, &[listing_item("shared", &uri, false)]).await;
        mount_listing(&server, "B", 2, &[]).await;

        let grid = grid_file(tmp.path(), &[("A", 37.56, 126.97), ("B", 37.57, 126.98)]);
        let config = test_config(tmp.path(), grid, &uri, false);

        let (_keep, cancel) = no_cancel();
        let report = run_pipeline(
            config,
            &ModelCleaner::new(),
            &FakeConverter::new(),
            &SilentProgress,
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.records_discovered, 2);
        assert_eq!(report.duplicates_collapsed, 1);
        assert_eq!(report.records_cleaned, 1);
        assert_eq!(report.downloads_succeeded, 1);
    }

    #[tokio::test]
    async fn every_cell_failing_aborts_the_run() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let grid = grid_file(tmp.path(), &[("A", 37.56, 126.97), ("B", 37.57, 126.98)]);
        let config = test_config(tmp.path(), grid, &server.uri(), true);

        let converter = FakeConverter::new();
        let (_keep, cancel) = no_cancel();
        let report = run_pipeline(config, &ModelCleaner::new(), &converter, &SilentProgress, cancel)
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Aborted);
        assert!(!report.is_clean());
        assert_eq!(report.failed_units.len(), 2);
        assert_eq!(report.downloads_succeeded, 0);
        assert!(converter.calls().is_empty());
    }

    #[tokio::test]
    async fn one_failed_cell_degrades_but_completes() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();

        mount_assets(&server).await;
        let uri = server.uri();
        mount_listing(&server, "A", 1, &[listing_item("r1", &uri, false)]).await;
        mount_listing(&server, "A", 2, &[]).await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/listing"))
            .and(query_param("cell", "B"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let grid = grid_file(tmp.path(), &[("A", 37.56, 126.97), ("B", 37.57, 126.98)]);
        let config = test_config(tmp.path(), grid, &uri, false);

        let (_keep, cancel) = no_cancel();
        let report = run_pipeline(
            config,
            &ModelCleaner::new(),
            &FakeConverter::new(),
            &SilentProgress,
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.state, RunState::Done);
        assert!(!report.is_clean());
        assert_eq!(report.failed_units, vec!["B".to_string()]);
        assert_eq!(report.downloads_succeeded, 1);
    }

    #[tokio::test]
    async fn conversion_failures_are_tallied_not_fatal() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();

        mount_assets(&server).await;
        let uri = server.uri();
        mount_listing(
            &server,
            "A",
            1,
            &[listing_item("good", &uri, false), listing_item("bad", &uri, false)],
        )
        .await;
        mount_listing(&server, "A", 2, &[]).await;

        let grid = grid_file(tmp.path(), &[("A", 37.56, 126.97)]);
        let config = test_config(tmp.path(), grid, &uri, true);

        let converter = FakeConverter::failing_on("bad");
        let (_keep, cancel) = no_cancel();
        let report = run_pipeline(config, &ModelCleaner::new(), &converter, &SilentProgress, cancel)
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.conversions_succeeded, 1);
        assert_eq!(report.conversions_failed, 1);
        assert_eq!(report.failed_conversions, vec!["bad".to_string()]);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn records_with_failed_model_downloads_are_not_converted() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();

        let uri = server.uri();
        mount_listing(
            &server,
            "A",
            1,
            &[listing_item("ok", &uri, false), listing_item("missing", &uri, false)],
        )
        .await;
        mount_listing(&server, "A", 2, &[]).await;

        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/obj/ok.obj"))
            .respond_with(ResponseTemplate::new(200).set_body_string("bytes"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/obj/missing.obj"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let grid = grid_file(tmp.path(), &[("A", 37.56, 126.97)]);
        let config = test_config(tmp.path(), grid, &uri, true);

        let converter = FakeConverter::new();
        let (_keep, cancel) = no_cancel();
        let report = run_pipeline(config, &ModelCleaner::new(), &converter, &SilentProgress, cancel)
            .await
            .unwrap();

        assert_eq!(report.downloads_failed, 1);
        assert_eq!(report.failed_jobs, vec!["missing/model".to_string()]);
        let calls = converter.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.ends_with("ok.obj"));
    }

    #[tokio::test]
    async fn unreadable_grid_is_a_fatal_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(
            tmp.path(),
            tmp.path().join("absent.geojson"),
            "http://127.0.0.1:1",
            false,
        );

        let (_keep, cancel) = no_cancel();
        let err = run_pipeline(
            config,
            &ModelCleaner::new(),
            &FakeConverter::new(),
            &SilentProgress,
            cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarvestError::Io { .. }));
    }
}

//! Run lifecycle state and the end-of-run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Coarse pipeline phase, advanced forward-only as stages begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Crawling,
    Cleaning,
    Downloading,
    Converting,
    Done,
    Aborted,
}

impl RunState {
    /// Advance to `next` if it is strictly later than the current phase.
    /// Stages overlap while streaming, so out-of-order notifications from
    /// concurrent tasks are ignored rather than rewinding the state.
    pub fn advance(&mut self, next: RunState) {
        if next > *self {
            *self = next;
        }
    }
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Everything the CLI prints (and can persist) when a run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,

    pub units_total: usize,
    pub failed_units: Vec<String>,

    pub records_discovered: u64,
    pub invalid_items: u64,
    pub records_cleaned: u64,
    pub records_dropped: u64,
    pub duplicates_collapsed: u64,

    pub downloads_succeeded: u64,
    pub downloads_failed: u64,
    pub downloads_skipped: u64,
    pub failed_jobs: Vec<String>,

    pub conversions_succeeded: u64,
    pub conversions_failed: u64,
    pub failed_conversions: Vec<String>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::now_v7(),
            state: RunState::Idle,
            cancelled: false,
            started_at: Utc::now(),
            elapsed_secs: 0.0,
            units_total: 0,
            failed_units: Vec::new(),
            records_discovered: 0,
            invalid_items: 0,
            records_cleaned: 0,
            records_dropped: 0,
            duplicates_collapsed: 0,
            downloads_succeeded: 0,
            downloads_failed: 0,
            downloads_skipped: 0,
            failed_jobs: Vec::new(),
            conversions_succeeded: 0,
            conversions_failed: 0,
            failed_conversions: Vec::new(),
        }
    }

    /// A run is clean when it ran to completion with nothing failed.
    pub fn is_clean(&self) -> bool {
        self.state == RunState::Done
            && !self.cancelled
            && self.failed_units.is_empty()
            && self.downloads_failed == 0
            && self.conversions_failed == 0
    }

    /// Human-readable summary for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("run {} ({:?})\n", self.run_id, self.state));
        if self.cancelled {
            out.push_str("  cancelled by user\n");
        }
        out.push_str(&format!("  elapsed: {:.1}s\n", self.elapsed_secs));
        out.push_str(&format!(
            "  cells: {} crawled, {} failed\n",
            self.units_total,
            self.failed_units.len()
        ));
        out.push_str(&format!(
            "  records: {} discovered, {} invalid, {} duplicates, {} dropped, {} cleaned\n",
            self.records_discovered,
            self.invalid_items,
            self.duplicates_collapsed,
            self.records_dropped,
            self.records_cleaned
        ));
        out.push_str(&format!(
            "  downloads: {} ok, {} skipped, {} failed\n",
            self.downloads_succeeded, self.downloads_skipped, self.downloads_failed
        ));
        out.push_str(&format!(
            "  conversions: {} ok, {} failed\n",
            self.conversions_succeeded, self.conversions_failed
        ));
        for unit in &self.failed_units {
            out.push_str(&format!("  failed cell: {unit}\n"));
        }
        for job in &self.failed_jobs {
            out.push_str(&format!("  failed download: {job}\n"));
        }
        for id in &self.failed_conversions {
            out.push_str(&format!("  failed conversion: {id}\n"));
        }
        out
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

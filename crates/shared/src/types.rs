//! Core domain types for the MeshHarvest pipeline.
//!
//! `RawRecord` mirrors one item of the remote listing response (camelCase
//! wire names). `CleanRecord` is the canonical schema the cleaner produces
//! and the downloader consumes. `DownloadJob`/`DownloadResult` are the unit
//! of work and terminal outcome of the download stage.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// Stable identifier of one building/model record, as assigned by the
/// remote listing service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// Model asset references inside a listing item (wire format is camelCase).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRef {
    /// URL of the OBJ model file.
    #[serde(rename = "objUrl")]
    pub obj_url: String,
    /// File name the service advertises for the model.
    #[serde(rename = "objName")]
    pub obj_name: String,
    /// URL of the texture image, if the model has one.
    #[serde(rename = "textureUrl", default, skip_serializing_if = "Option::is_none")]
    pub texture_url: Option<String>,
    /// File name the service advertises for the texture.
    #[serde(rename = "textureName", default, skip_serializing_if = "Option::is_none")]
    pub texture_name: Option<String>,
}

/// One item returned by the remote listing endpoint.
///
/// `id` and `model` are required and validated at deserialization time; a
/// listing item missing either fails with a typed error instead of being
/// carried as an untyped mapping. Everything else the service sends
/// (camera, types, zoom bounds, dates, ...) is kept as opaque JSON in
/// `extra` so the record survives a round trip through the raw sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Stable record identifier.
    pub id: RecordId,
    /// Display name of the building, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Model and texture asset references.
    pub model: ModelRef,
    /// Geographic location metadata, kept opaque.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<serde_json::Value>,
    /// Any remaining fields from the listing item.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// CleanRecord
// ---------------------------------------------------------------------------

/// Canonical record schema produced by the cleaner.
///
/// Invariant: `id` is unique across the whole run (the orchestrator
/// collapses duplicates discovered in different crawl units).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanRecord {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// URL of the model file.
    pub model_url: String,
    /// Normalized model file name (image extensions stripped, `.obj` ensured).
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_name: Option<String>,
    /// Geographic location metadata, carried through for downstream consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Download jobs and results
// ---------------------------------------------------------------------------

/// Which asset of a record a download job fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Model,
    Texture,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Texture => "texture",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique key of a download job within one run.
pub type JobKey = (RecordId, AssetKind);

/// One asset fetch: a URL and the destination path it is written to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub record_id: RecordId,
    pub kind: AssetKind,
    pub url: String,
    pub dest: PathBuf,
}

impl DownloadJob {
    /// Dedup key: `(record_id, kind)`.
    pub fn key(&self) -> JobKey {
        (self.record_id.clone(), self.kind)
    }
}

/// Terminal status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Succeeded,
    Failed,
    /// An identical job (by key) was already completed this run, or the
    /// destination file already exists from a previous run. Not an error.
    Skipped,
}

/// Exactly one `DownloadResult` is emitted per unique job key per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResult {
    pub job: DownloadJob,
    pub status: DownloadStatus,
    /// Number of fetch attempts actually made (0 for skips).
    pub attempts: u32,
    /// SHA-256 of the downloaded bytes, for succeeded jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Last error message, for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

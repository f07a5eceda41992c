//! Application configuration for MeshHarvest.
//!
//! User config lives at `~/.meshharvest/meshharvest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};
use crate::retry::RetryPolicy;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "meshharvest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".meshharvest";

// ---------------------------------------------------------------------------
// Config structs (matching meshharvest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Concurrency and paging defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Remote endpoint settings.
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// Retry/backoff settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Output directory layout and external tool paths.
    #[serde(default)]
    pub output: OutputConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Grid cells crawled in parallel.
    #[serde(default = "default_crawl_concurrency")]
    pub crawl_concurrency: u32,

    /// Concurrent asset downloads.
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: u32,

    /// Safety bound on pages fetched per grid cell; the authoritative stop
    /// condition is an empty page.
    #[serde(default = "default_page_cap")]
    pub page_cap: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            crawl_concurrency: default_crawl_concurrency(),
            download_concurrency: default_download_concurrency(),
            page_cap: default_page_cap(),
        }
    }
}

fn default_crawl_concurrency() -> u32 {
    3
}
fn default_download_concurrency() -> u32 {
    4
}
fn default_page_cap() -> u32 {
    10
}

/// `[endpoints]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Base URL of the 3D-object listing endpoint.
    #[serde(default)]
    pub listing_url: String,

    /// Camera zoom level sent with listing requests.
    #[serde(default = "default_zoom")]
    pub zoom: f64,

    /// Per-request timeout in seconds (one page fetch or one asset download).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            listing_url: String::new(),
            zoom: default_zoom(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_zoom() -> f64 {
    19.0
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff multiplier per subsequent retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_multiplier() -> f64 {
    2.0
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root directory for all run artifacts.
    #[serde(default = "default_output_root")]
    pub root: String,

    /// Path to the Blender executable. Conversion is skipped when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blender_exe: Option<String>,

    /// Path to the Blender-side conversion script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert_script: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
            blender_exe: None,
            convert_script: None,
        }
    }
}

fn default_output_root() -> String {
    "data/output".into()
}

// ---------------------------------------------------------------------------
// Output layout
// ---------------------------------------------------------------------------

/// Per-stage directories derived from the output root.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub crawler_dir: PathBuf,
    pub cleaner_dir: PathBuf,
    pub obj_dir: PathBuf,
    pub texture_dir: PathBuf,
    pub converter_dir: PathBuf,
}

impl OutputLayout {
    /// Build the stage layout under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            crawler_dir: root.join("crawler"),
            cleaner_dir: root.join("cleaner"),
            obj_dir: root.join("downloader").join("obj"),
            texture_dir: root.join("downloader").join("texture"),
            converter_dir: root.join("converter"),
        }
    }

    /// Create every stage directory.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            &self.crawler_dir,
            &self.cleaner_dir,
            &self.obj_dir,
            &self.texture_dir,
            &self.converter_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| HarvestError::io(dir, e))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.meshharvest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| HarvestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.meshharvest/meshharvest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| HarvestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HarvestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HarvestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HarvestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("crawl_concurrency"));
        assert!(toml_str.contains("page_cap"));
        assert!(toml_str.contains("max_attempts"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.crawl_concurrency, 3);
        assert_eq!(parsed.defaults.page_cap, 10);
        assert_eq!(parsed.retry.max_attempts, 3);
        assert_eq!(parsed.endpoints.timeout_secs, 30);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[endpoints]
listing_url = "https://map.example.com/api/objects"

[output]
root = "/srv/harvest"
blender_exe = "/usr/bin/blender"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.endpoints.listing_url, "https://map.example.com/api/objects");
        assert_eq!(config.endpoints.zoom, 19.0);
        assert_eq!(config.defaults.download_concurrency, 4);
        assert_eq!(config.output.blender_exe.as_deref(), Some("/usr/bin/blender"));
    }

    #[test]
    fn retry_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 250,
            multiplier: 3.0,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn output_layout_derives_stage_dirs() {
        let layout = OutputLayout::new("/tmp/harvest");
        assert_eq!(layout.crawler_dir, PathBuf::from("/tmp/harvest/crawler"));
        assert_eq!(layout.obj_dir, PathBuf::from("/tmp/harvest/downloader/obj"));
        assert_eq!(
            layout.texture_dir,
            PathBuf::from("/tmp/harvest/downloader/texture")
        );
        assert_eq!(layout.converter_dir, PathBuf::from("/tmp/harvest/converter"));
    }

    #[test]
    fn output_layout_creates_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = OutputLayout::new(tmp.path().join("out"));
        layout.create_dirs().expect("create dirs");
        assert!(layout.cleaner_dir.is_dir());
        assert!(layout.texture_dir.is_dir());
    }
}

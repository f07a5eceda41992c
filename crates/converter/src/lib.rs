//! Model conversion boundary: downloaded OBJ + texture → GLB via Blender.
//!
//! The pipeline core only knows the [`ModelConverter`] contract — inputs,
//! output path, success or failure. The real implementation,
//! [`BlenderConverter`], runs Blender in background mode with a conversion
//! script; the tool is long-running and not safe to invoke in parallel, so
//! callers must serialize calls into this boundary (the orchestrator runs
//! conversions one at a time).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use meshharvest_shared::{HarvestError, Result};

// ---------------------------------------------------------------------------
// ModelConverter trait
// ---------------------------------------------------------------------------

/// Converts one downloaded model (plus optional texture) to the output
/// format, returning the path of the converted file.
#[async_trait]
pub trait ModelConverter: Send + Sync {
    async fn convert(&self, model_path: &Path, texture_path: Option<&Path>) -> Result<PathBuf>;
}

// ---------------------------------------------------------------------------
// BlenderConverter
// ---------------------------------------------------------------------------

/// Invokes Blender in background mode (`blender -b -P <script> -- ...`),
/// one job per invocation.
pub struct BlenderConverter {
    exe: PathBuf,
    script: PathBuf,
    out_dir: PathBuf,
}

impl BlenderConverter {
    /// Create a converter writing `.glb` files into `out_dir`.
    pub fn new(exe: impl Into<PathBuf>, script: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir).map_err(|e| HarvestError::io(&out_dir, e))?;

        Ok(Self {
            exe: exe.into(),
            script: script.into(),
            out_dir,
        })
    }

    /// Output path for a given model input: `<out_dir>/<stem>.glb`.
    pub fn output_path(&self, model_path: &Path) -> PathBuf {
        let stem = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".into());
        self.out_dir.join(format!("{stem}.glb"))
    }
}

#[async_trait]
impl ModelConverter for BlenderConverter {
    async fn convert(&self, model_path: &Path, texture_path: Option<&Path>) -> Result<PathBuf> {
        if !model_path.exists() {
            return Err(HarvestError::Conversion(format!(
                "missing model file: {}",
                model_path.display()
            )));
        }
        if let Some(texture) = texture_path {
            if !texture.exists() {
                return Err(HarvestError::Conversion(format!(
                    "missing texture file: {}",
                    texture.display()
                )));
            }
        }

        let output = self.output_path(model_path);

        let mut command = Command::new(&self.exe);
        command
            .arg("-b")
            .arg("-P")
            .arg(&self.script)
            .arg("--")
            .arg("--obj")
            .arg(model_path)
            .arg("--out")
            .arg(&output);
        if let Some(texture) = texture_path {
            command.arg("--texture").arg(texture);
        }

        debug!(model = %model_path.display(), out = %output.display(), "invoking blender");

        let status = command
            .status()
            .await
            .map_err(|e| HarvestError::Conversion(format!("failed to spawn {}: {e}", self.exe.display())))?;

        if !status.success() {
            warn!(model = %model_path.display(), %status, "blender exited with failure");
            return Err(HarvestError::Conversion(format!(
                "{}: blender exited with {status}",
                model_path.display()
            )));
        }

        info!(out = %output.display(), "model converted");
        Ok(output)
    }
}

//! Record cleaning boundary.
//!
//! The orchestrator treats the cleaner as a black box: a pure transform
//! from raw listing records to the canonical schema, where `None` means
//! the record is dropped. [`ModelCleaner`] is the default implementation;
//! its main job is normalizing the advertised model file name, which the
//! listing service sometimes emits with an image extension glued on.

use regex::Regex;

use meshharvest_shared::{CleanRecord, RawRecord};

/// Pure transform from [`RawRecord`] to [`CleanRecord`]; `None` drops the
/// record (e.g. missing required fields).
pub trait RecordCleaner: Send + Sync {
    fn clean(&self, raw: &RawRecord) -> Option<CleanRecord>;
}

/// Default cleaner for the 3D-building listing schema.
pub struct ModelCleaner {
    image_ext: Regex,
}

impl ModelCleaner {
    pub fn new() -> Self {
        Self {
            image_ext: Regex::new(r"(?i)\.(jpe?g|png)\b").unwrap(),
        }
    }

    /// Strip image extensions from a model name and ensure `.obj`.
    fn normalize_model_name(&self, name: &str) -> String {
        let mut out = self.image_ext.replace_all(name, "").into_owned();
        if !out.contains(".obj") {
            out.push_str(".obj");
        }
        out
    }
}

impl Default for ModelCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCleaner for ModelCleaner {
    fn clean(&self, raw: &RawRecord) -> Option<CleanRecord> {
        if raw.model.obj_url.trim().is_empty() || raw.model.obj_name.trim().is_empty() {
            return None;
        }

        let model_name = self.normalize_model_name(&raw.model.obj_name);

        // Texture is optional; when the service gives a URL but no name,
        // fall back to the URL's file name.
        let texture_url = raw
            .model
            .texture_url
            .as_ref()
            .filter(|u| !u.trim().is_empty())
            .cloned();
        let texture_name = texture_url.as_ref().map(|url| {
            raw.model
                .texture_name
                .as_ref()
                .filter(|n| !n.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| {
                    url.rsplit('/')
                        .next()
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .unwrap_or_else(|| format!("{}.jpg", raw.id))
                })
        });

        Some(CleanRecord {
            id: raw.id.clone(),
            name: raw.name.clone(),
            model_url: raw.model.obj_url.clone(),
            model_name,
            texture_url,
            texture_name,
            location: raw.location.clone(),
        })
    }
}

//! Pipeline configuration.
//!
//! [`PatchConfig`] collects everything the pipeline needs to know about the
//! storage layout and the download server. It deserializes from JSON with
//! every field optional, falling back to [`Default`].
//!
//! # Example
//!
//! ```
//! use patchwork_runtime::config::PatchConfig;
//!
//! let config = PatchConfig::from_json_str(r#"{
//!     "remote_base_url": "https://cdn.example.com/patch/aos",
//!     "preload_bundles": ["ui_common", "fonts"]
//! }"#).unwrap();
//!
//! assert_eq!(config.manifest_suffix, ".manifest");
//! assert_eq!(config.remote_url("patch_manifest.json"),
//!            "https://cdn.example.com/patch/aos/patch_manifest.json");
//! ```

use std::path::PathBuf;

use patchwork_manifest::address::{
    name_to_key, name_to_manifest_path, DEFAULT_AGGREGATE_MANIFEST_NAME, DEFAULT_MANIFEST_SUFFIX,
};
use serde::{Deserialize, Serialize};

use crate::diagnostics::LogMode;
use crate::PatchError;

// ---------------------------------------------------------------------------
// PatchConfig
// ---------------------------------------------------------------------------

/// Storage layout, download endpoint, and behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Root directory of the local patch cache (used by
    /// [`FsStorage`](crate::storage::FsStorage)).
    pub patch_root: PathBuf,
    /// Suffix appended to a bundle key to name its sidecar manifest.
    pub manifest_suffix: String,
    /// File name of the aggregate manifest, both locally and on the server.
    pub aggregate_manifest_name: String,
    /// Base URL that bundle keys and the aggregate manifest are appended to.
    /// Empty disables patch checks.
    pub remote_base_url: String,
    /// Progress log verbosity.
    pub log_mode: LogMode,
    /// Bundles loaded into the preload tier by the preload operation.
    pub preload_bundles: Vec<String>,
    /// Extra attempts after a failed download before giving up.
    pub download_retries: u32,
    /// Scheduler ticks to wait before retrying a failed download.
    pub retry_delay_ticks: u32,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            patch_root: PathBuf::from("patch"),
            manifest_suffix: DEFAULT_MANIFEST_SUFFIX.to_owned(),
            aggregate_manifest_name: DEFAULT_AGGREGATE_MANIFEST_NAME.to_owned(),
            remote_base_url: String::new(),
            log_mode: LogMode::default(),
            preload_bundles: Vec::new(),
            download_retries: 2,
            retry_delay_ticks: 30,
        }
    }
}

impl PatchConfig {
    /// Parse a JSON configuration and validate it.
    pub fn from_json_str(text: &str) -> Result<Self, PatchError> {
        let config: Self = serde_json::from_str(text).map_err(|e| PatchError::InvalidConfig {
            details: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the storage layout is unambiguous.
    ///
    /// # Errors
    ///
    /// [`PatchError::InvalidConfig`] if the manifest suffix is empty, either
    /// file name contains a path separator, or the aggregate manifest name
    /// could be mistaken for a bundle file or sidecar.
    pub fn validate(&self) -> Result<(), PatchError> {
        let invalid = |details: String| Err(PatchError::InvalidConfig { details });

        if self.manifest_suffix.is_empty() {
            return invalid("manifest_suffix must not be empty".to_owned());
        }
        if self.aggregate_manifest_name.is_empty() {
            return invalid("aggregate_manifest_name must not be empty".to_owned());
        }
        for (field, value) in [
            ("manifest_suffix", &self.manifest_suffix),
            ("aggregate_manifest_name", &self.aggregate_manifest_name),
        ] {
            if value.contains(['/', '\\']) {
                return invalid(format!("{field} must not contain path separators: {value:?}"));
            }
        }

        let stem = self
            .aggregate_manifest_name
            .strip_suffix(self.manifest_suffix.as_str())
            .unwrap_or(&self.aggregate_manifest_name);
        if looks_like_key(stem) {
            return invalid(format!(
                "aggregate_manifest_name {:?} collides with the bundle key namespace",
                self.aggregate_manifest_name
            ));
        }
        Ok(())
    }

    // -- storage layout ------------------------------------------------------

    /// Storage path of a bundle's data file.
    pub fn bundle_path(&self, bundle_name: &str) -> String {
        name_to_key(bundle_name).into_string()
    }

    /// Storage path of a bundle's sidecar manifest.
    pub fn manifest_path(&self, bundle_name: &str) -> String {
        name_to_manifest_path(bundle_name, &self.manifest_suffix)
    }

    /// Download URL of `file_name` under [`remote_base_url`](Self::remote_base_url).
    pub fn remote_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.remote_base_url.trim_end_matches('/'), file_name)
    }
}

fn looks_like_key(name: &str) -> bool {
    name.len() == 32 && name.chars().all(|c| c.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        PatchConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_json_gives_defaults() {
        assert_eq!(PatchConfig::from_json_str("{}").unwrap(), PatchConfig::default());
    }

    #[test]
    fn unknown_types_are_config_errors() {
        let err = PatchConfig::from_json_str(r#"{"download_retries": "many"}"#).unwrap_err();
        assert!(matches!(err, PatchError::InvalidConfig { .. }));
    }

    #[test]
    fn empty_suffix_is_rejected() {
        let config = PatchConfig {
            manifest_suffix: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn separators_are_rejected() {
        let config = PatchConfig {
            aggregate_manifest_name: "nested/manifest.json".to_owned(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn key_shaped_aggregate_name_is_rejected() {
        let key = name_to_key("anything").into_string();
        let config = PatchConfig {
            aggregate_manifest_name: format!("{key}.manifest"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn layout_paths_use_content_keys() {
        let config = PatchConfig::default();
        let key = name_to_key("ui_login");
        assert_eq!(config.bundle_path("ui_login"), key.as_str());
        assert_eq!(config.manifest_path("ui_login"), format!("{key}.manifest"));
    }

    #[test]
    fn remote_url_joins_with_single_slash() {
        let config = PatchConfig {
            remote_base_url: "http://10.0.0.2:7888/Crc/".to_owned(),
            ..Default::default()
        };
        assert_eq!(config.remote_url("abc"), "http://10.0.0.2:7888/Crc/abc");
    }
}

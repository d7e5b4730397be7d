//! Patchwork Manifest -- content addressing and versioned bundle manifests.
//!
//! This crate holds the engine-independent data model of the patch pipeline:
//! how a logical bundle name maps to an on-disk storage key, what a bundle's
//! manifest entry looks like on the wire, and how two releases are compared.
//!
//! # Modules
//!
//! - [`address`]: Stable storage keys derived from bundle names (BLAKE3 of the
//!   lowercased name) and sidecar manifest paths.
//! - [`entry`]: [`BundleManifestEntry`](entry::BundleManifestEntry), the
//!   per-bundle sidecar record (size, checksum, timestamp, dependencies).
//! - [`manifest`]: [`PatchManifest`](manifest::PatchManifest), the versioned
//!   aggregate of all entries, kept sorted by file name.
//! - [`diff`]: [`ManifestDiff`](diff::ManifestDiff), the set of bundles to
//!   download or remove when moving from one release to another.
//!
//! # Quick Start
//!
//! ```
//! use patchwork_manifest::prelude::*;
//!
//! let manifest = PatchManifest::parse(br#"{
//!     "version": 5,
//!     "list": [
//!         { "fileName": "ui_login", "size": 2048, "md5": "def", "dependencies": ["ui_common"] },
//!         { "fileName": "ui_common", "size": 1024, "md5": "abc", "dependencies": [] }
//!     ]
//! }"#).unwrap();
//!
//! assert_eq!(manifest.version, 5);
//! assert_eq!(manifest.names().collect::<Vec<_>>(), vec!["ui_common", "ui_login"]);
//! assert_eq!(manifest.dependencies("ui_login"), Some(&["ui_common".to_owned()][..]));
//! assert_eq!(name_to_key("UI_Login"), name_to_key("ui_login"));
//! ```

#![deny(unsafe_code)]

pub mod address;
pub mod diff;
pub mod entry;
pub mod manifest;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while reading, writing, or validating manifests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    /// The manifest text is not valid JSON or does not match the schema.
    #[error("malformed manifest: {details}")]
    Parse { details: String },

    /// A manifest could not be rendered to JSON.
    #[error("failed to serialize manifest: {details}")]
    Serialize { details: String },

    /// Two entries in one aggregate manifest share a file name.
    #[error("duplicate manifest entry '{file_name}'")]
    DuplicateEntry { file_name: String },

    /// An entry lists its own file name among its dependencies.
    #[error("bundle '{file_name}' lists itself as a dependency")]
    SelfDependency { file_name: String },

    /// Two distinct bundle names hash to the same storage key.
    #[error("bundle names '{first}' and '{second}' both resolve to storage key {key}")]
    KeyCollision {
        first: String,
        second: String,
        key: String,
    },
}

impl From<serde_json::Error> for ManifestError {
    fn from(err: serde_json::Error) -> Self {
        ManifestError::Parse {
            details: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::address::{
        check_key_collisions, name_to_key, name_to_manifest_path, BundleKey,
        DEFAULT_AGGREGATE_MANIFEST_NAME, DEFAULT_MANIFEST_SUFFIX,
    };
    pub use crate::diff::ManifestDiff;
    pub use crate::entry::{checksum_of, BundleManifestEntry};
    pub use crate::manifest::PatchManifest;
    pub use crate::ManifestError;
}

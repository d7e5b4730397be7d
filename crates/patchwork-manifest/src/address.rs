//! Content addressing: bundle names to storage keys.
//!
//! Bundle names are human-readable and may contain characters that are not
//! safe in file names, or be long enough to hit platform path limits. Every
//! bundle is therefore stored under a [`BundleKey`] -- the first 128 bits of
//! the BLAKE3 digest of the lowercased name, rendered as 32 lowercase hex
//! characters. The bundle's sidecar manifest lives next to it at
//! `<key><manifest-suffix>`.
//!
//! Keys are case-insensitive by construction: `"UI_Login"` and `"ui_login"`
//! address the same file. A collision between two distinct names is a
//! build-time integrity failure, detected by [`check_key_collisions`] when a
//! release is published.
//!
//! # Example
//!
//! ```
//! use patchwork_manifest::address::{name_to_key, name_to_manifest_path};
//!
//! let key = name_to_key("ui/login");
//! assert_eq!(key.as_str().len(), 32);
//! assert_eq!(name_to_manifest_path("ui/login", ".manifest"), format!("{key}.manifest"));
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ManifestError;

/// Suffix appended to a bundle key to form its sidecar manifest file name.
pub const DEFAULT_MANIFEST_SUFFIX: &str = ".manifest";

/// Well-known file name of the aggregate manifest in the patch root.
pub const DEFAULT_AGGREGATE_MANIFEST_NAME: &str = "patch_manifest.json";

/// Number of digest bytes kept in a key (rendered as twice as many hex chars).
const KEY_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// BundleKey
// ---------------------------------------------------------------------------

/// Storage key of a bundle: a truncated BLAKE3 digest of its lowercased name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleKey(String);

impl BundleKey {
    /// The key as a 32-character lowercase hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, returning the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BundleKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Addressing functions
// ---------------------------------------------------------------------------

/// Derive the storage key for `bundle_name`.
///
/// Deterministic and case-insensitive. The key doubles as the bundle's file
/// name (no extension) in both the local patch root and the download server.
pub fn name_to_key(bundle_name: &str) -> BundleKey {
    let lowered = bundle_name.to_lowercase();
    let digest = blake3::hash(lowered.as_bytes());
    BundleKey(hex::encode(&digest.as_bytes()[..KEY_BYTES]))
}

/// Path (relative to the patch root) of the sidecar manifest for `bundle_name`.
pub fn name_to_manifest_path(bundle_name: &str, manifest_suffix: &str) -> String {
    format!("{}{}", name_to_key(bundle_name), manifest_suffix)
}

/// Verify that no two distinct bundle names share a storage key.
///
/// Names that differ only by letter case alias the same file and are reported
/// as collisions too. Exact duplicates are ignored.
pub fn check_key_collisions<'a>(
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), ManifestError> {
    let mut seen: HashMap<BundleKey, &'a str> = HashMap::new();
    for name in names {
        let key = name_to_key(name);
        match seen.get(&key) {
            Some(existing) if *existing != name => {
                return Err(ManifestError::KeyCollision {
                    first: (*existing).to_owned(),
                    second: name.to_owned(),
                    key: key.into_string(),
                });
            }
            Some(_) => {}
            None => {
                seen.insert(key, name);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

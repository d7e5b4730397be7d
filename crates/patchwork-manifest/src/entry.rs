//! Per-bundle manifest entries.
//!
//! A [`BundleManifestEntry`] describes one bundle file: its logical name, byte
//! size, MD5 checksum, last write time, and the names of the bundles it
//! depends on. The same record is stored twice on disk: once as a sidecar next
//! to the bundle (`<key><manifest-suffix>`) and once inside the aggregate
//! [`PatchManifest`](crate::manifest::PatchManifest).
//!
//! # Wire format
//!
//! ```json
//! {
//!   "fileName": "ui_login",
//!   "size": 2048,
//!   "md5": "e2fc714c4727ee9395f324cd2e7f331f",
//!   "lastWriteTimeUtc": "03/14/2024 09:26:53.589",
//!   "dependencies": ["ui_common"]
//! }
//! ```
//!
//! `lastWriteTimeUtc` may be omitted; `dependencies` may be omitted or `null`,
//! both meaning "no dependencies".

use chrono::{DateTime, SubsecRound, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize};

use crate::address::{name_to_key, BundleKey};
use crate::ManifestError;

/// Compute the lowercase hex MD5 checksum stored in the `md5` field.
pub fn checksum_of(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// BundleManifestEntry
// ---------------------------------------------------------------------------

/// File metadata and declared dependencies of a single bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifestEntry {
    /// Logical bundle name (not the storage key).
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// Size of the bundle file in bytes.
    #[serde(rename = "size")]
    pub size: u64,
    /// Lowercase hex MD5 of the bundle bytes.
    #[serde(rename = "md5")]
    pub checksum: String,
    /// Last write time of the bundle at build time, millisecond precision.
    #[serde(
        rename = "lastWriteTimeUtc",
        default,
        with = "timestamp_format",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified_utc: Option<DateTime<Utc>>,
    /// Declared (one-level) dependencies, in load order.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub dependencies: Vec<String>,
}

impl BundleManifestEntry {
    /// Describe a bundle from its raw bytes, as the publisher does at build time.
    ///
    /// The timestamp is truncated to milliseconds so the entry survives a
    /// trip through the wire format unchanged.
    pub fn describe(
        file_name: impl Into<String>,
        bytes: &[u8],
        last_modified_utc: DateTime<Utc>,
        dependencies: Vec<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            size: bytes.len() as u64,
            checksum: checksum_of(bytes),
            last_modified_utc: Some(last_modified_utc.trunc_subsecs(3)),
            dependencies,
        }
    }

    /// Parse a sidecar manifest.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let entry: Self = serde_json::from_slice(bytes)?;
        entry.validate()?;
        Ok(entry)
    }

    /// Render the entry as pretty-printed JSON (the sidecar format).
    pub fn to_json_pretty(&self) -> Result<String, ManifestError> {
        serde_json::to_string_pretty(self).map_err(|e| ManifestError::Serialize {
            details: e.to_string(),
        })
    }

    /// Check structural invariants: no self-dependency.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.dependencies.iter().any(|d| *d == self.file_name) {
            return Err(ManifestError::SelfDependency {
                file_name: self.file_name.clone(),
            });
        }
        Ok(())
    }

    /// Storage key of this bundle.
    pub fn key(&self) -> BundleKey {
        name_to_key(&self.file_name)
    }

    /// Whether `bytes` match this entry's recorded size and checksum.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() as u64 == self.size && self.checksum.eq_ignore_ascii_case(&checksum_of(bytes))
    }

    /// Whether two entries describe the same published content.
    ///
    /// Timestamps are ignored: rebuilding identical bytes must not trigger a
    /// download.
    pub fn same_content(&self, other: &Self) -> bool {
        self.size == other.size
            && self.checksum.eq_ignore_ascii_case(&other.checksum)
            && self.dependencies == other.dependencies
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Timestamp format
// ---------------------------------------------------------------------------

/// `MM/dd/yyyy HH:mm:ss.fff` in UTC.
mod timestamp_format {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%m/%d/%Y %H:%M:%S%.3f";

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(time) => serializer.serialize_str(&time.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => NaiveDateTime::parse_from_str(text, FORMAT)
                .map(|naive| Some(Utc.from_utc_datetime(&naive)))
                .map_err(serde::de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Versioned aggregate manifest of a release.
//!
//! A [`PatchManifest`] lists every bundle of one release. It is produced at
//! build time, written once, and read-only at runtime: a newer release
//! supersedes the whole file rather than editing it in place.
//!
//! # Ordering
//!
//! Entries are kept sorted ascending by `fileName` (ordinal byte order) at
//! all times. Serialization therefore always emits a deterministic, diffable
//! document, and lookups use binary search. [`PatchManifest::parse`] accepts
//! unsorted input and sorts it, but rejects duplicate names.
//!
//! # Wire format
//!
//! ```json
//! { "version": 5, "list": [ { "fileName": "ui_common", ... }, ... ] }
//! ```

use serde::{Deserialize, Serialize};

use crate::entry::BundleManifestEntry;
use crate::ManifestError;

// ---------------------------------------------------------------------------
// PatchManifest
// ---------------------------------------------------------------------------

/// A versioned, sorted collection of [`BundleManifestEntry`] keyed by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchManifest {
    /// Release version (the app build number of the release).
    pub version: u32,
    /// Entries sorted ascending by file name, unique.
    #[serde(default)]
    list: Vec<BundleManifestEntry>,
}

impl PatchManifest {
    /// Create an empty manifest for `version`.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            list: Vec::new(),
        }
    }

    /// Build a manifest from entries in any order.
    ///
    /// # Errors
    ///
    /// - [`ManifestError::DuplicateEntry`] if two entries share a file name.
    /// - [`ManifestError::SelfDependency`] if an entry depends on itself.
    pub fn from_entries(
        version: u32,
        entries: impl IntoIterator<Item = BundleManifestEntry>,
    ) -> Result<Self, ManifestError> {
        let mut manifest = Self {
            version,
            list: entries.into_iter().collect(),
        };
        manifest.normalize()?;
        Ok(manifest)
    }

    /// Parse an aggregate manifest from JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let mut manifest: Self = serde_json::from_slice(bytes)?;
        manifest.normalize()?;
        Ok(manifest)
    }

    /// Render as pretty-printed JSON, entries in ascending file-name order.
    pub fn to_json_pretty(&self) -> Result<String, ManifestError> {
        serde_json::to_string_pretty(self).map_err(|e| ManifestError::Serialize {
            details: e.to_string(),
        })
    }

    /// Sort entries, then reject duplicates and self-dependencies.
    fn normalize(&mut self) -> Result<(), ManifestError> {
        let sorted = self
            .list
            .windows(2)
            .all(|pair| pair[0].file_name <= pair[1].file_name);
        if !sorted {
            tracing::debug!(
                version = self.version,
                entries = self.list.len(),
                "manifest entries were not in file-name order; sorting"
            );
            self.list.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        }

        if let Some(pair) = self
            .list
            .windows(2)
            .find(|pair| pair[0].file_name == pair[1].file_name)
        {
            return Err(ManifestError::DuplicateEntry {
                file_name: pair[0].file_name.clone(),
            });
        }

        self.list.iter().try_for_each(BundleManifestEntry::validate)
    }

    // -- queries -------------------------------------------------------------

    /// Look up the entry for `file_name`.
    pub fn get(&self, file_name: &str) -> Option<&BundleManifestEntry> {
        self.position(file_name).ok().map(|idx| &self.list[idx])
    }

    /// Whether the manifest has an entry for `file_name`.
    pub fn contains(&self, file_name: &str) -> bool {
        self.position(file_name).is_ok()
    }

    /// Declared one-level dependencies of `file_name`, in load order.
    ///
    /// Returns `None` if the bundle is not in the manifest. Transitive closure
    /// is the caller's job.
    pub fn dependencies(&self, file_name: &str) -> Option<&[String]> {
        self.get(file_name).map(|entry| entry.dependencies.as_slice())
    }

    /// All entries, sorted ascending by file name.
    pub fn entries(&self) -> &[BundleManifestEntry] {
        &self.list
    }

    /// Iterate over entries in file-name order.
    pub fn iter(&self) -> impl Iterator<Item = &BundleManifestEntry> {
        self.list.iter()
    }

    /// Iterate over bundle names in ascending order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.list.iter().map(|entry| entry.file_name.as_str())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether the manifest has no entries.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Sum of all bundle sizes in bytes.
    pub fn total_size(&self) -> u64 {
        self.list.iter().map(|entry| entry.size).sum()
    }

    // -- construction --------------------------------------------------------

    /// Insert or replace the entry for `entry.file_name`, keeping order.
    ///
    /// Returns the replaced entry, if any. Used by build tooling while a
    /// release is being assembled; published manifests are never edited.
    pub fn insert(
        &mut self,
        entry: BundleManifestEntry,
    ) -> Result<Option<BundleManifestEntry>, ManifestError> {
        entry.validate()?;
        match self.position(&entry.file_name) {
            Ok(idx) => Ok(Some(std::mem::replace(&mut self.list[idx], entry))),
            Err(idx) => {
                self.list.insert(idx, entry);
                Ok(None)
            }
        }
    }

    /// Remove and return the entry for `file_name`.
    pub fn remove(&mut self, file_name: &str) -> Option<BundleManifestEntry> {
        self.position(file_name)
            .ok()
            .map(|idx| self.list.remove(idx))
    }

    fn position(&self, file_name: &str) -> Result<usize, usize> {
        self.list
            .binary_search_by(|entry| entry.file_name.as_str().cmp(file_name))
    }
}

impl<'a> IntoIterator for &'a PatchManifest {
    type Item = &'a BundleManifestEntry;
    type IntoIter = std::slice::Iter<'a, BundleManifestEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

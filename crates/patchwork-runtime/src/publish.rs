//! Release publishing: the producer side of the patch protocol.
//!
//! [`publish`] lays out a release in a [`PatchStorage`] exactly as clients
//! expect to find it under `remote_base_url`: one content-addressed file per
//! bundle, one sidecar manifest per bundle, and the sorted aggregate manifest,
//! written last.

use chrono::{DateTime, Utc};
use patchwork_manifest::address::check_key_collisions;
use patchwork_manifest::entry::BundleManifestEntry;
use patchwork_manifest::manifest::PatchManifest;

use crate::config::PatchConfig;
use crate::storage::PatchStorage;
use crate::PatchError;

/// One bundle of a release, before publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSource {
    /// Logical bundle name.
    pub name: String,
    /// Bundle file contents.
    pub bytes: Vec<u8>,
    /// Declared dependencies, in load order.
    pub dependencies: Vec<String>,
    /// Build time recorded in the manifest. `None` means "now".
    pub last_modified_utc: Option<DateTime<Utc>>,
}

impl BundleSource {
    /// A bundle with no dependencies.
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            dependencies: Vec::new(),
            last_modified_utc: None,
        }
    }

    /// Set the declared dependencies.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Set the recorded build time.
    pub fn modified_at(mut self, time: DateTime<Utc>) -> Self {
        self.last_modified_utc = Some(time);
        self
    }
}

/// Write release `version` of `sources` into `storage`.
///
/// # Errors
///
/// - [`PatchError::InvalidBundleName`] for an empty name.
/// - [`PatchError::Integrity`] if two names share a storage key, a name
///   appears twice, or a bundle depends on itself.
/// - [`PatchError::Internal`] if storage rejects a write.
pub fn publish(
    storage: &mut dyn PatchStorage,
    config: &PatchConfig,
    version: u32,
    sources: &[BundleSource],
) -> Result<PatchManifest, PatchError> {
    config.validate()?;
    if let Some(source) = sources.iter().find(|s| s.name.trim().is_empty()) {
        return Err(PatchError::InvalidBundleName {
            name: source.name.clone(),
        });
    }
    check_key_collisions(sources.iter().map(|s| s.name.as_str()))
        .map_err(|source| PatchError::Integrity { source })?;

    let now = Utc::now();
    let manifest = PatchManifest::from_entries(
        version,
        sources.iter().map(|s| {
            BundleManifestEntry::describe(
                s.name.clone(),
                &s.bytes,
                s.last_modified_utc.unwrap_or(now),
                s.dependencies.clone(),
            )
        }),
    )
    .map_err(|source| PatchError::Integrity { source })?;

    for entry in manifest.iter() {
        for dep in &entry.dependencies {
            if !manifest.contains(dep) {
                tracing::warn!(
                    bundle = %entry.file_name,
                    dependency = %dep,
                    "dependency is not part of this release"
                );
            }
        }
    }

    for source in sources {
        let Some(entry) = manifest.get(&source.name) else {
            continue;
        };
        storage
            .write(&config.bundle_path(&source.name), &source.bytes)
            .map_err(PatchError::internal)?;
        let sidecar = entry.to_json_pretty().map_err(PatchError::internal)?;
        storage
            .write(&config.manifest_path(&source.name), sidecar.as_bytes())
            .map_err(PatchError::internal)?;
    }
    let aggregate = manifest.to_json_pretty().map_err(PatchError::internal)?;
    storage
        .write(&config.aggregate_manifest_name, aggregate.as_bytes())
        .map_err(PatchError::internal)?;

    tracing::info!(version, bundles = manifest.len(), bytes = manifest.total_size(), "release published");
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

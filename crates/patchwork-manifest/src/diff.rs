//! Release-to-release manifest comparison.
//!
//! [`ManifestDiff::between`] walks the local and remote manifests in lockstep
//! (both are sorted by file name) and classifies every bundle:
//!
//! - present remotely but not locally -> download,
//! - present in both with different size, checksum, or dependencies -> download,
//! - present locally but not remotely -> remove,
//! - otherwise unchanged.
//!
//! Timestamps never trigger a download on their own.

use std::cmp::Ordering;

use crate::entry::BundleManifestEntry;
use crate::manifest::PatchManifest;

// ---------------------------------------------------------------------------
// ManifestDiff
// ---------------------------------------------------------------------------

/// What has to change locally to match a remote release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    /// Remote entries that must be downloaded, in file-name order.
    pub downloads: Vec<BundleManifestEntry>,
    /// Local bundle names absent from the remote release, in file-name order.
    pub removals: Vec<String>,
    /// Names of bundles whose content is identical on both sides.
    pub unchanged: Vec<String>,
}

impl ManifestDiff {
    /// Compare `local` against `remote`.
    pub fn between(local: &PatchManifest, remote: &PatchManifest) -> Self {
        let mut diff = Self::default();
        let mut local_iter = local.entries().iter().peekable();
        let mut remote_iter = remote.entries().iter().peekable();

        loop {
            match (local_iter.peek(), remote_iter.peek()) {
                (Some(l), Some(r)) => match l.file_name.cmp(&r.file_name) {
                    Ordering::Less => {
                        diff.removals.push(l.file_name.clone());
                        local_iter.next();
                    }
                    Ordering::Greater => {
                        diff.downloads.push((*r).clone());
                        remote_iter.next();
                    }
                    Ordering::Equal => {
                        if l.same_content(r) {
                            diff.unchanged.push(r.file_name.clone());
                        } else {
                            diff.downloads.push((*r).clone());
                        }
                        local_iter.next();
                        remote_iter.next();
                    }
                },
                (Some(l), None) => {
                    diff.removals.push(l.file_name.clone());
                    local_iter.next();
                }
                (None, Some(r)) => {
                    diff.downloads.push((*r).clone());
                    remote_iter.next();
                }
                (None, None) => break,
            }
        }

        diff
    }

    /// Total bytes to download.
    pub fn download_bytes(&self) -> u64 {
        self.downloads.iter().map(|entry| entry.size).sum()
    }

    /// Whether the local release already matches the remote one.
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty() && self.removals.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size: u64, checksum: &str) -> BundleManifestEntry {
        BundleManifestEntry {
            file_name: name.to_owned(),
            size,
            checksum: checksum.to_owned(),
            last_modified_utc: None,
            dependencies: Vec::new(),
        }
    }

    fn manifest(version: u32, entries: Vec<BundleManifestEntry>) -> PatchManifest {
        PatchManifest::from_entries(version, entries).unwrap()
    }

    #[test]
    fn identical_manifests_have_empty_diff() {
        let m = manifest(1, vec![entry("a", 1, "x"), entry("b", 2, "y")]);
        let diff = ManifestDiff::between(&m, &m);
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged, vec!["a", "b"]);
    }

    #[test]
    fn empty_local_downloads_everything() {
        let remote = manifest(2, vec![entry("a", 10, "x"), entry("b", 20, "y")]);
        let diff = ManifestDiff::between(&PatchManifest::default(), &remote);
        assert_eq!(diff.downloads.len(), 2);
        assert_eq!(diff.download_bytes(), 30);
        assert!(diff.removals.is_empty());
    }

    #[test]
    fn classifies_added_changed_removed() {
        let local = manifest(1, vec![entry("a", 1, "x"), entry("b", 2, "y"), entry("d", 4, "w")]);
        let remote = manifest(2, vec![entry("b", 2, "changed"), entry("c", 3, "z"), entry("d", 4, "w")]);
        let diff = ManifestDiff::between(&local, &remote);

        let downloads: Vec<_> = diff.downloads.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(downloads, vec!["b", "c"]);
        assert_eq!(diff.removals, vec!["a"]);
        assert_eq!(diff.unchanged, vec!["d"]);
        assert_eq!(diff.download_bytes(), 5);
    }

    #[test]
    fn size_change_alone_triggers_download() {
        let local = manifest(1, vec![entry("a", 1, "x")]);
        let remote = manifest(2, vec![entry("a", 2, "x")]);
        assert_eq!(ManifestDiff::between(&local, &remote).downloads.len(), 1);
    }

    #[test]
    fn dependency_change_triggers_download() {
        let local = manifest(1, vec![entry("a", 1, "x"), entry("b", 1, "y")]);
        let mut changed = entry("a", 1, "x");
        changed.dependencies.push("b".to_owned());
        let remote = manifest(2, vec![changed, entry("b", 1, "y")]);
        let diff = ManifestDiff::between(&local, &remote);
        assert_eq!(diff.downloads[0].file_name, "a");
    }

    #[test]
    fn checksum_case_is_not_a_change() {
        let local = manifest(1, vec![entry("a", 1, "ABC")]);
        let remote = manifest(2, vec![entry("a", 1, "abc")]);
        assert!(ManifestDiff::between(&local, &remote).is_empty());
    }
}

//! Patch check and patch application.
//!
//! [`check_patch`](crate::system::PatchSystem::check_patch) downloads the
//! remote aggregate manifest and diffs it against the local one, producing a
//! [`PatchPlan`]. [`patch`](crate::system::PatchSystem::patch) then executes
//! the plan:
//!
//! 1. Each planned bundle is downloaded from `<remote_base_url>/<key>`,
//!    verified against its manifest entry, and written together with its
//!    sidecar manifest.
//! 2. Bundles absent from the remote manifest are deleted.
//! 3. The remote aggregate manifest is written last, so a patch interrupted
//!    part-way leaves the previous release's aggregate in place and the next
//!    check re-plans the missing files.
//!
//! Failed downloads are retried after `retry_delay_ticks` ticks, up to
//! `download_retries` times.

use patchwork_manifest::diff::ManifestDiff;
use patchwork_manifest::entry::{checksum_of, BundleManifestEntry};
use patchwork_manifest::manifest::PatchManifest;

use crate::context::PatchContext;
use crate::operation::{OperationHandle, Resumable, Step};
use crate::transport::{FetchPoll, RequestId};
use crate::PatchError;

// ---------------------------------------------------------------------------
// PatchPlan / PatchSummary
// ---------------------------------------------------------------------------

/// What a patch has to do to bring local storage up to a remote release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlan {
    /// The remote aggregate manifest.
    pub remote: PatchManifest,
    /// Version of the local aggregate manifest, if one is installed.
    pub local_version: Option<u32>,
    /// Entries to download, sorted by file name.
    pub downloads: Vec<BundleManifestEntry>,
    /// Bundles to delete, sorted.
    pub removals: Vec<String>,
    /// Total size of `downloads` in bytes.
    pub download_bytes: u64,
}

impl PatchPlan {
    /// Whether local storage already matches the remote release.
    pub fn is_up_to_date(&self) -> bool {
        self.downloads.is_empty()
            && self.removals.is_empty()
            && self.local_version == Some(self.remote.version)
    }
}

/// Result of a completed patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSummary {
    /// Version of the installed aggregate manifest.
    pub version: u32,
    /// Bundles written, in plan order.
    pub files_written: Vec<String>,
    /// Total bytes of bundle data written.
    pub bytes_written: u64,
    /// Bundles deleted.
    pub removed: Vec<String>,
}

/// Per-file progress callback of a patch.
pub type FileCallback = Box<dyn FnMut(&BundleManifestEntry)>;

/// Read the installed aggregate manifest, if any.
pub(crate) fn read_local_manifest(ctx: &PatchContext) -> Result<Option<PatchManifest>, PatchError> {
    let path = &ctx.config.aggregate_manifest_name;
    if !ctx.storage.exists(path) {
        return Ok(None);
    }
    let bytes = ctx.storage.read(path).map_err(PatchError::internal)?;
    PatchManifest::parse(&bytes)
        .map(Some)
        .map_err(|source| PatchError::Parse {
            path: path.clone(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

enum FetchPhase {
    Idle,
    InFlight(RequestId),
    Cooldown(u32),
}

enum FetchStep {
    Pending,
    Done(Vec<u8>),
    Failed(PatchError),
}

/// One download with retry.
struct Fetch {
    url: String,
    attempts: u32,
    phase: FetchPhase,
}

impl Fetch {
    fn new(url: String) -> Self {
        Self {
            url,
            attempts: 0,
            phase: FetchPhase::Idle,
        }
    }

    /// Drive the download. `verify` rejects bad payloads, which are retried
    /// like transport failures.
    fn advance(
        &mut self,
        ctx: &mut PatchContext,
        verify: impl Fn(&[u8]) -> Result<(), PatchError>,
    ) -> FetchStep {
        loop {
            match self.phase {
                FetchPhase::Idle => {
                    self.attempts += 1;
                    self.phase = FetchPhase::InFlight(ctx.transport.begin(&self.url));
                }
                FetchPhase::Cooldown(0) => self.phase = FetchPhase::Idle,
                FetchPhase::Cooldown(ticks) => {
                    self.phase = FetchPhase::Cooldown(ticks - 1);
                    return FetchStep::Pending;
                }
                FetchPhase::InFlight(request) => {
                    let error = match ctx.transport.poll(request) {
                        FetchPoll::Pending => return FetchStep::Pending,
                        FetchPoll::Ready(bytes) => match verify(&bytes) {
                            Ok(()) => return FetchStep::Done(bytes),
                            Err(error) => error,
                        },
                        FetchPoll::Failed(message) => PatchError::Download {
                            url: self.url.clone(),
                            attempts: self.attempts,
                            message,
                        },
                    };
                    return self.retry_or_fail(ctx, error);
                }
            }
        }
    }

    fn retry_or_fail(&mut self, ctx: &PatchContext, error: PatchError) -> FetchStep {
        if self.attempts > ctx.config.download_retries {
            return FetchStep::Failed(error);
        }
        tracing::warn!(
            url = %self.url,
            attempt = self.attempts,
            error = %error,
            "download failed, retrying"
        );
        self.phase = FetchPhase::Cooldown(ctx.config.retry_delay_ticks);
        FetchStep::Pending
    }
}

// ---------------------------------------------------------------------------
// CheckPatchOp
// ---------------------------------------------------------------------------

/// Downloads the remote aggregate manifest and plans a patch.
pub(crate) struct CheckPatchOp {
    fetch: Option<Fetch>,
    handle: OperationHandle<PatchPlan>,
}

impl CheckPatchOp {
    pub(crate) fn new() -> Self {
        Self {
            fetch: None,
            handle: OperationHandle::new(),
        }
    }
}

impl Resumable for CheckPatchOp {
    type Output = PatchPlan;

    fn handle(&self) -> &OperationHandle<PatchPlan> {
        &self.handle
    }

    fn label(&self) -> String {
        "check_patch".to_owned()
    }

    fn step(&mut self, ctx: &mut PatchContext) -> Step<PatchPlan> {
        if ctx.config.remote_base_url.is_empty() {
            return Step::Fail(PatchError::InvalidConfig {
                details: "remote_base_url is not set".to_owned(),
            });
        }
        let fetch = self.fetch.get_or_insert_with(|| {
            Fetch::new(ctx.config.remote_url(&ctx.config.aggregate_manifest_name))
        });
        match fetch.advance(ctx, |_| Ok(())) {
            FetchStep::Pending => Step::Yield,
            FetchStep::Failed(error) => Step::Fail(error),
            FetchStep::Done(bytes) => {
                let url = fetch.url.clone();
                match build_plan(ctx, &url, &bytes) {
                    Ok(plan) => Step::Complete(plan),
                    Err(error) => Step::Fail(error),
                }
            }
        }
    }
}

fn build_plan(ctx: &mut PatchContext, url: &str, remote_bytes: &[u8]) -> Result<PatchPlan, PatchError> {
    let remote = PatchManifest::parse(remote_bytes).map_err(|source| PatchError::Parse {
        path: url.to_owned(),
        source,
    })?;
    let local = read_local_manifest(ctx)?;
    let local_version = local.as_ref().map(|m| m.version);
    if ctx.manifest_version.is_none() {
        ctx.manifest_version = local_version;
    }
    let local = local.unwrap_or_else(|| PatchManifest::new(0));

    let diff = ManifestDiff::between(&local, &remote);
    let mut downloads = diff.downloads;
    for name in &diff.unchanged {
        let intact = ctx.storage.exists(&ctx.config.bundle_path(name))
            && ctx.storage.exists(&ctx.config.manifest_path(name));
        if intact {
            continue;
        }
        if let Some(entry) = remote.get(name) {
            tracing::warn!(bundle = %name, "bundle missing from local storage, scheduling download");
            downloads.push(entry.clone());
        }
    }
    downloads.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    let download_bytes = downloads.iter().map(|e| e.size).sum();

    if ctx.verbose() {
        tracing::info!(
            local_version = ?local_version,
            remote_version = remote.version,
            downloads = downloads.len(),
            removals = diff.removals.len(),
            download_bytes,
            "patch check complete"
        );
    }
    Ok(PatchPlan {
        remote,
        local_version,
        downloads,
        removals: diff.removals,
        download_bytes,
    })
}

// ---------------------------------------------------------------------------
// PatchOp
// ---------------------------------------------------------------------------

/// Applies a [`PatchPlan`]: downloads, removals, then the aggregate manifest.
pub(crate) struct PatchOp {
    plan: PatchPlan,
    next_download: usize,
    next_removal: usize,
    fetch: Option<Fetch>,
    summary: PatchSummary,
    on_file: Option<FileCallback>,
    handle: OperationHandle<PatchSummary>,
}

impl PatchOp {
    pub(crate) fn new(plan: PatchPlan, on_file: Option<FileCallback>) -> Self {
        let summary = PatchSummary {
            version: plan.remote.version,
            ..Default::default()
        };
        Self {
            plan,
            next_download: 0,
            next_removal: 0,
            fetch: None,
            summary,
            on_file,
            handle: OperationHandle::new(),
        }
    }

    fn download(&mut self, ctx: &mut PatchContext) -> Result<bool, PatchError> {
        let entry = self.plan.downloads[self.next_download].clone();
        let fetch = self
            .fetch
            .get_or_insert_with(|| Fetch::new(ctx.config.remote_url(entry.key().as_str())));
        let bytes = match fetch.advance(ctx, |bytes| verify(&entry, bytes)) {
            FetchStep::Pending => return Ok(false),
            FetchStep::Failed(error) => return Err(error),
            FetchStep::Done(bytes) => bytes,
        };
        self.fetch = None;

        let name = &entry.file_name;
        ctx.storage
            .write(&ctx.config.bundle_path(name), &bytes)
            .map_err(PatchError::internal)?;
        let sidecar = entry.to_json_pretty().map_err(PatchError::internal)?;
        ctx.storage
            .write(&ctx.config.manifest_path(name), sidecar.as_bytes())
            .map_err(PatchError::internal)?;

        if ctx.registry.contains_bundle(name) {
            tracing::warn!(bundle = %name, "patched a resident bundle; unload it to pick up the new version");
        }
        if ctx.verbose() {
            tracing::info!(bundle = %name, key = %entry.key(), size = entry.size, "file patched");
        }
        if let Some(on_file) = self.on_file.as_mut() {
            on_file(&entry);
        }
        self.summary.files_written.push(entry.file_name.clone());
        self.summary.bytes_written += entry.size;
        self.next_download += 1;
        Ok(true)
    }

    fn remove(&mut self, ctx: &mut PatchContext) -> Result<(), PatchError> {
        let name = self.plan.removals[self.next_removal].clone();
        ctx.storage
            .remove(&ctx.config.bundle_path(&name))
            .map_err(PatchError::internal)?;
        ctx.storage
            .remove(&ctx.config.manifest_path(&name))
            .map_err(PatchError::internal)?;
        if ctx.registry.contains_bundle(&name) {
            tracing::warn!(bundle = %name, "removed the file of a resident bundle");
        }
        if ctx.verbose() {
            tracing::info!(bundle = %name, "file removed");
        }
        self.summary.removed.push(name);
        self.next_removal += 1;
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut PatchContext) -> Result<PatchSummary, PatchError> {
        let text = self.plan.remote.to_json_pretty().map_err(PatchError::internal)?;
        ctx.storage
            .write(&ctx.config.aggregate_manifest_name, text.as_bytes())
            .map_err(PatchError::internal)?;
        ctx.manifest_version = Some(self.plan.remote.version);
        if ctx.verbose() {
            tracing::info!(
                version = self.summary.version,
                files = self.summary.files_written.len(),
                bytes = self.summary.bytes_written,
                removed = self.summary.removed.len(),
                "patch applied"
            );
        }
        Ok(self.summary.clone())
    }
}

fn verify(entry: &BundleManifestEntry, bytes: &[u8]) -> Result<(), PatchError> {
    if entry.matches(bytes) {
        return Ok(());
    }
    Err(PatchError::ChecksumMismatch {
        name: entry.file_name.clone(),
        expected: format!("{} ({} bytes)", entry.checksum, entry.size),
        actual: format!("{} ({} bytes)", checksum_of(bytes), bytes.len()),
    })
}

impl Resumable for PatchOp {
    type Output = PatchSummary;

    fn handle(&self) -> &OperationHandle<PatchSummary> {
        &self.handle
    }

    fn label(&self) -> String {
        format!("patch(v{})", self.plan.remote.version)
    }

    fn step(&mut self, ctx: &mut PatchContext) -> Step<PatchSummary> {
        let result = if self.next_download < self.plan.downloads.len() {
            self.download(ctx).map(|_| None)
        } else if self.next_removal < self.plan.removals.len() {
            self.remove(ctx).map(|()| None)
        } else {
            self.finalize(ctx).map(Some)
        };
        match result {
            Ok(None) => Step::Yield,
            Ok(Some(summary)) => Step::Complete(summary),
            Err(error) => Step::Fail(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::RawBundleDecoder;
    use crate::config::PatchConfig;
    use crate::diagnostics::CollectingSink;
    use crate::storage::{MemoryStorage, PatchStorage};
    use crate::transport::MemoryTransport;

    const BASE: &str = "mem://cdn";

    fn context(local: &MemoryStorage, transport: &MemoryTransport, retries: u32) -> PatchContext {
        let config = PatchConfig {
            remote_base_url: BASE.to_owned(),
            download_retries: retries,
            retry_delay_ticks: 2,
            ..Default::default()
        };
        PatchContext::new(
            config,
            Box::new(local.clone()),
            Box::new(transport.clone()),
            Box::new(RawBundleDecoder),
            Box::new(CollectingSink::new()),
        )
    }

    fn run<R: Resumable>(op: &mut R, ctx: &mut PatchContext) -> (Result<R::Output, PatchError>, u32) {
        for pumps in 1..=1_000 {
            match op.step(ctx) {
                Step::Yield => {}
                Step::Complete(output) => return (Ok(output), pumps),
                Step::Fail(error) => return (Err(error), pumps),
            }
        }
        panic!("operation did not finish");
    }

    fn entry(name: &str, contents: &str) -> BundleManifestEntry {
        BundleManifestEntry {
            file_name: name.to_owned(),
            size: contents.len() as u64,
            checksum: checksum_of(contents.as_bytes()),
            last_modified_utc: None,
            dependencies: Vec::new(),
        }
    }

    fn serve_release(transport: &MemoryTransport, version: u32, files: &[(&str, &str)]) -> PatchManifest {
        let manifest =
            PatchManifest::from_entries(version, files.iter().map(|(n, c)| entry(n, c))).unwrap();
        for (name, contents) in files {
            let key = entry(name, contents).key();
            transport.serve(format!("{BASE}/{key}"), contents.as_bytes().to_vec());
        }
        transport.serve(
            format!("{BASE}/patch_manifest.json"),
            manifest.to_json_pretty().unwrap(),
        );
        manifest
    }

    // -- 1. Checking ---------------------------------------------------------

    #[test]
    fn check_without_base_url_is_config_error() {
        let mut ctx = context(&MemoryStorage::new(), &MemoryTransport::new(), 0);
        ctx.config.remote_base_url.clear();
        let (result, _) = run(&mut CheckPatchOp::new(), &mut ctx);
        assert!(matches!(result, Err(PatchError::InvalidConfig { .. })));
    }

    #[test]
    fn fresh_install_downloads_everything() {
        let transport = MemoryTransport::new();
        serve_release(&transport, 3, &[("b", "bb"), ("a", "a")]);
        let mut ctx = context(&MemoryStorage::new(), &transport, 0);

        let plan = run(&mut CheckPatchOp::new(), &mut ctx).0.unwrap();
        let names: Vec<&str> = plan.downloads.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(plan.download_bytes, 3);
        assert_eq!(plan.local_version, None);
        assert!(!plan.is_up_to_date());
    }

    #[test]
    fn malformed_remote_manifest_is_parse_error() {
        let transport = MemoryTransport::new();
        transport.serve(format!("{BASE}/patch_manifest.json"), b"<html>".to_vec());
        let mut ctx = context(&MemoryStorage::new(), &transport, 0);
        let (result, _) = run(&mut CheckPatchOp::new(), &mut ctx);
        match result {
            Err(PatchError::Parse { path, .. }) => assert!(path.starts_with(BASE)),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    // -- 2. Applying ---------------------------------------------------------

    #[test]
    fn patch_writes_files_sidecars_and_aggregate() {
        let transport = MemoryTransport::new();
        serve_release(&transport, 3, &[("a", "alpha")]);
        let local = MemoryStorage::new();
        let mut ctx = context(&local, &transport, 0);

        let plan = run(&mut CheckPatchOp::new(), &mut ctx).0.unwrap();
        let summary = run(&mut PatchOp::new(plan, None), &mut ctx).0.unwrap();

        assert_eq!(summary.files_written, vec!["a"]);
        assert_eq!(summary.bytes_written, 5);
        let config = ctx.config().clone();
        assert_eq!(local.file(&config.bundle_path("a")).unwrap(), b"alpha");
        assert!(local.file(&config.manifest_path("a")).is_some());
        let installed = PatchManifest::parse(&local.file("patch_manifest.json").unwrap()).unwrap();
        assert_eq!(installed.version, 3);
        assert_eq!(ctx.manifest_version(), Some(3));

        let again = run(&mut CheckPatchOp::new(), &mut ctx).0.unwrap();
        assert!(again.is_up_to_date());
    }

    #[test]
    fn failed_download_is_retried_after_delay() {
        let transport = MemoryTransport::new();
        serve_release(&transport, 1, &[("a", "alpha")]);
        let url = format!("{BASE}/{}", entry("a", "alpha").key());
        transport.fail_next(url.clone(), 1);
        let mut ctx = context(&MemoryStorage::new(), &transport, 1);

        let plan = run(&mut CheckPatchOp::new(), &mut ctx).0.unwrap();
        let (result, pumps) = run(&mut PatchOp::new(plan, None), &mut ctx);
        assert!(result.is_ok());
        // fail, two cooldown ticks, succeed, finalize
        assert_eq!(pumps, 5);
        let attempts = transport.requests().iter().filter(|r| **r == url).count();
        assert_eq!(attempts, 2);
    }

    #[test]
    fn exhausted_retries_fail_without_writing_aggregate() {
        let transport = MemoryTransport::new();
        serve_release(&transport, 1, &[("a", "alpha")]);
        let url = format!("{BASE}/{}", entry("a", "alpha").key());
        transport.fail_next(url.clone(), 5);
        let local = MemoryStorage::new();
        let mut ctx = context(&local, &transport, 1);

        let plan = run(&mut CheckPatchOp::new(), &mut ctx).0.unwrap();
        let err = run(&mut PatchOp::new(plan, None), &mut ctx).0.unwrap_err();
        assert!(matches!(err, PatchError::Download { attempts: 2, .. }));
        assert!(local.file("patch_manifest.json").is_none());
        assert_eq!(ctx.manifest_version(), None);
    }

    #[test]
    fn corrupt_download_is_checksum_mismatch() {
        let transport = MemoryTransport::new();
        serve_release(&transport, 1, &[("a", "alpha")]);
        transport.serve(format!("{BASE}/{}", entry("a", "alpha").key()), b"alpha!".to_vec());
        let mut ctx = context(&MemoryStorage::new(), &transport, 0);

        let plan = run(&mut CheckPatchOp::new(), &mut ctx).0.unwrap();
        let err = run(&mut PatchOp::new(plan, None), &mut ctx).0.unwrap_err();
        assert!(matches!(err, PatchError::ChecksumMismatch { ref name, .. } if name == "a"));
    }

    #[test]
    fn removed_bundles_are_deleted_and_missing_files_replanned() {
        let transport = MemoryTransport::new();
        serve_release(&transport, 1, &[("a", "alpha"), ("b", "beta")]);
        let local = MemoryStorage::new();
        let mut ctx = context(&local, &transport, 0);
        let plan = run(&mut CheckPatchOp::new(), &mut ctx).0.unwrap();
        run(&mut PatchOp::new(plan, None), &mut ctx).0.unwrap();

        // Release 2 drops "b"; meanwhile "a" went missing locally.
        serve_release(&transport, 2, &[("a", "alpha")]);
        let config = ctx.config().clone();
        local.clone().remove(&config.bundle_path("a")).unwrap();

        let plan = run(&mut CheckPatchOp::new(), &mut ctx).0.unwrap();
        assert_eq!(plan.removals, vec!["b"]);
        assert_eq!(plan.downloads.len(), 1);

        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let log = seen.clone();
        let on_file: FileCallback = Box::new(move |e| log.borrow_mut().push(e.file_name.clone()));
        let summary = run(&mut PatchOp::new(plan, Some(on_file)), &mut ctx).0.unwrap();

        assert_eq!(*seen.borrow(), vec!["a".to_owned()]);
        assert_eq!(summary.removed, vec!["b"]);
        assert!(local.file(&config.bundle_path("b")).is_none());
        assert!(local.file(&config.manifest_path("b")).is_none());
        assert_eq!(ctx.manifest_version(), Some(2));
    }
}

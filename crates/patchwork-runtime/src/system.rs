//! The pipeline facade.
//!
//! A [`PatchSystem`] owns one [`Scheduler`] and one [`PatchContext`]. Every
//! operation method enqueues work and returns a typed [`OperationHandle`]
//! immediately; nothing runs until the host calls [`pump`](PatchSystem::pump)
//! (or [`run_until_idle`](PatchSystem::run_until_idle)).
//!
//! # Example
//!
//! ```
//! use patchwork_runtime::prelude::*;
//!
//! let local = MemoryStorage::new();
//! publish(&mut local.clone(), &PatchConfig::default(), 1, &[
//!     BundleSource::new("ui_common", b"common".to_vec()),
//!     BundleSource::new("ui_login", b"login".to_vec()).with_dependencies(["ui_common"]),
//! ]).unwrap();
//!
//! let mut system = PatchSystem::builder(PatchConfig::default())
//!     .storage(local)
//!     .build()
//!     .unwrap();
//! assert_eq!(system.current_manifest_version(), Some(1));
//!
//! let asset = system.load_asset("ui_login", "UI_Login");
//! let unload = system.unload_bundles(false);
//! assert_eq!(system.queue_len(), 2);
//!
//! system.run_until_idle(100);
//! let bytes = asset.output().unwrap();
//! assert_eq!(bytes.downcast_ref::<Vec<u8>>().unwrap().as_slice(), b"login");
//! assert_eq!(unload.output().unwrap(), vec!["ui_common", "ui_login"]);
//! ```

use patchwork_manifest::entry::BundleManifestEntry;

use crate::assets::{LoadAssetOp, LoadBundleOp, PreloadOp, UnloadOp};
use crate::bundle::{AssetObject, BundleDecoder, BundleHandle, RawBundleDecoder};
use crate::config::PatchConfig;
use crate::context::PatchContext;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::loader::load_blocking;
use crate::operation::{DelayOp, Operation, OperationHandle, Resumable};
use crate::patch::{read_local_manifest, CheckPatchOp, PatchOp, PatchPlan, PatchSummary};
use crate::registry::{CacheTier, Registry};
use crate::scheduler::{PumpReport, Scheduler};
use crate::storage::{FsStorage, PatchStorage};
use crate::transport::{OfflineTransport, Transport};
use crate::PatchError;

// ---------------------------------------------------------------------------
// PatchSystemBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`PatchSystem`] from a config and optional collaborators.
///
/// Defaults: [`FsStorage`] at `config.patch_root`, [`OfflineTransport`],
/// [`RawBundleDecoder`], and [`TracingSink`].
pub struct PatchSystemBuilder {
    config: PatchConfig,
    storage: Option<Box<dyn PatchStorage>>,
    transport: Option<Box<dyn Transport>>,
    decoder: Option<Box<dyn BundleDecoder>>,
    sink: Option<Box<dyn DiagnosticSink>>,
}

impl PatchSystemBuilder {
    fn new(config: PatchConfig) -> Self {
        Self {
            config,
            storage: None,
            transport: None,
            decoder: None,
            sink: None,
        }
    }

    /// Local patch storage.
    pub fn storage(mut self, storage: impl PatchStorage + 'static) -> Self {
        self.storage = Some(Box::new(storage));
        self
    }

    /// Download primitive.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Bundle decoder.
    pub fn decoder(mut self, decoder: impl BundleDecoder + 'static) -> Self {
        self.decoder = Some(Box::new(decoder));
        self
    }

    /// Diagnostic sink for unsuppressed failures.
    pub fn sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Validate the config and build the system.
    ///
    /// The installed manifest version is read from storage. A malformed local
    /// aggregate manifest is logged and treated as absent; the next patch
    /// check replaces it.
    pub fn build(self) -> Result<PatchSystem, PatchError> {
        self.config.validate()?;
        let storage = match self.storage {
            Some(storage) => storage,
            None => Box::new(FsStorage::new(self.config.patch_root.clone())),
        };
        let mut ctx = PatchContext::new(
            self.config,
            storage,
            self.transport.unwrap_or_else(|| Box::new(OfflineTransport)),
            self.decoder.unwrap_or_else(|| Box::new(RawBundleDecoder)),
            self.sink.unwrap_or_else(|| Box::new(TracingSink)),
        );
        ctx.manifest_version = match read_local_manifest(&ctx) {
            Ok(manifest) => manifest.map(|m| m.version),
            Err(error) => {
                tracing::warn!(error = %error, "ignoring unreadable local manifest");
                None
            }
        };
        Ok(PatchSystem {
            scheduler: Scheduler::new(),
            ctx,
        })
    }
}

// ---------------------------------------------------------------------------
// PatchSystem
// ---------------------------------------------------------------------------

/// One patch/load pipeline: a scheduler plus the state it operates on.
#[derive(Debug)]
pub struct PatchSystem {
    scheduler: Scheduler,
    ctx: PatchContext,
}

impl PatchSystem {
    /// Start building a system for `config`.
    pub fn builder(config: PatchConfig) -> PatchSystemBuilder {
        PatchSystemBuilder::new(config)
    }

    /// Build a system with default collaborators.
    pub fn new(config: PatchConfig) -> Result<Self, PatchError> {
        Self::builder(config).build()
    }

    fn submit<R, F>(&mut self, op: R, wrap: F) -> OperationHandle<R::Output>
    where
        R: Resumable,
        F: FnOnce(R) -> Operation,
    {
        let handle = op.handle().clone();
        self.scheduler.enqueue(wrap(op));
        handle
    }

    // -- patching ------------------------------------------------------------

    /// Compare the remote release against local storage.
    pub fn check_patch(&mut self) -> OperationHandle<PatchPlan> {
        self.submit(CheckPatchOp::new(), Operation::CheckPatch)
    }

    /// Apply `plan`.
    pub fn patch(&mut self, plan: PatchPlan) -> OperationHandle<PatchSummary> {
        self.submit(PatchOp::new(plan, None), Operation::Patch)
    }

    /// Apply `plan`, calling `on_file` after each bundle is written.
    pub fn patch_with_progress(
        &mut self,
        plan: PatchPlan,
        on_file: impl FnMut(&BundleManifestEntry) + 'static,
    ) -> OperationHandle<PatchSummary> {
        self.submit(PatchOp::new(plan, Some(Box::new(on_file))), Operation::Patch)
    }

    // -- loading -------------------------------------------------------------

    /// Load the configured preload bundles into the preload tier.
    pub fn preload(&mut self) -> OperationHandle<Vec<String>> {
        self.submit(PreloadOp::new(), Operation::Preload)
    }

    /// Load `name` and its dependencies.
    pub fn load_bundle(&mut self, name: &str) -> OperationHandle<BundleHandle> {
        self.submit(LoadBundleOp::new(name), Operation::LoadBundle)
    }

    /// Load the main object of `asset` from `bundle`.
    ///
    /// A cached asset completes immediately without being queued.
    pub fn load_asset(&mut self, bundle: &str, asset: &str) -> OperationHandle<AssetObject> {
        if let Some(object) = self
            .ctx
            .registry
            .lookup_asset(bundle, asset)
            .and_then(|objects| objects.first())
        {
            return OperationHandle::completed(object.clone());
        }
        self.submit(LoadAssetOp::main(bundle, asset), Operation::LoadAsset)
    }

    /// Load the main object and all sub-assets of `asset` from `bundle`.
    ///
    /// A cached asset completes immediately without being queued.
    pub fn load_asset_with_sub_assets(
        &mut self,
        bundle: &str,
        asset: &str,
    ) -> OperationHandle<Vec<AssetObject>> {
        if let Some(objects) = self.ctx.registry.lookup_asset(bundle, asset) {
            return OperationHandle::completed(objects.to_vec());
        }
        self.submit(LoadAssetOp::with_sub_assets(bundle, asset), Operation::LoadAssets)
    }

    /// Load every asset of `bundle`.
    pub fn load_all_assets(&mut self, bundle: &str) -> OperationHandle<Vec<AssetObject>> {
        self.submit(LoadAssetOp::all(bundle), Operation::LoadAssets)
    }

    /// Unload the on-demand tier and, if `include_preload`, the preload tier.
    ///
    /// Queued like any other operation, so loads submitted earlier finish
    /// first.
    pub fn unload_bundles(&mut self, include_preload: bool) -> OperationHandle<Vec<String>> {
        self.submit(UnloadOp::new(include_preload), Operation::Unload)
    }

    /// An operation that just waits `ticks` ticks.
    pub fn delay(&mut self, ticks: u32) -> OperationHandle<()> {
        self.submit(DelayOp::new(ticks), Operation::Delay)
    }

    /// Load `name` and its dependencies right now, bypassing the queue.
    pub fn load_bundle_now(&mut self, name: &str) -> Result<BundleHandle, PatchError> {
        load_blocking(&mut self.ctx, name, CacheTier::OnDemand)
    }

    /// Cached objects of `asset` in `bundle`, preload tier first.
    pub fn lookup_asset(&self, bundle: &str, asset: &str) -> Option<Vec<AssetObject>> {
        self.ctx.registry.lookup_asset(bundle, asset).map(<[_]>::to_vec)
    }

    // -- driving -------------------------------------------------------------

    /// Run one scheduler tick.
    pub fn pump(&mut self) -> PumpReport {
        self.scheduler.pump(&mut self.ctx)
    }

    /// Pump until the queue is empty or `max_ticks` ticks have run.
    ///
    /// Returns the number of ticks run.
    pub fn run_until_idle(&mut self, max_ticks: u64) -> u64 {
        let mut ticks = 0;
        while ticks < max_ticks && !self.scheduler.is_idle() {
            self.pump();
            ticks += 1;
        }
        if !self.scheduler.is_idle() {
            tracing::debug!(
                max_ticks,
                queued = self.scheduler.queue_len(),
                "tick budget exhausted with work pending"
            );
        }
        ticks
    }

    /// Release every bundle (on-demand first) and finish all queued
    /// operations with an error.
    ///
    /// Returns the names of the released bundles.
    pub fn shutdown(&mut self) -> Vec<String> {
        let error = PatchError::internal("patch system shut down");
        let aborted = self.scheduler.abort_all(&self.ctx, &error);
        let released = self.ctx.registry.shutdown();
        tracing::info!(aborted, released = released.len(), "patch system shut down");
        released
    }

    // -- accessors -----------------------------------------------------------

    /// Operations not yet finished.
    pub fn queue_len(&self) -> usize {
        self.scheduler.queue_len()
    }

    /// Ticks run so far.
    pub fn tick_count(&self) -> u64 {
        self.scheduler.tick_count()
    }

    /// Diagnostics of the most recent tick.
    pub fn last_pump(&self) -> &PumpReport {
        self.scheduler.last_report()
    }

    /// The bundle and asset registry.
    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    /// Active configuration.
    pub fn config(&self) -> &PatchConfig {
        &self.ctx.config
    }

    /// Shared pipeline state.
    pub fn context(&self) -> &PatchContext {
        &self.ctx
    }

    /// Version of the installed aggregate manifest, if any.
    pub fn current_manifest_version(&self) -> Option<u32> {
        self.ctx.manifest_version
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Bundle and asset operations: load, preload, unload.

use std::collections::VecDeque;

use crate::bundle::{AssetObject, BundleHandle};
use crate::context::PatchContext;
use crate::loader::{BundleLoad, LoadStep};
use crate::operation::{OperationHandle, OperationKind, Resumable, Step};
use crate::registry::CacheTier;
use crate::PatchError;

// ---------------------------------------------------------------------------
// LoadBundleOp
// ---------------------------------------------------------------------------

/// Loads a bundle with its dependencies into the on-demand tier.
pub(crate) struct LoadBundleOp {
    load: BundleLoad,
    handle: OperationHandle<BundleHandle>,
}

impl LoadBundleOp {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            load: BundleLoad::new(name, CacheTier::OnDemand),
            handle: OperationHandle::new(),
        }
    }
}

impl Resumable for LoadBundleOp {
    type Output = BundleHandle;

    fn handle(&self) -> &OperationHandle<BundleHandle> {
        &self.handle
    }

    fn label(&self) -> String {
        format!("load_bundle({})", self.load.target())
    }

    fn step(&mut self, ctx: &mut PatchContext) -> Step<BundleHandle> {
        match self.load.advance(ctx) {
            LoadStep::Pending => Step::Yield,
            LoadStep::Loaded(handle) => Step::Complete(handle),
            LoadStep::Failed(error) => Step::Fail(error),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadAssetOp
// ---------------------------------------------------------------------------

/// Which assets of a bundle to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AssetRequest {
    /// The main object of one asset.
    Main(String),
    /// The main object and every sub-asset of one asset.
    WithSubAssets(String),
    /// Every asset in the bundle.
    All,
}

/// Loads a bundle (with dependencies), then pulls assets out of it and caches
/// them in the bundle's tier.
///
/// `T` is what the caller receives: one object for [`AssetRequest::Main`],
/// all objects otherwise.
pub(crate) struct LoadAssetOp<T> {
    load: BundleLoad,
    request: AssetRequest,
    bundle: Option<BundleHandle>,
    finish: fn(Vec<AssetObject>) -> Option<T>,
    handle: OperationHandle<T>,
}

impl LoadAssetOp<AssetObject> {
    pub(crate) fn main(bundle: impl Into<String>, asset: impl Into<String>) -> Self {
        Self::new(bundle, AssetRequest::Main(asset.into()), |objects| {
            objects.into_iter().next()
        })
    }
}

impl LoadAssetOp<Vec<AssetObject>> {
    pub(crate) fn with_sub_assets(bundle: impl Into<String>, asset: impl Into<String>) -> Self {
        Self::new(bundle, AssetRequest::WithSubAssets(asset.into()), Some)
    }

    pub(crate) fn all(bundle: impl Into<String>) -> Self {
        Self::new(bundle, AssetRequest::All, Some)
    }
}

impl<T: Clone + 'static> LoadAssetOp<T> {
    fn new(
        bundle: impl Into<String>,
        request: AssetRequest,
        finish: fn(Vec<AssetObject>) -> Option<T>,
    ) -> Self {
        Self {
            load: BundleLoad::new(bundle, CacheTier::OnDemand),
            request,
            bundle: None,
            finish,
            handle: OperationHandle::new(),
        }
    }

    pub(crate) fn kind(&self) -> OperationKind {
        match self.request {
            AssetRequest::All => OperationKind::LoadAllAssets,
            _ => OperationKind::LoadAsset,
        }
    }

    fn not_found(&self, asset: &str) -> PatchError {
        PatchError::AssetNotFound {
            bundle: self.load.target().to_owned(),
            asset: asset.to_owned(),
        }
    }

    /// Pull the requested objects out of a resident bundle and cache them.
    fn extract(&self, ctx: &mut PatchContext, bundle: &BundleHandle) -> Result<T, PatchError> {
        let name = bundle.name();
        let objects = match &self.request {
            AssetRequest::Main(asset) | AssetRequest::WithSubAssets(asset) => {
                if let Some(cached) = ctx.registry.lookup_asset(name, asset) {
                    cached.to_vec()
                } else {
                    let objects = bundle
                        .contents()
                        .load_asset(asset)
                        .filter(|objects| !objects.is_empty())
                        .ok_or_else(|| self.not_found(asset))?;
                    ctx.registry
                        .cache_assets(CacheTier::OnDemand, name, asset, objects.clone());
                    objects
                }
            }
            AssetRequest::All => {
                let mut all = Vec::new();
                for (asset, objects) in bundle.contents().load_all_assets() {
                    all.extend(objects.iter().cloned());
                    ctx.registry
                        .cache_assets(CacheTier::OnDemand, name, &asset, objects);
                }
                all
            }
        };
        let wanted = match &self.request {
            AssetRequest::Main(asset) | AssetRequest::WithSubAssets(asset) => asset.as_str(),
            AssetRequest::All => "*",
        };
        (self.finish)(objects).ok_or_else(|| self.not_found(wanted))
    }
}

impl<T: Clone + 'static> Resumable for LoadAssetOp<T> {
    type Output = T;

    fn handle(&self) -> &OperationHandle<T> {
        &self.handle
    }

    fn label(&self) -> String {
        match &self.request {
            AssetRequest::Main(asset) => format!("load_asset({}/{})", self.load.target(), asset),
            AssetRequest::WithSubAssets(asset) => format!(
                "load_asset_with_sub_assets({}/{})",
                self.load.target(),
                asset
            ),
            AssetRequest::All => format!("load_all_assets({})", self.load.target()),
        }
    }

    fn step(&mut self, ctx: &mut PatchContext) -> Step<T> {
        if let Some(bundle) = self.bundle.take() {
            return match self.extract(ctx, &bundle) {
                Ok(output) => Step::Complete(output),
                Err(error) => Step::Fail(error),
            };
        }
        match self.load.advance(ctx) {
            LoadStep::Pending => Step::Yield,
            LoadStep::Loaded(bundle) => {
                self.bundle = Some(bundle);
                Step::Yield
            }
            LoadStep::Failed(error) => Step::Fail(error),
        }
    }
}

// ---------------------------------------------------------------------------
// PreloadOp
// ---------------------------------------------------------------------------

/// Loads the configured preload bundles, in order, into the preload tier and
/// caches all of their assets there. Stops at the first failure.
pub(crate) struct PreloadOp {
    pending: Option<VecDeque<String>>,
    current: Option<BundleLoad>,
    loaded: Vec<String>,
    handle: OperationHandle<Vec<String>>,
}

impl PreloadOp {
    pub(crate) fn new() -> Self {
        Self {
            pending: None,
            current: None,
            loaded: Vec::new(),
            handle: OperationHandle::new(),
        }
    }
}

impl Resumable for PreloadOp {
    type Output = Vec<String>;

    fn handle(&self) -> &OperationHandle<Vec<String>> {
        &self.handle
    }

    fn label(&self) -> String {
        "preload".to_owned()
    }

    fn step(&mut self, ctx: &mut PatchContext) -> Step<Vec<String>> {
        let pending = self
            .pending
            .get_or_insert_with(|| ctx.config.preload_bundles.iter().cloned().collect());

        if self.current.is_none() {
            match pending.pop_front() {
                Some(name) => self.current = Some(BundleLoad::new(name, CacheTier::Preload)),
                None => return Step::Complete(self.loaded.clone()),
            }
        }
        let Some(load) = self.current.as_mut() else {
            return Step::Yield;
        };

        match load.advance(ctx) {
            LoadStep::Pending => Step::Yield,
            LoadStep::Failed(error) => Step::Fail(error),
            LoadStep::Loaded(bundle) => {
                let name = bundle.name().to_owned();
                ctx.registry.track(CacheTier::Preload, &name);
                for (asset, objects) in bundle.contents().load_all_assets() {
                    ctx.registry
                        .cache_assets(CacheTier::Preload, &name, &asset, objects);
                }
                if ctx.verbose() {
                    tracing::info!(bundle = %name, "bundle preloaded");
                }
                self.loaded.push(name);
                self.current = None;
                Step::Yield
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UnloadOp
// ---------------------------------------------------------------------------

/// Releases the on-demand tier and, optionally, the preload tier.
pub(crate) struct UnloadOp {
    include_preload: bool,
    handle: OperationHandle<Vec<String>>,
}

impl UnloadOp {
    pub(crate) fn new(include_preload: bool) -> Self {
        Self {
            include_preload,
            handle: OperationHandle::new(),
        }
    }
}

impl Resumable for UnloadOp {
    type Output = Vec<String>;

    fn handle(&self) -> &OperationHandle<Vec<String>> {
        &self.handle
    }

    fn label(&self) -> String {
        format!("unload_bundles(include_preload={})", self.include_preload)
    }

    fn step(&mut self, ctx: &mut PatchContext) -> Step<Vec<String>> {
        let unloaded = ctx.registry.unload_all(self.include_preload);
        if ctx.verbose() {
            for name in &unloaded {
                tracing::info!(bundle = %name, "bundle unloaded");
            }
        }
        Step::Complete(unloaded)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Cache/registry of resident bundles and loaded assets.
//!
//! The [`Registry`] is the only shared mutable state of the pipeline. It owns
//! every [`BundleHandle`] (at most one per bundle name) and two asset cache
//! tiers:
//!
//! - [`CacheTier::Preload`]: bundles loaded at startup that stay resident.
//! - [`CacheTier::OnDemand`]: bundles loaded lazily, released in bulk.
//!
//! Each bundle belongs to at most one tier. Asset identity inside a bundle is
//! case-insensitive and ignores the file extension (see [`asset_key`]).
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use patchwork_runtime::bundle::AssetObject;
//! use patchwork_runtime::registry::{CacheTier, Registry};
//!
//! let mut registry = Registry::new();
//! let object: AssetObject = Rc::new(42_u32);
//! registry.cache_assets(CacheTier::OnDemand, "ui_login", "Background.png", vec![object]);
//!
//! let hit = registry.lookup_asset("ui_login", "background").unwrap();
//! assert_eq!(hit[0].downcast_ref::<u32>(), Some(&42));
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::bundle::{AssetObject, BundleHandle};

/// Asset objects of one bundle, keyed by [`asset_key`].
type AssetMap = HashMap<String, Vec<AssetObject>>;

/// Normalized asset identity: the file stem of `asset_name`, lowercased.
///
/// `"Assets/UI/Background.png"`, `"background"` and `"BACKGROUND.PNG"` all
/// map to `"background"`.
pub fn asset_key(asset_name: &str) -> String {
    let last = asset_name.rsplit(['/', '\\']).next().unwrap_or(asset_name);
    let stem = Path::new(last)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| last.to_owned());
    stem.to_lowercase()
}

// ---------------------------------------------------------------------------
// CacheTier
// ---------------------------------------------------------------------------

/// Lifetime class of a cached bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// Loaded at startup, expected to stay resident.
    Preload,
    /// Loaded lazily, eligible for bulk release.
    OnDemand,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owner of all bundle handles and cached assets.
#[derive(Debug, Default)]
pub struct Registry {
    bundles: HashMap<String, BundleHandle>,
    preload: HashMap<String, AssetMap>,
    on_demand: HashMap<String, AssetMap>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, tier: CacheTier) -> &HashMap<String, AssetMap> {
        match tier {
            CacheTier::Preload => &self.preload,
            CacheTier::OnDemand => &self.on_demand,
        }
    }

    fn tier_mut(&mut self, tier: CacheTier) -> &mut HashMap<String, AssetMap> {
        match tier {
            CacheTier::Preload => &mut self.preload,
            CacheTier::OnDemand => &mut self.on_demand,
        }
    }

    // -- bundles -------------------------------------------------------------

    /// The resident handle for `name`.
    pub fn bundle(&self, name: &str) -> Option<BundleHandle> {
        self.bundles.get(name).cloned()
    }

    /// Whether `name` is resident.
    pub fn contains_bundle(&self, name: &str) -> bool {
        self.bundles.contains_key(name)
    }

    /// Number of resident bundles.
    pub fn bundle_count(&self) -> usize {
        self.bundles.len()
    }

    /// Names of all resident bundles, sorted.
    pub fn bundle_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bundles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Make `handle` resident under its name.
    ///
    /// If a handle for that name already exists it is kept and returned, and
    /// `handle` is dropped.
    pub fn insert_bundle(&mut self, handle: BundleHandle) -> BundleHandle {
        self.bundles
            .entry(handle.name().to_owned())
            .or_insert(handle)
            .clone()
    }

    // -- tiers ---------------------------------------------------------------

    /// Record that `bundle` belongs to `tier`.
    ///
    /// A bundle tracked as [`CacheTier::Preload`] stays there. Tracking it as
    /// preload also promotes every resident bundle it depends on, directly or
    /// transitively, and moves their cached assets out of the on-demand tier.
    pub fn track(&mut self, tier: CacheTier, bundle: &str) {
        match tier {
            CacheTier::OnDemand => {
                if !self.preload.contains_key(bundle) {
                    self.on_demand.entry(bundle.to_owned()).or_default();
                }
            }
            CacheTier::Preload => {
                let mut pending = vec![bundle.to_owned()];
                let mut seen = HashSet::new();
                while let Some(name) = pending.pop() {
                    if !seen.insert(name.clone()) {
                        continue;
                    }
                    match self.bundles.get(&name) {
                        Some(handle) => pending.extend(handle.dependencies().iter().cloned()),
                        None if name != bundle => continue,
                        None => {}
                    }
                    let assets = self.on_demand.remove(&name).unwrap_or_default();
                    self.preload.entry(name).or_default().extend(assets);
                }
            }
        }
    }

    /// The tier `bundle` is tracked in.
    pub fn tier_of(&self, bundle: &str) -> Option<CacheTier> {
        if self.preload.contains_key(bundle) {
            Some(CacheTier::Preload)
        } else if self.on_demand.contains_key(bundle) {
            Some(CacheTier::OnDemand)
        } else {
            None
        }
    }

    /// Number of bundles tracked in `tier`.
    pub fn tier_len(&self, tier: CacheTier) -> usize {
        self.tier(tier).len()
    }

    // -- assets --------------------------------------------------------------

    /// Cache `objects` as `asset_name` of `bundle`.
    ///
    /// The objects land in the bundle's current tier, or in `tier` if the
    /// bundle is not tracked yet.
    pub fn cache_assets(
        &mut self,
        tier: CacheTier,
        bundle: &str,
        asset_name: &str,
        objects: Vec<AssetObject>,
    ) {
        let tier = self.tier_of(bundle).unwrap_or(tier);
        self.tier_mut(tier)
            .entry(bundle.to_owned())
            .or_default()
            .insert(asset_key(asset_name), objects);
    }

    /// Cached objects of `asset_name` in `bundle`, checking the preload tier
    /// first.
    pub fn lookup_asset(&self, bundle: &str, asset_name: &str) -> Option<&[AssetObject]> {
        let key = asset_key(asset_name);
        [&self.preload, &self.on_demand]
            .into_iter()
            .find_map(|tier| tier.get(bundle).and_then(|assets| assets.get(&key)))
            .map(Vec::as_slice)
    }

    // -- unloading -----------------------------------------------------------

    /// Clear `tier`. With `include_handles`, the tier's bundles are also
    /// released and dropped from the registry.
    ///
    /// Returns the names of the bundles that were in the tier, sorted.
    pub fn unload_tier(&mut self, tier: CacheTier, include_handles: bool) -> Vec<String> {
        let mut names: Vec<String> = self.tier_mut(tier).drain().map(|(name, _)| name).collect();
        names.sort();
        if include_handles {
            for name in &names {
                if let Some(handle) = self.bundles.remove(name) {
                    handle.contents().release();
                }
            }
        }
        names
    }

    /// Unload the on-demand tier and then, if requested, the preload tier.
    ///
    /// On-demand bundles may depend on preloaded ones, so they always go
    /// first. Returns every unloaded bundle name in unload order.
    pub fn unload_all(&mut self, include_preload: bool) -> Vec<String> {
        let mut unloaded = self.unload_tier(CacheTier::OnDemand, true);
        if include_preload {
            unloaded.extend(self.unload_tier(CacheTier::Preload, true));
        }
        unloaded
    }

    /// Release everything, including bundles that were never tracked.
    pub fn shutdown(&mut self) -> Vec<String> {
        let mut unloaded = self.unload_all(true);
        let mut rest: Vec<(String, BundleHandle)> = self.bundles.drain().collect();
        rest.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, handle) in rest {
            handle.contents().release();
            unloaded.push(name);
        }
        unloaded
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

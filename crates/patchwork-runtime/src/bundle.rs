//! In-memory bundles.
//!
//! A [`BundleDecoder`] turns the raw bytes of a bundle file into
//! [`BundleContents`], the opaque in-memory form that assets are loaded from.
//! The registry wraps decoded contents in a [`LoadedBundle`] and hands out
//! shared [`BundleHandle`]s; at most one handle exists per bundle name.

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use patchwork_manifest::address::BundleKey;

use crate::registry::asset_key;

/// A loaded asset object. Concrete types are decoder-defined; callers
/// downcast with [`Rc::downcast`] or `downcast_ref`.
pub type AssetObject = Rc<dyn Any>;

/// Shared handle to a resident bundle.
pub type BundleHandle = Rc<LoadedBundle>;

// ---------------------------------------------------------------------------
// BundleContents / BundleDecoder
// ---------------------------------------------------------------------------

/// Decoded bundle data that assets can be pulled from.
pub trait BundleContents {
    /// Names of every asset in the bundle.
    fn asset_names(&self) -> Vec<String>;

    /// Load the objects stored under `asset_name`: the main object first,
    /// then any sub-assets. `None` if the bundle has no such asset.
    fn load_asset(&self, asset_name: &str) -> Option<Vec<AssetObject>>;

    /// Load every asset in the bundle as `(name, objects)` pairs.
    fn load_all_assets(&self) -> Vec<(String, Vec<AssetObject>)> {
        self.asset_names()
            .into_iter()
            .filter_map(|name| self.load_asset(&name).map(|objects| (name, objects)))
            .collect()
    }

    /// Drop the bundle's backing data. Objects already handed out stay alive.
    fn release(&self) {}
}

/// Turns bundle bytes into [`BundleContents`].
pub trait BundleDecoder {
    /// Decode the file of `bundle_name`. The error message ends up in
    /// [`PatchError::Internal`](crate::PatchError::Internal).
    fn decode(&self, bundle_name: &str, bytes: Vec<u8>) -> Result<Box<dyn BundleContents>, String>;
}

// ---------------------------------------------------------------------------
// LoadedBundle
// ---------------------------------------------------------------------------

/// A bundle that is resident in the registry.
pub struct LoadedBundle {
    name: String,
    key: BundleKey,
    size: u64,
    dependencies: Vec<String>,
    contents: Box<dyn BundleContents>,
}

impl LoadedBundle {
    pub(crate) fn new(
        name: impl Into<String>,
        key: BundleKey,
        size: u64,
        contents: Box<dyn BundleContents>,
    ) -> Self {
        Self {
            name: name.into(),
            key,
            size,
            dependencies: Vec::new(),
            contents,
        }
    }

    /// Record the dependencies declared in the bundle's sidecar manifest.
    pub(crate) fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Logical bundle name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage key the bundle was read from.
    pub fn key(&self) -> &BundleKey {
        &self.key
    }

    /// Size of the bundle file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Declared dependencies, in load order.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// The decoded contents.
    pub fn contents(&self) -> &dyn BundleContents {
        self.contents.as_ref()
    }
}

impl fmt::Debug for LoadedBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedBundle")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("size", &self.size)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RawBundleDecoder
// ---------------------------------------------------------------------------

/// Decoder that treats the whole file as one asset.
///
/// The asset is named after the last `/`-separated segment of the bundle name
/// without its extension, and its object is an `Rc<Vec<u8>>` of the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBundleDecoder;

struct RawContents {
    asset_name: String,
    bytes: Rc<Vec<u8>>,
}

impl BundleContents for RawContents {
    fn asset_names(&self) -> Vec<String> {
        vec![self.asset_name.clone()]
    }

    fn load_asset(&self, asset_name: &str) -> Option<Vec<AssetObject>> {
        if asset_key(asset_name) == asset_key(&self.asset_name) {
            let object: AssetObject = self.bytes.clone();
            Some(vec![object])
        } else {
            None
        }
    }
}

impl BundleDecoder for RawBundleDecoder {
    fn decode(&self, bundle_name: &str, bytes: Vec<u8>) -> Result<Box<dyn BundleContents>, String> {
        let last = bundle_name.rsplit('/').next().unwrap_or(bundle_name);
        let asset_name = Path::new(last)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| last.to_owned());
        Ok(Box::new(RawContents {
            asset_name,
            bytes: Rc::new(bytes),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

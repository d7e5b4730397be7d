//! Patchwork Runtime -- queued, dependency-aware bundle patching and loading.
//!
//! This crate builds on [`patchwork_manifest`] to provide the client side of
//! the content-delivery pipeline: checking a remote release against the local
//! patch root, downloading changed bundles into content-addressed storage,
//! loading bundles together with their dependency closure, and caching loaded
//! assets in two lifetime tiers.
//!
//! All work runs as [`operation`]s on a single cooperative [`scheduler`]. The
//! host calls [`PatchSystem::pump`](system::PatchSystem::pump) once per frame;
//! each pump advances exactly one queued operation by one increment, and
//! operations finish in the order they were submitted.
//!
//! # Quick Start
//!
//! ```
//! use patchwork_runtime::prelude::*;
//!
//! let mut server = MemoryStorage::new();
//! let config = PatchConfig { remote_base_url: "mem://cdn".to_owned(), ..Default::default() };
//! publish(&mut server, &config, 5, &[
//!     BundleSource::new("ui_common", b"common".to_vec()),
//!     BundleSource::new("ui_login", b"login".to_vec()).with_dependencies(["ui_common"]),
//! ]).unwrap();
//!
//! let transport = MemoryTransport::new();
//! transport.mirror("mem://cdn", &server);
//!
//! let mut system = PatchSystem::builder(config)
//!     .storage(MemoryStorage::new())
//!     .transport(transport)
//!     .build()
//!     .unwrap();
//!
//! let check = system.check_patch();
//! system.run_until_idle(1_000);
//! let plan = check.output().unwrap();
//! assert_eq!(plan.downloads.len(), 2);
//!
//! let patch = system.patch(plan);
//! let login = system.load_bundle("ui_login");
//! system.run_until_idle(1_000);
//!
//! assert!(patch.error().is_none());
//! assert_eq!(login.output().unwrap().name(), "ui_login");
//! assert!(system.registry().contains_bundle("ui_common"));
//! ```

#![deny(unsafe_code)]

pub mod assets;
pub mod bundle;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod loader;
pub mod operation;
pub mod patch;
pub mod publish;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod system;
pub mod transport;

use patchwork_manifest::ManifestError;

/// Re-export the manifest crate for convenience.
pub use patchwork_manifest;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors recorded by pipeline operations.
///
/// Every failure reaches the caller through an operation's error slot (see
/// [`OperationHandle::error`](operation::OperationHandle::error)); nothing is
/// raised across the scheduler. The type is `Clone` so a handle can hand the
/// same error out any number of times.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// An empty or blank bundle name was supplied.
    #[error("invalid bundle name {name:?}")]
    InvalidBundleName { name: String },

    /// No sidecar manifest exists for the requested bundle.
    #[error("manifest for bundle '{name}' not found at {path}")]
    ManifestNotFound { name: String, path: String },

    /// The sidecar manifest exists but the bundle file does not.
    #[error("bundle '{name}' has a manifest but no file at {path}")]
    BundleFileNotFound { name: String, path: String },

    /// The dependency graph loops back on itself.
    #[error("dependency cycle: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    /// A manifest could not be parsed.
    #[error("malformed manifest at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ManifestError,
    },

    /// An unexpected I/O or decode failure.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// The bundle loaded but does not contain the requested asset.
    #[error("asset '{asset}' not found in bundle '{bundle}'")]
    AssetNotFound { bundle: String, asset: String },

    /// A download failed and the retry budget is exhausted.
    #[error("download of {url} failed after {attempts} attempt(s): {message}")]
    Download {
        url: String,
        attempts: u32,
        message: String,
    },

    /// Downloaded bytes do not match the manifest's size or checksum.
    #[error("checksum mismatch for bundle '{name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A release violates a build-time integrity rule (key collision,
    /// duplicate entry).
    #[error("release integrity violation: {source}")]
    Integrity {
        #[source]
        source: ManifestError,
    },

    /// The [`PatchConfig`](config::PatchConfig) is unusable.
    #[error("invalid configuration: {details}")]
    InvalidConfig { details: String },
}

impl PatchError {
    /// Wrap an unexpected failure, keeping only its message.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        PatchError::Internal {
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use patchwork_manifest::prelude::*;

    pub use crate::bundle::{
        AssetObject, BundleContents, BundleDecoder, BundleHandle, LoadedBundle, RawBundleDecoder,
    };
    pub use crate::config::PatchConfig;
    pub use crate::context::PatchContext;
    pub use crate::diagnostics::{CollectingSink, DiagnosticSink, LogMode, TracingSink};
    pub use crate::operation::{OperationHandle, OperationKind, OperationState};
    pub use crate::patch::{PatchPlan, PatchSummary};
    pub use crate::publish::{publish, BundleSource};
    pub use crate::registry::{asset_key, CacheTier, Registry};
    pub use crate::scheduler::{PumpReport, Scheduler};
    pub use crate::storage::{FsStorage, MemoryStorage, PatchStorage};
    pub use crate::system::{PatchSystem, PatchSystemBuilder};
    pub use crate::transport::{
        BlockingTransport, FetchPoll, MemoryTransport, OfflineTransport, RequestId, Transport,
    };
    pub use crate::PatchError;
}

//! Dependency-aware bundle loading.
//!
//! A [`BundleLoad`] loads one bundle together with its dependency closure,
//! one storage access per [`advance`](BundleLoad::advance) call:
//!
//! 1. A bundle that is already resident is returned as-is, with no I/O.
//! 2. Otherwise its sidecar manifest is read (`ManifestNotFound` if absent).
//! 3. Each declared dependency is loaded, in declaration order, by the same
//!    procedure, before the dependent bundle.
//! 4. The bundle file is read (`BundleFileNotFound` if absent), decoded, and
//!    inserted into the registry.
//!
//! The walk is an explicit depth-first stack. A bundle name that is already on
//! the stack when it is reached again closes a cycle and fails the load with
//! [`PatchError::DependencyCycle`]. Only fully loaded bundles are inserted, so
//! a failed load never leaves its target (or the failing dependency) resident.

use std::rc::Rc;

use patchwork_manifest::address::name_to_key;
use patchwork_manifest::entry::BundleManifestEntry;
use patchwork_manifest::ManifestError;

use crate::bundle::{BundleHandle, LoadedBundle};
use crate::context::PatchContext;
use crate::registry::CacheTier;
use crate::PatchError;

/// Outcome of one [`BundleLoad::advance`] call.
#[derive(Debug)]
pub(crate) enum LoadStep {
    /// More work remains.
    Pending,
    /// The target and all of its dependencies are resident.
    Loaded(BundleHandle),
    /// The load failed; nothing further will happen.
    Failed(PatchError),
}

/// One bundle on the depth-first stack.
#[derive(Debug)]
struct Frame {
    name: String,
    /// `None` until the sidecar manifest has been read.
    dependencies: Option<Vec<String>>,
    /// Index of the next dependency to visit.
    next: usize,
}

impl Frame {
    fn new(name: String) -> Self {
        Self {
            name,
            dependencies: None,
            next: 0,
        }
    }
}

enum Visit {
    ReadManifest(String),
    Dependency(String),
    LoadFile,
}

/// Resumable load of one bundle and its dependency closure.
#[derive(Debug)]
pub(crate) struct BundleLoad {
    target: String,
    tier: CacheTier,
    stack: Vec<Frame>,
    started: bool,
}

impl BundleLoad {
    /// Prepare to load `target`, tracking every bundle it touches in `tier`.
    pub(crate) fn new(target: impl Into<String>, tier: CacheTier) -> Self {
        Self {
            target: target.into(),
            tier,
            stack: Vec::new(),
            started: false,
        }
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    /// Perform the next increment of the load.
    pub(crate) fn advance(&mut self, ctx: &mut PatchContext) -> LoadStep {
        if !self.started {
            self.started = true;
            if self.target.trim().is_empty() {
                return LoadStep::Failed(PatchError::InvalidBundleName {
                    name: self.target.clone(),
                });
            }
            if let Some(handle) = ctx.registry.bundle(&self.target) {
                ctx.registry.track(self.tier, &self.target);
                return LoadStep::Loaded(handle);
            }
            self.stack.push(Frame::new(self.target.clone()));
        }

        loop {
            let visit = match self.stack.last_mut() {
                None => {
                    return LoadStep::Failed(PatchError::internal(format!(
                        "load of '{}' resumed after it finished",
                        self.target
                    )))
                }
                Some(frame) => match &frame.dependencies {
                    None => Visit::ReadManifest(frame.name.clone()),
                    Some(deps) => match deps.get(frame.next).cloned() {
                        Some(dep) => {
                            frame.next += 1;
                            Visit::Dependency(dep)
                        }
                        None => Visit::LoadFile,
                    },
                },
            };

            match visit {
                Visit::ReadManifest(name) => {
                    return match read_dependencies(ctx, &name) {
                        Ok(deps) => {
                            if let Some(frame) = self.stack.last_mut() {
                                frame.dependencies = Some(deps);
                            }
                            LoadStep::Pending
                        }
                        Err(error) => LoadStep::Failed(error),
                    };
                }
                Visit::Dependency(dep) => {
                    if dep.trim().is_empty() {
                        return LoadStep::Failed(PatchError::InvalidBundleName { name: dep });
                    }
                    if let Some(pos) = self.stack.iter().position(|f| f.name == dep) {
                        let mut chain: Vec<String> =
                            self.stack[pos..].iter().map(|f| f.name.clone()).collect();
                        chain.push(dep);
                        return LoadStep::Failed(PatchError::DependencyCycle { chain });
                    }
                    if ctx.registry.contains_bundle(&dep) {
                        ctx.registry.track(self.tier, &dep);
                        continue;
                    }
                    self.stack.push(Frame::new(dep));
                }
                Visit::LoadFile => {
                    let Some(frame) = self.stack.pop() else {
                        continue;
                    };
                    let dependencies = frame.dependencies.unwrap_or_default();
                    let handle = match load_file(ctx, &frame.name, dependencies) {
                        Ok(handle) => handle,
                        Err(error) => return LoadStep::Failed(error),
                    };
                    ctx.registry.track(self.tier, &frame.name);
                    if ctx.verbose() {
                        tracing::info!(
                            bundle = %frame.name,
                            key = %handle.key(),
                            size = handle.size(),
                            "bundle loaded"
                        );
                    }
                    return if self.stack.is_empty() {
                        LoadStep::Loaded(handle)
                    } else {
                        LoadStep::Pending
                    };
                }
            }
        }
    }
}

/// Read the sidecar manifest of `name` and return its dependency list.
fn read_dependencies(ctx: &mut PatchContext, name: &str) -> Result<Vec<String>, PatchError> {
    let path = ctx.config.manifest_path(name);
    if !ctx.storage.exists(&path) {
        return Err(PatchError::ManifestNotFound {
            name: name.to_owned(),
            path,
        });
    }
    let bytes = ctx.storage.read(&path).map_err(PatchError::internal)?;
    let entry = BundleManifestEntry::from_json(&bytes).map_err(|source| match source {
        ManifestError::SelfDependency { file_name } => PatchError::DependencyCycle {
            chain: vec![file_name.clone(), file_name],
        },
        source => PatchError::Parse {
            path: path.clone(),
            source,
        },
    })?;
    if entry.file_name != name {
        tracing::warn!(
            bundle = %name,
            manifest_name = %entry.file_name,
            path = %path,
            "sidecar manifest names a different bundle"
        );
    }
    Ok(entry.dependencies)
}

/// Read, decode, and register the file of `name`.
fn load_file(
    ctx: &mut PatchContext,
    name: &str,
    dependencies: Vec<String>,
) -> Result<BundleHandle, PatchError> {
    let path = ctx.config.bundle_path(name);
    if !ctx.storage.exists(&path) {
        return Err(PatchError::BundleFileNotFound {
            name: name.to_owned(),
            path,
        });
    }
    let bytes = ctx.storage.read(&path).map_err(PatchError::internal)?;
    let size = bytes.len() as u64;
    let contents = ctx
        .decoder
        .decode(name, bytes)
        .map_err(|message| PatchError::Internal { message })?;
    let handle = Rc::new(
        LoadedBundle::new(name, name_to_key(name), size, contents).with_dependencies(dependencies),
    );
    Ok(ctx.registry.insert_bundle(handle))
}

/// Run a [`BundleLoad`] to completion without yielding.
pub(crate) fn load_blocking(
    ctx: &mut PatchContext,
    name: &str,
    tier: CacheTier,
) -> Result<BundleHandle, PatchError> {
    let mut load = BundleLoad::new(name, tier);
    loop {
        match load.advance(ctx) {
            LoadStep::Pending => {}
            LoadStep::Loaded(handle) => return Ok(handle),
            LoadStep::Failed(error) => return Err(error),
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
    use crate::transport::OfflineTransport;

    fn context(storage: &MemoryStorage) -> PatchContext {
        PatchContext::new(
            PatchConfig::default(),
            Box::new(storage.clone()),
            Box::new(OfflineTransport),
            Box::new(RawBundleDecoder),
            Box::new(CollectingSink::new()),
        )
    }

    fn install(storage: &MemoryStorage, name: &str, deps: &[&str]) {
        let config = PatchConfig::default();
        let entry = BundleManifestEntry {
            file_name: name.to_owned(),
            size: name.len() as u64,
            checksum: String::new(),
            last_modified_utc: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        };
        storage.insert(config.manifest_path(name), entry.to_json_pretty().unwrap());
        storage.insert(config.bundle_path(name), name.as_bytes().to_vec());
    }

    fn run(load: &mut BundleLoad, ctx: &mut PatchContext) -> (Result<BundleHandle, PatchError>, u32) {
        let mut steps = 0;
        loop {
            steps += 1;
            match load.advance(ctx) {
                LoadStep::Pending => {}
                LoadStep::Loaded(handle) => return (Ok(handle), steps),
                LoadStep::Failed(error) => return (Err(error), steps),
            }
        }
    }

    // -- 1. Single bundle ----------------------------------------------------

    #[test]
    fn loads_bundle_in_two_increments() {
        let storage = MemoryStorage::new();
        install(&storage, "a", &[]);
        let mut ctx = context(&storage);

        let mut load = BundleLoad::new("a", CacheTier::OnDemand);
        let (result, steps) = run(&mut load, &mut ctx);
        let handle = result.unwrap();
        assert_eq!(handle.name(), "a");
        assert_eq!(steps, 2);
        assert_eq!(ctx.registry.tier_of("a"), Some(CacheTier::OnDemand));
    }

    #[test]
    fn resident_bundle_needs_no_io() {
        let storage = MemoryStorage::new();
        install(&storage, "a", &[]);
        let mut ctx = context(&storage);
        let first = load_blocking(&mut ctx, "a", CacheTier::OnDemand).unwrap();
        storage.clear_read_log();

        let mut load = BundleLoad::new("a", CacheTier::OnDemand);
        let (again, steps) = run(&mut load, &mut ctx);
        assert!(Rc::ptr_eq(&first, &again.unwrap()));
        assert_eq!(steps, 1);
        assert!(storage.read_log().is_empty());
    }

    // -- 2. Dependencies -----------------------------------------------------

    #[test]
    fn dependencies_load_before_dependents() {
        let storage = MemoryStorage::new();
        install(&storage, "a", &["b", "c"]);
        install(&storage, "b", &["c"]);
        install(&storage, "c", &[]);
        let mut ctx = context(&storage);
        let config = PatchConfig::default();

        load_blocking(&mut ctx, "a", CacheTier::OnDemand).unwrap();

        let file_reads: Vec<String> = storage
            .read_log()
            .into_iter()
            .filter(|p| !p.ends_with(".manifest"))
            .collect();
        assert_eq!(
            file_reads,
            vec![config.bundle_path("c"), config.bundle_path("b"), config.bundle_path("a")]
        );
    }

    // -- 3. Failures ---------------------------------------------------------

    #[test]
    fn empty_name_is_invalid() {
        let storage = MemoryStorage::new();
        let mut ctx = context(&storage);
        let err = load_blocking(&mut ctx, "  ", CacheTier::OnDemand).unwrap_err();
        assert!(matches!(err, PatchError::InvalidBundleName { .. }));
    }

    #[test]
    fn missing_manifest_and_missing_file() {
        let storage = MemoryStorage::new();
        let mut ctx = context(&storage);
        let err = load_blocking(&mut ctx, "ghost", CacheTier::OnDemand).unwrap_err();
        assert!(matches!(err, PatchError::ManifestNotFound { .. }));

        install(&storage, "hollow", &[]);
        storage
            .clone()
            .remove(&PatchConfig::default().bundle_path("hollow"))
            .unwrap();
        let err = load_blocking(&mut ctx, "hollow", CacheTier::OnDemand).unwrap_err();
        assert!(matches!(err, PatchError::BundleFileNotFound { .. }));
        assert!(!ctx.registry.contains_bundle("hollow"));
    }

    #[test]
    fn two_node_cycle_is_detected() {
        let storage = MemoryStorage::new();
        install(&storage, "a", &["b"]);
        install(&storage, "b", &["a"]);
        let mut ctx = context(&storage);

        let err = load_blocking(&mut ctx, "a", CacheTier::OnDemand).unwrap_err();
        assert_eq!(
            err,
            PatchError::DependencyCycle {
                chain: vec!["a".to_owned(), "b".to_owned(), "a".to_owned()]
            }
        );
        assert_eq!(ctx.registry.bundle_count(), 0);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let storage = MemoryStorage::new();
        let config = PatchConfig::default();
        storage.insert(
            config.manifest_path("a"),
            br#"{"fileName":"a","size":1,"md5":"x","dependencies":["a"]}"#.to_vec(),
        );
        let mut ctx = context(&storage);
        let err = load_blocking(&mut ctx, "a", CacheTier::OnDemand).unwrap_err();
        assert!(matches!(err, PatchError::DependencyCycle { chain } if chain == ["a", "a"]));
    }

    #[test]
    fn malformed_sidecar_is_parse_error() {
        let storage = MemoryStorage::new();
        storage.insert(PatchConfig::default().manifest_path("a"), b"{not json".to_vec());
        let mut ctx = context(&storage);
        let err = load_blocking(&mut ctx, "a", CacheTier::OnDemand).unwrap_err();
        assert!(matches!(err, PatchError::Parse { .. }));
    }
}

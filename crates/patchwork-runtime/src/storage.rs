//! Local patch storage.
//!
//! The pipeline addresses files by paths relative to the patch root: bundle
//! keys, sidecar manifests (`<key><suffix>`), and the aggregate manifest.
//! [`PatchStorage`] is the filesystem collaborator; [`FsStorage`] backs it
//! with a real directory and [`MemoryStorage`] with an in-memory map that
//! records every read.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Extension used for in-flight writes before they are renamed into place.
const TEMP_SUFFIX: &str = ".partial";

// ---------------------------------------------------------------------------
// PatchStorage
// ---------------------------------------------------------------------------

/// Flat file store rooted at the patch directory.
pub trait PatchStorage {
    /// Whether `path` exists.
    fn exists(&self, path: &str) -> bool;

    /// Read the whole file at `path`.
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Replace the file at `path` with `bytes`.
    ///
    /// Readers never observe a partially written file.
    fn write(&mut self, path: &str, bytes: &[u8]) -> io::Result<()>;

    /// Delete `path`. Deleting a missing file is not an error.
    fn remove(&mut self, path: &str) -> io::Result<()>;

    /// Names of all stored files, sorted.
    fn list(&self) -> io::Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// FsStorage
// ---------------------------------------------------------------------------

/// [`PatchStorage`] over a directory on disk.
///
/// Writes go to `<path>.partial` first and are renamed over the target, so a
/// crash mid-write leaves the previous version intact.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Use `root` as the patch directory. The directory is not created.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Use `root` as the patch directory, creating it if needed.
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let storage = Self::new(root);
        fs::create_dir_all(&storage.root)?;
        Ok(storage)
    }

    /// The patch directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        let plain = relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if path.is_empty() || !plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("storage path must be a plain relative path: {path:?}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl PatchStorage for FsStorage {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path)?)
    }

    fn write(&mut self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = self.resolve(&format!("{path}{TEMP_SUFFIX}"))?;
        fs::write(&temp, bytes)?;
        fs::rename(&temp, &target)
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(path)?) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(TEMP_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, Vec<u8>>,
    reads: Vec<String>,
}

/// In-memory [`PatchStorage`] that logs every successful read.
///
/// Clones share the same files and read log, so a test can keep one clone
/// while a [`PatchSystem`](crate::system::PatchSystem) owns the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` at `path` without going through the trait.
    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.state.borrow_mut().files.insert(path.into(), bytes.into());
    }

    /// Contents of `path`, if present.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.borrow().files.get(path).cloned()
    }

    /// Snapshot of every stored file.
    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.borrow().files.clone()
    }

    /// Number of stored files.
    pub fn len(&self) -> usize {
        self.state.borrow().files.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().files.is_empty()
    }

    /// Every path read so far, in order.
    pub fn read_log(&self) -> Vec<String> {
        self.state.borrow().reads.clone()
    }

    /// Number of reads of `path` so far.
    pub fn reads_of(&self, path: &str) -> usize {
        self.state.borrow().reads.iter().filter(|p| *p == path).count()
    }

    /// Forget the read log.
    pub fn clear_read_log(&self) {
        self.state.borrow_mut().reads.clear();
    }
}

impl PatchStorage for MemoryStorage {
    fn exists(&self, path: &str) -> bool {
        self.state.borrow().files.contains_key(path)
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        let bytes = state.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}"))
        })?;
        state.reads.push(path.to_owned());
        Ok(bytes)
    }

    fn write(&mut self, path: &str, bytes: &[u8]) -> io::Result<()> {
        self.insert(path, bytes);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        self.state.borrow_mut().files.remove(path);
        Ok(())
    }

    fn list(&self) -> io::Result<Vec<String>> {
        Ok(self.state.borrow().files.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

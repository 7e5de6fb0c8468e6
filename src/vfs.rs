//! Virtual file system used to read shader sources and cache compiled binaries.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VfsError {
    #[error("file '{0}' not found")]
    NotFound(String),
    #[error("failed to access {path:?}: {message}")]
    Io { path: String, message: String },
}

/// Paths are '/'-separated and relative to the file system root.
pub trait Vfs {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError>;
    fn write_file(&self, path: &str, data: &[u8]) -> Result<(), VfsError>;
    fn file_exists(&self, path: &str) -> bool;
    fn last_modified(&self, path: &str) -> Option<SystemTime>;
    /// File names (not paths) directly inside `dir`.
    fn list_files(&self, dir: &str) -> Vec<String>;
}

/// [`Vfs`] over the host file system, rooted at a directory.
pub struct NativeVfs {
    root: PathBuf,
}

impl NativeVfs {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Vfs for NativeVfs {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        let full = self.resolve(path);
        std::fs::read(&full).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => VfsError::NotFound(path.to_string()),
            _ => VfsError::Io {
                path: format!("{:?}", full),
                message: err.to_string(),
            },
        })
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<(), VfsError> {
        let full = self.resolve(path);
        let io_err = |err: std::io::Error| VfsError::Io {
            path: format!("{:?}", full),
            message: err.to_string(),
        };
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&full, data).map_err(io_err)
    }

    fn file_exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn last_modified(&self, path: &str) -> Option<SystemTime> {
        std::fs::metadata(self.resolve(path))
            .and_then(|meta| meta.modified())
            .ok()
    }

    fn list_files(&self, dir: &str) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.resolve(dir)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }
}

struct MemoryFile {
    data: Vec<u8>,
    modified: u64,
}

/// In-memory [`Vfs`] with explicit timestamps and access counters.
///
/// Timestamps are whole seconds after the Unix epoch. Writes stamp the file
/// with a time strictly newer than anything already stored.
#[derive(Default)]
pub struct MemoryVfs {
    files: RefCell<BTreeMap<String, MemoryFile>>,
    clock: Cell<u64>,
    reads: Cell<usize>,
    writes: Cell<usize>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` at `path` with the given modification time.
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>, modified: u64) {
        self.clock.set(self.clock.get().max(modified));
        self.files.borrow_mut().insert(
            normalize(path),
            MemoryFile {
                data: data.into(),
                modified,
            },
        );
    }

    pub fn set_modified(&self, path: &str, modified: u64) {
        if let Some(file) = self.files.borrow_mut().get_mut(&normalize(path)) {
            file.modified = modified;
            self.clock.set(self.clock.get().max(modified));
        }
    }

    pub fn remove(&self, path: &str) -> bool {
        self.files.borrow_mut().remove(&normalize(path)).is_some()
    }

    pub fn read_count(&self) -> usize {
        self.reads.get()
    }

    pub fn write_count(&self) -> usize {
        self.writes.get()
    }

    pub fn reset_counters(&self) {
        self.reads.set(0);
        self.writes.set(0);
    }
}

impl Vfs for MemoryVfs {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        self.reads.set(self.reads.get() + 1);
        self.files
            .borrow()
            .get(&normalize(path))
            .map(|file| file.data.clone())
            .ok_or_else(|| VfsError::NotFound(path.to_string()))
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<(), VfsError> {
        self.writes.set(self.writes.get() + 1);
        let stamp = self.clock.get() + 1;
        self.clock.set(stamp);
        self.files.borrow_mut().insert(
            normalize(path),
            MemoryFile {
                data: data.to_vec(),
                modified: stamp,
            },
        );
        Ok(())
    }

    fn file_exists(&self, path: &str) -> bool {
        self.files.borrow().contains_key(&normalize(path))
    }

    fn last_modified(&self, path: &str) -> Option<SystemTime> {
        self.files
            .borrow()
            .get(&normalize(path))
            .map(|file| SystemTime::UNIX_EPOCH + Duration::from_secs(file.modified))
    }

    fn list_files(&self, dir: &str) -> Vec<String> {
        let prefix = normalize(dir);
        let prefix = if prefix.is_empty() || prefix.ends_with('/') {
            prefix
        } else {
            format!("{prefix}/")
        };
        self.files
            .borrow()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_writes_are_newer_than_existing_files() {
        let vfs = MemoryVfs::new();
        vfs.insert("shaders/a.vsh", "fn vs_main() {}", 100);
        vfs.write_file("cache/a.obj", b"bin").unwrap();

        let source = vfs.last_modified("shaders/a.vsh").unwrap();
        let binary = vfs.last_modified("cache/a.obj").unwrap();
        assert!(binary > source);
        assert_eq!(vfs.write_count(), 1);
    }

    #[test]
    fn memory_list_files_is_not_recursive() {
        let vfs = MemoryVfs::new();
        vfs.insert("shaders/common.sh", "", 1);
        vfs.insert("shaders/fog.sh", "", 1);
        vfs.insert("shaders/sub/deep.sh", "", 1);

        assert_eq!(vfs.list_files("shaders"), vec!["common.sh", "fog.sh"]);
        assert_eq!(vfs.list_files("shaders/"), vec!["common.sh", "fog.sh"]);
    }

    #[test]
    fn native_round_trip_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = NativeVfs::new(dir.path());

        assert!(!vfs.file_exists("cache/x.obj"));
        assert!(matches!(
            vfs.read_file("cache/x.obj"),
            Err(VfsError::NotFound(_))
        ));

        vfs.write_file("cache/x.obj", b"abc").unwrap();
        assert!(vfs.file_exists("cache/x.obj"));
        assert_eq!(vfs.read_file("cache/x.obj").unwrap(), b"abc");
        assert!(vfs.last_modified("cache/x.obj").is_some());
        assert_eq!(vfs.list_files("cache"), vec!["x.obj"]);
    }
}

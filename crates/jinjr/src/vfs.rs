//! The virtual filesystem templates are loaded through.
//!
//! The engine only ever asks for three things: load a file, read its
//! timestamp, and check whether a previously seen timestamp is still
//! current (template cache invalidation). The default implementation reads
//! the real filesystem; [`MemVfs`] backs tests and embedded template sets.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};

pub trait Vfs {
    /// Load a file as UTF-8 text plus its modification timestamp.
    fn load(&self, path: &str) -> Result<(String, SystemTime)>;

    /// The file's current modification timestamp.
    fn timestamp(&self, path: &str) -> Result<SystemTime>;

    /// Whether a previously observed timestamp is still current.
    fn is_current(&self, path: &str, seen: SystemTime) -> Result<bool> {
        Ok(self.timestamp(path)? == seen)
    }
}

// A shared VFS handle is itself a VFS; lets the host keep mutating a
// MemVfs it already handed to an engine.
impl<T: Vfs + ?Sized> Vfs for std::rc::Rc<T> {
    fn load(&self, path: &str) -> Result<(String, SystemTime)> {
        (**self).load(path)
    }

    fn timestamp(&self, path: &str) -> Result<SystemTime> {
        (**self).timestamp(path)
    }

    fn is_current(&self, path: &str, seen: SystemTime) -> Result<bool> {
        (**self).is_current(path, seen)
    }
}

/// Real-filesystem VFS, optionally rooted at a directory.
pub struct DiskVfs {
    root: Option<PathBuf>,
}

impl DiskVfs {
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Resolve template paths relative to `root`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path),
            None => PathBuf::from(path),
        }
    }
}

impl Default for DiskVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for DiskVfs {
    fn load(&self, path: &str) -> Result<(String, SystemTime)> {
        let full = self.resolve(path);
        let text = std::fs::read_to_string(&full)
            .map_err(|e| Error::Io(format!("cannot read '{}': {e}", full.display())))?;
        let ts = self.timestamp(path)?;
        Ok((text, ts))
    }

    fn timestamp(&self, path: &str) -> Result<SystemTime> {
        let full = self.resolve(path);
        let meta = std::fs::metadata(&full)
            .map_err(|e| Error::Io(format!("cannot stat '{}': {e}", full.display())))?;
        meta.modified()
            .map_err(|e| Error::Io(format!("cannot read mtime of '{}': {e}", full.display())))
    }
}

/// In-memory VFS. Each insert bumps the file's version, which doubles as
/// its timestamp, so cache-invalidation paths are testable.
pub struct MemVfs {
    files: RefCell<HashMap<String, (String, u64)>>,
}

impl MemVfs {
    pub fn new() -> Self {
        Self {
            files: RefCell::new(HashMap::new()),
        }
    }

    pub fn insert(&self, path: impl Into<String>, content: impl Into<String>) {
        let mut files = self.files.borrow_mut();
        let path = path.into();
        let version = files.get(&path).map(|(_, v)| v + 1).unwrap_or(1);
        files.insert(path, (content.into(), version));
    }

    fn version_time(version: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(version)
    }
}

impl Default for MemVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for MemVfs {
    fn load(&self, path: &str) -> Result<(String, SystemTime)> {
        let files = self.files.borrow();
        match files.get(path) {
            Some((content, version)) => Ok((content.clone(), Self::version_time(*version))),
            None => Err(Error::Io(format!("no such file '{path}'"))),
        }
    }

    fn timestamp(&self, path: &str) -> Result<SystemTime> {
        let files = self.files.borrow();
        match files.get(path) {
            Some((_, version)) => Ok(Self::version_time(*version)),
            None => Err(Error::Io(format!("no such file '{path}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_vfs_versions_act_as_timestamps() {
        let vfs = MemVfs::new();
        vfs.insert("a.tpl", "one");
        let (content, ts1) = vfs.load("a.tpl").unwrap();
        assert_eq!(content, "one");
        assert!(vfs.is_current("a.tpl", ts1).unwrap());

        vfs.insert("a.tpl", "two");
        assert!(!vfs.is_current("a.tpl", ts1).unwrap());
        let (content, ts2) = vfs.load("a.tpl").unwrap();
        assert_eq!(content, "two");
        assert!(ts2 > ts1);
    }

    #[test]
    fn missing_files_report_io_errors() {
        let vfs = MemVfs::new();
        assert!(matches!(vfs.load("nope"), Err(Error::Io(_))));
    }
}

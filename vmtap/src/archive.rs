//! Best-effort persistence of observed class files.
//!
//! Buffers land at `<root>/<bucket>/<name>.class`, keeping the package
//! hierarchy as subdirectories. Archiving is purely diagnostic: a failed
//! write is logged by the caller and abandoned, never retried, and never
//! allowed to disturb the hosting process.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::classification::ClassKind;

/// Storage seam for classified class files.
///
/// The production sink writes to disk; tests substitute spies to prove
/// out-of-scope classes cause no work at all.
pub trait ArchiveSink: Send + Sync {
    /// Persist one buffer, returning the path it landed at.
    ///
    /// # Errors
    /// Any I/O failure from directory creation or the write itself.
    fn store(&self, kind: ClassKind, name: &str, data: &[u8]) -> io::Result<PathBuf>;
}

/// Disk-backed archive rooted at a configured directory.
///
/// Missing parent directories are created on demand; `create_dir_all`
/// treats a directory that already exists as success, so concurrent
/// creation races are harmless. The physical write is serialized behind
/// one mutex.
pub struct DirArchiver {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirArchiver {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), write_lock: Mutex::new(()) }
    }
}

impl ArchiveSink for DirArchiver {
    fn store(&self, kind: ClassKind, name: &str, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.root.join(kind.bucket()).join(format!("{name}.class"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let _guard = self.write_lock.lock().ok();
        fs::write(&path, data)?;
        Ok(path)
    }
}

//! Tamper classification for observed bytecode.
//!
//! A well-formed class file opens with the canonical magic bytes. A
//! protected application that decrypts classes at load time hands the
//! runtime buffers that don't, which is exactly the signal this module
//! looks for. Classification reads nothing beyond the four-byte prefix.

use std::collections::HashSet;
use std::sync::Mutex;

use vmtap_common::CLASS_FILE_MAGIC;

/// Outcome of the magic-number heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// Leading bytes equal the canonical class-file magic.
    Normal,
    /// Any other prefix, including buffers too short to hold one.
    Encrypted,
}

impl ClassKind {
    /// Archive bucket name for this kind.
    #[must_use]
    pub const fn bucket(self) -> &'static str {
        match self {
            ClassKind::Normal => "normal",
            ClassKind::Encrypted => "encrypted",
        }
    }
}

/// Classify a bytecode buffer by its leading bytes.
///
/// A buffer shorter than the magic is malformed; it classifies as
/// [`ClassKind::Encrypted`] rather than normal, the conservative reading
/// for anything we cannot positively identify.
#[must_use]
pub fn classify(data: &[u8]) -> ClassKind {
    match data.get(..CLASS_FILE_MAGIC.len()) {
        Some(prefix) if prefix == CLASS_FILE_MAGIC => ClassKind::Normal,
        _ => ClassKind::Encrypted,
    }
}

/// Names of classes observed with tampered bytecode.
///
/// Insertion order is irrelevant and duplicates are no-ops; the set only
/// answers "has this class ever been seen encrypted". Writers are
/// class-load callbacks on arbitrary runtime threads, so access goes
/// through a mutex.
#[derive(Default)]
pub struct EncryptedSet {
    names: Mutex<HashSet<String>>,
}

impl EncryptedSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a name. Returns true on first insertion.
    pub fn insert(&self, name: &str) -> bool {
        self.names.lock().map(|mut names| names.insert(name.to_string())).unwrap_or(false)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().map(|names| names.contains(name)).unwrap_or(false)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.lock().map(|names| names.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of the recorded names.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.names.lock().map(|names| names.iter().cloned().collect()).unwrap_or_default();
        names.sort();
        names
    }
}

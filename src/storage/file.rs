//! Database file object
//!
//! Thin wrapper around `std::fs::File` + `memmap2` providing the primitives
//! the slab allocator needs: open with explicit access/create modes, size
//! query, header write, preallocation, fsync, and read-only or writable
//! mappings. Unmap and close happen on drop.
//!
//! Transparent page encryption belongs to a separate mapping layer that is
//! not part of this crate. A key can be stored on the file object, but
//! mapping a keyed file fails with a decryption error; callers surface it
//! as an invalid-database condition.

use crate::error::{Error, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

static SYNC_TO_DISK_DISABLED: AtomicBool = AtomicBool::new(false);

/// Process-wide switch that elides every `sync()` call.
///
/// Intended for test runs where durability is irrelevant. Set once during
/// startup, before any database file is opened.
pub fn disable_sync_to_disk(disable: bool) {
    SYNC_TO_DISK_DISABLED.store(disable, Ordering::Relaxed);
}

pub(crate) fn sync_to_disk_disabled() -> bool {
    SYNC_TO_DISK_DISABLED.load(Ordering::Relaxed)
}

/// File access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// File creation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Never create; opening a missing file fails.
    Never,
    /// Create the file if it does not exist.
    Auto,
}

/// An open database file
pub struct File {
    inner: std::fs::File,
    path: PathBuf,
    encryption_key: Option<Vec<u8>>,
}

impl File {
    /// Open (or create) the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, access: AccessMode, create: CreateMode) -> Result<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(true);
        if access == AccessMode::ReadWrite {
            options.write(true);
            if create == CreateMode::Auto {
                options.create(true);
            }
        }
        let inner = options
            .open(path)
            .map_err(|e| Error::File(format!("Failed to open {}: {}", path.display(), e)))?;

        debug!(path = ?path, ?access, ?create, "Opened database file");

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            encryption_key: None,
        })
    }

    /// Store the encryption key used to decrypt file pages.
    pub fn set_encryption_key(&mut self, key: &[u8]) {
        self.encryption_key = Some(key.to_vec());
    }

    /// Current file size in bytes.
    pub fn get_size(&self) -> Result<u64> {
        let meta = self
            .inner
            .metadata()
            .map_err(|e| Error::File(format!("Failed to stat {}: {}", self.path.display(), e)))?;
        Ok(meta.len())
    }

    /// Write `bytes` at the current file position.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .map_err(|e| Error::File(format!("Write to {} failed: {}", self.path.display(), e)))
    }

    /// Ensure the file covers at least `[offset, offset + size)`.
    pub fn prealloc(&self, offset: u64, size: u64) -> Result<()> {
        let end = offset + size;
        if self.get_size()? < end {
            self.inner
                .set_len(end)
                .map_err(|e| Error::File(format!("Prealloc of {} failed: {}", self.path.display(), e)))?;
        }
        Ok(())
    }

    /// Flush file content and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner
            .sync_all()
            .map_err(|e| Error::File(format!("Sync of {} failed: {}", self.path.display(), e)))
    }

    /// Map the first `size` bytes read-only.
    pub fn map(&self, size: usize) -> Result<Mmap> {
        self.check_no_encryption()?;
        // Safety: the mapping is private to this process; TDB requires that
        // concurrent writers coordinate through a transaction layer.
        unsafe { MmapOptions::new().len(size).map(&self.inner) }
            .map_err(|e| Error::File(format!("Mmap of {} failed: {}", self.path.display(), e)))
    }

    /// Map the first `size` bytes read-write.
    pub fn map_mut(&self, size: usize) -> Result<MmapMut> {
        self.check_no_encryption()?;
        unsafe { MmapOptions::new().len(size).map_mut(&self.inner) }
            .map_err(|e| Error::File(format!("Mmap of {} failed: {}", self.path.display(), e)))
    }

    fn check_no_encryption(&self) -> Result<()> {
        if self.encryption_key.is_some() {
            // Decryption happens in an encrypted-mapping layer outside this
            // crate; a keyed file cannot be mapped directly.
            return Err(Error::DecryptionFailed(format!(
                "No encryption layer available for {}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("encrypted", &self.encryption_key.is_some())
            .finish()
    }
}

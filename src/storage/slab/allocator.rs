//! Slab allocator implementation
//!
//! `SlabAlloc` owns the unified reference space: refs below the baseline
//! address the memory-mapped database file, refs at or above it address a
//! chain of heap-backed slabs holding uncommitted writes. Free space is
//! tracked in two segregated lists (read-only vs mutable) whose chunks never
//! cross a slab boundary, so each slab stays independently releasable.

use super::format::{
    self, Header, StreamingFooter, FLAGS_SELECT_BIT, FLAGS_SERVER_SYNC_MODE, FOOTER_MAGIC_COOKIE,
    HEADER_SIZE,
};
use super::segment;
use crate::error::{Error, Result};
use crate::storage::file::{sync_to_disk_disabled, AccessMode, CreateMode, File};
use memmap2::{Mmap, MmapMut};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::path::Path;
use std::ptr::NonNull;
use tracing::{debug, info, warn};

/// Offset into the unified reference space. Always a multiple of 8.
pub type Ref = usize;

/// An allocated region: its address and its ref.
#[derive(Debug, Clone, Copy)]
pub struct MemRef {
    pub addr: *mut u8,
    pub ref_: Ref,
}

/// A free region within a single slab or within the mapped file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub ref_: Ref,
    pub size: usize,
}

/// A heap-backed region extending the reference space past the baseline.
struct Slab {
    addr: NonNull<u8>,
    size: usize,
    /// One past the last ref covered by this slab.
    ref_end: Ref,
}

const SLAB_ALIGN: usize = 8;

impl Slab {
    fn new_zeroed(size: usize, ref_end: Ref) -> Result<Self> {
        debug_assert!(size > 0);
        let layout = Layout::from_size_align(size, SLAB_ALIGN)
            .map_err(|_| Error::OutOfMemory(format!("Slab layout of {} bytes", size)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let addr = NonNull::new(ptr)
            .ok_or_else(|| Error::OutOfMemory(format!("Slab of {} bytes", size)))?;
        Ok(Self {
            addr,
            size,
            ref_end,
        })
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // Size and alignment match the original allocation.
        unsafe {
            dealloc(
                self.addr.as_ptr(),
                Layout::from_size_align_unchecked(self.size, SLAB_ALIGN),
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreeSpaceState {
    /// The mutable free list exactly mirrors the slab chain.
    Clean,
    /// Allocations or frees have happened since the last reset.
    Dirty,
    /// Free-space bookkeeping was lost (out-of-memory during a free); no
    /// allocation is permitted until the next reset.
    Invalid,
}

/// What the allocator is attached to. Each variant carries the resource it
/// owns; dropping the variant releases it.
enum Attachment {
    None,
    /// `attach_empty`: no backing buffer, everything lives in slabs.
    OwnedBuffer,
    /// Caller-supplied buffer; borrowed, never freed here.
    UsersBuffer,
    /// Mapped database file. The mapping is released before the file closes.
    File {
        file: File,
        map: Mmap,
        shared: bool,
    },
}

/// Options for [`SlabAlloc::attach_file`].
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    pub is_shared: bool,
    pub read_only: bool,
    pub no_create: bool,
    pub skip_validate: bool,
    pub encryption_key: Option<Vec<u8>>,
    pub server_sync_mode: bool,
}

impl AttachOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open through a shared group (multi-process access).
    #[must_use]
    pub fn shared(mut self, yes: bool) -> Self {
        self.is_shared = yes;
        self
    }

    #[must_use]
    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    /// Fail instead of creating a missing file.
    #[must_use]
    pub fn no_create(mut self, yes: bool) -> Self {
        self.no_create = yes;
        self
    }

    /// Skip header validation (serialization tools on trusted files).
    #[must_use]
    pub fn skip_validate(mut self, yes: bool) -> Self {
        self.skip_validate = yes;
        self
    }

    #[must_use]
    pub fn encryption_key(mut self, key: &[u8]) -> Self {
        self.encryption_key = Some(key.to_vec());
        self
    }

    #[must_use]
    pub fn server_sync_mode(mut self, yes: bool) -> Self {
        self.server_sync_mode = yes;
        self
    }
}

/// The slab allocator at the core of the storage layer.
///
/// Holds raw pointers into the mapping and the slabs, so it is neither
/// `Send` nor `Sync`; a transaction coordinator serializes access.
pub struct SlabAlloc {
    attachment: Attachment,
    /// Base address of the mapped region (null for `attach_empty`).
    data: *const u8,
    /// Size of the mapped region; boundary between read-only and mutable refs.
    baseline: usize,
    /// Slabs ordered by `ref_end`.
    slabs: Vec<Slab>,
    /// Free chunks within slabs; feeds `alloc`.
    free_space: Vec<Chunk>,
    /// Free chunks within the mapped file; bookkeeping only.
    free_read_only: Vec<Chunk>,
    free_space_state: FreeSpaceState,
    file_format: u8,
    file_on_streaming_form: bool,
}

impl SlabAlloc {
    /// Create a detached allocator.
    pub fn new() -> Self {
        Self {
            attachment: Attachment::None,
            data: std::ptr::null(),
            baseline: 0,
            slabs: Vec::new(),
            free_space: Vec::new(),
            free_read_only: Vec::new(),
            free_space_state: FreeSpaceState::Clean,
            file_format: 0,
            file_on_streaming_form: false,
        }
    }

    pub fn is_attached(&self) -> bool {
        !matches!(self.attachment, Attachment::None)
    }

    /// Attach to a database file, creating it when empty and permitted.
    ///
    /// Returns the top ref of the stored data structure. On any failure the
    /// allocator remains detached. The free-space state is left `Invalid` so
    /// that a `reset_free_space_tracking` must precede the first allocation.
    pub fn attach_file<P: AsRef<Path>>(&mut self, path: P, options: AttachOptions) -> Result<Ref> {
        assert!(!self.is_attached());
        // Multiple processes may only share a database through a shared
        // group, and a shared group never opens read-only.
        assert!(!(options.is_shared && options.read_only));

        let path = path.as_ref();
        let access = if options.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };
        let create = if options.read_only || options.no_create {
            CreateMode::Never
        } else {
            CreateMode::Auto
        };
        let mut file = File::open(path, access, create)?;
        if let Some(key) = &options.encryption_key {
            file.set_encryption_key(key);
        }

        const INITIAL_SIZE: u64 = 4 * 1024;

        let file_size = file.get_size()?;
        let mut size = usize::try_from(file_size)
            .map_err(|_| Error::InvalidDatabase("Database file too large".to_string()))?;

        let mut did_create = false;
        if size == 0 {
            did_create = true;
            // An existing-but-empty file can appear while another process is
            // still creating it; only read-write access may initialize it.
            if options.read_only {
                return Err(Error::InvalidDatabase(
                    "Read-only access to empty database file".to_string(),
                ));
            }
            let header = Header::empty(options.server_sync_mode);
            file.write(&header.to_bytes())?;
            file.prealloc(0, INITIAL_SIZE)?;
            if !sync_to_disk_disabled() {
                file.sync()?;
            }
            size = INITIAL_SIZE as usize;
        }

        if size < HEADER_SIZE {
            return Err(Error::InvalidDatabase("Database file has bad size".to_string()));
        }

        let map = file.map(size).map_err(|e| match e {
            Error::DecryptionFailed(_) => Error::InvalidDatabase("Decryption failed".to_string()),
            other => other,
        })?;

        let mut top_ref = 0;
        let mut streaming_form = false;
        if !options.skip_validate {
            let validated = format::validate_buffer(&map[..], options.is_shared)?;
            top_ref = validated.top_ref;
            streaming_form = validated.streaming_form;
        }

        let header = Header::from_bytes(&map[..HEADER_SIZE]);
        if !did_create {
            let stored_server_sync_mode = header.flags & FLAGS_SERVER_SYNC_MODE != 0;
            if options.server_sync_mode && !stored_server_sync_mode {
                return Err(Error::InvalidDatabase(
                    "Database file was not created with support for client/server \
                     synchronization"
                        .to_string(),
                ));
            }
            if !options.server_sync_mode && stored_server_sync_mode {
                return Err(Error::InvalidDatabase(
                    "Database file requires support for client/server synchronization"
                        .to_string(),
                ));
            }
        }

        info!(path = ?path, size, shared = options.is_shared, "Attached database file");

        // Nothing below this point may fail.
        self.file_format = header.file_format[header.select_field()];
        self.data = map.as_ptr();
        self.baseline = size;
        self.file_on_streaming_form = streaming_form;
        self.attachment = Attachment::File {
            file,
            map,
            shared: options.is_shared,
        };
        // Force a reset before the first allocation so slabs enter the free
        // list from a known clean point.
        self.free_space_state = FreeSpaceState::Invalid;

        Ok(top_ref)
    }

    /// Attach to a caller-supplied buffer holding a database image.
    ///
    /// The buffer is borrowed, never freed by the allocator.
    ///
    /// # Safety
    ///
    /// `data` must point to `size` readable bytes that stay valid and
    /// unmodified for the whole attachment (until `detach` or drop).
    pub unsafe fn attach_buffer(&mut self, data: *const u8, size: usize) -> Result<Ref> {
        assert!(!self.is_attached());

        let buf = std::slice::from_raw_parts(data, size);
        let validated = format::validate_buffer(buf, false)?;
        let header = Header::from_bytes(&buf[..HEADER_SIZE]);

        self.file_format = header.file_format[header.select_field()];
        self.data = data;
        self.baseline = size;
        self.file_on_streaming_form = validated.streaming_form;
        self.attachment = Attachment::UsersBuffer;

        Ok(validated.top_ref)
    }

    /// Attach with no backing storage; everything lives in slabs.
    pub fn attach_empty(&mut self) {
        assert!(!self.is_attached());

        self.attachment = Attachment::OwnedBuffer;
        self.data = std::ptr::null();
        // No ref may ever be less than the header size, so use it as the
        // baseline here.
        self.baseline = HEADER_SIZE;
    }

    /// Release the attached resource and all slabs.
    pub fn detach(&mut self) {
        match std::mem::replace(&mut self.attachment, Attachment::None) {
            Attachment::None | Attachment::UsersBuffer | Attachment::OwnedBuffer => {}
            Attachment::File { file, map, .. } => {
                // Unmap before the file closes.
                drop(map);
                drop(file);
            }
        }
        self.data = std::ptr::null();
        self.baseline = 0;
        self.slabs.clear();
        self.free_space.clear();
        self.free_read_only.clear();
        self.free_space_state = FreeSpaceState::Clean;
        self.file_format = 0;
        self.file_on_streaming_form = false;
    }

    /// Allocate `size` bytes (`size > 0`, multiple of 8).
    pub fn alloc(&mut self, size: usize) -> Result<MemRef> {
        debug_assert!(size > 0);
        debug_assert!(size % 8 == 0, "allocation sizes must be multiples of 8");
        debug_assert!(self.is_attached());

        // If free space recording failed earlier, new allocations cannot be
        // carried out until the record is reset.
        if self.free_space_state == FreeSpaceState::Invalid {
            return Err(Error::InvalidFreeSpace);
        }
        self.free_space_state = FreeSpaceState::Dirty;

        // Reuse a free chunk if possible. Scan from the tail: fresh slabs
        // append their remainder there, so the tail holds the big chunks.
        for i in (0..self.free_space.len()).rev() {
            if size <= self.free_space[i].size {
                let ref_ = self.free_space[i].ref_;
                let rest = self.free_space[i].size - size;

                if rest == 0 {
                    self.free_space.swap_remove(i);
                } else {
                    let chunk = &mut self.free_space[i];
                    chunk.ref_ += size;
                    chunk.size = rest;
                }

                debug!("Alloc ref: {} size: {}", ref_, size);
                let addr = self.translate(ref_);
                #[cfg(feature = "alloc-set-zero")]
                unsafe {
                    std::ptr::write_bytes(addr, 0, size);
                }
                return Ok(MemRef { addr, ref_ });
            }
        }

        // Otherwise grow: round the request up to a multiple of 256 and make
        // the new slab at least twice as big as the previous one.
        let mut new_size = ((size - 1) | 255) + 1;
        let ref_ = match self.slabs.last() {
            None => self.baseline,
            Some(last) => {
                let curr_ref_end = last.ref_end;
                let prev_ref_end = if self.slabs.len() == 1 {
                    self.baseline
                } else {
                    self.slabs[self.slabs.len() - 2].ref_end
                };
                let min_size = 2 * (curr_ref_end - prev_ref_end);
                if new_size < min_size {
                    new_size = min_size;
                }
                curr_ref_end
            }
        };

        // Reserve all bookkeeping before touching any state; a failure in
        // this path must leave the allocator unchanged.
        self.slabs
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory("slab list".to_string()))?;
        if new_size > size {
            self.free_space
                .try_reserve(1)
                .map_err(|_| Error::OutOfMemory("free list".to_string()))?;
        }
        let slab = Slab::new_zeroed(new_size, ref_ + new_size)?;
        let addr = slab.addr.as_ptr();

        self.slabs.push(slab);
        if new_size > size {
            self.free_space.push(Chunk {
                ref_: ref_ + size,
                size: new_size - size,
            });
        }

        debug!("Alloc ref: {} size: {} (new slab of {})", ref_, size, new_size);
        Ok(MemRef { addr, ref_ })
    }

    /// Return a region to its free list, coalescing with neighbors where
    /// that does not cross a slab boundary.
    ///
    /// `addr` must equal `translate(ref_)`. The region's size is read from
    /// its segment header.
    pub fn free(&mut self, ref_: Ref, addr: *const u8) {
        assert_eq!(self.translate(ref_) as *const u8, addr);

        // Free space in the read-only segment is tracked separately.
        let read_only = self.is_read_only(ref_);

        // Read-only segments record their disk footprint; mutable segments
        // round to the capacity of the backing region.
        let size = if read_only {
            unsafe { segment::byte_size_from_header(addr) }
        } else {
            unsafe { segment::capacity_from_header(addr) }
        };
        let ref_end = ref_ + size;

        debug!("Free ref: {} size: {}", ref_, size);

        // Bookkeeping is already lost; the memory itself is unaffected.
        if self.free_space_state == FreeSpaceState::Invalid {
            return;
        }

        // Mutable memory cannot be freed unless it has first been allocated,
        // and any allocation puts free-space tracking into the dirty state.
        debug_assert!(read_only || self.free_space_state == FreeSpaceState::Dirty);
        self.free_space_state = FreeSpaceState::Dirty;

        let starts_at_slab_boundary = self.slabs.iter().any(|s| s.ref_end == ref_);
        let ends_at_slab_boundary = self.slabs.iter().any(|s| s.ref_end == ref_end);
        let free_space = if read_only {
            &mut self.free_read_only
        } else {
            &mut self.free_space
        };

        // Merge with the adjacent succeeding free chunk. No consolidation
        // over slab borders: chunks must stay wholly inside one slab.
        let mut merged_with = None;
        if !ends_at_slab_boundary {
            if let Some(i) = free_space.iter().position(|c| c.ref_ == ref_end) {
                free_space[i].ref_ = ref_;
                free_space[i].size += size;
                merged_with = Some(i);
            }
        }

        // Merge with the adjacent preceding free chunk, same restriction.
        if !starts_at_slab_boundary {
            if let Some(i) = free_space.iter().position(|c| c.ref_ + c.size == ref_) {
                match merged_with {
                    Some(j) => {
                        let merged_size = free_space[j].size;
                        free_space[i].size += merged_size;
                        free_space.swap_remove(j);
                    }
                    None => free_space[i].size += size,
                }
                return;
            }
        }

        if merged_with.is_none() {
            // Vec::push aborts the process on OOM; reserve first and give up
            // tracking instead.
            if free_space.try_reserve(1).is_err() {
                self.free_space_state = FreeSpaceState::Invalid;
                return;
            }
            free_space.push(Chunk { ref_, size });
        }
    }

    /// Move a region to a new allocation of `new_size` bytes, preserving the
    /// first `old_size` bytes. The old region is freed. If allocation fails
    /// the original region is untouched.
    pub fn realloc(
        &mut self,
        ref_: Ref,
        addr: *const u8,
        old_size: usize,
        new_size: usize,
    ) -> Result<MemRef> {
        debug_assert_eq!(self.translate(ref_) as *const u8, addr);
        debug_assert!(new_size > 0);
        debug_assert!(new_size % 8 == 0, "allocation sizes must be multiples of 8");

        // TODO: try extending in place when the region is followed by a
        // large-enough free chunk.

        let new_mem = self.alloc(new_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(addr, new_mem.addr, old_size);
        }
        self.free(ref_, addr);

        debug!(
            "Realloc orig_ref: {} old_size: {} new_ref: {} new_size: {}",
            ref_, old_size, new_mem.ref_, new_size
        );
        Ok(new_mem)
    }

    /// Translate a ref to an address.
    ///
    /// Writing through the returned pointer is only valid for refs at or
    /// above the baseline; the mapped file region is read-only.
    pub fn translate(&self, ref_: Ref) -> *mut u8 {
        debug_assert!(self.is_attached());

        if ref_ < self.baseline {
            debug_assert!(!self.data.is_null());
            return unsafe { self.data.add(ref_) as *mut u8 };
        }

        // First slab whose ref_end lies past the ref.
        let i = self.slabs.partition_point(|s| s.ref_end <= ref_);
        debug_assert!(i < self.slabs.len(), "ref outside the reference space");

        let slab_ref = if i == 0 {
            self.baseline
        } else {
            self.slabs[i - 1].ref_end
        };
        unsafe { self.slabs[i].addr.as_ptr().add(ref_ - slab_ref) }
    }

    /// Whether `ref_` addresses the mapped file region.
    pub fn is_read_only(&self, ref_: Ref) -> bool {
        ref_ < self.baseline
    }

    /// Size of the mapped file region.
    pub fn get_baseline(&self) -> usize {
        self.baseline
    }

    /// Total extent of the reference space, slabs included.
    pub fn get_total_size(&self) -> usize {
        self.slabs.last().map_or(self.baseline, |s| s.ref_end)
    }

    /// File-format version this attachment runs at.
    ///
    /// Differs from [`get_committed_file_format`](Self::get_committed_file_format)
    /// while a version-2 file is being upgraded through a shared group.
    pub fn get_file_format(&self) -> u8 {
        debug_assert!(self.is_attached());
        self.file_format
    }

    /// File-format version in the committed (selected) header slot.
    pub fn get_committed_file_format(&self) -> u8 {
        debug_assert!(!self.data.is_null());
        let buf = unsafe { std::slice::from_raw_parts(self.data, HEADER_SIZE) };
        let header = Header::from_bytes(buf);
        header.file_format[header.select_field()]
    }

    /// Free chunks tracked within the mapped file region.
    pub fn get_free_read_only(&self) -> Result<&[Chunk]> {
        if self.free_space_state == FreeSpaceState::Invalid {
            return Err(Error::InvalidFreeSpace);
        }
        Ok(&self.free_read_only)
    }

    /// Rebuild the free lists after a commit: one chunk per slab, covering
    /// it entirely, and no read-only chunks. No-op when already clean.
    pub fn reset_free_space_tracking(&mut self) -> Result<()> {
        if self.free_space_state == FreeSpaceState::Clean {
            return Ok(());
        }

        // Scratch space is free again once data has been committed to the
        // persistent region.
        self.free_read_only.clear();
        self.free_space.clear();
        self.free_space
            .try_reserve(self.slabs.len())
            .map_err(|_| Error::OutOfMemory("free list".to_string()))?;

        let mut ref_ = self.baseline;
        for i in 0..self.slabs.len() {
            let ref_end = self.slabs[i].ref_end;
            self.free_space.push(Chunk {
                ref_,
                size: ref_end - ref_,
            });
            ref_ = ref_end;
        }

        debug_assert!(self.is_all_free());
        self.free_space_state = FreeSpaceState::Clean;
        Ok(())
    }

    /// Remap the file region after the file has grown to `file_size`.
    ///
    /// Requires a clean free-space state; slabs and their covering free
    /// chunks are rebased past the new baseline. Returns whether the base
    /// address moved (cached pointers must then be invalidated).
    pub fn remap(&mut self, file_size: usize) -> Result<bool> {
        debug_assert!(file_size % 8 == 0);
        debug_assert_eq!(self.free_space_state, FreeSpaceState::Clean);
        debug_assert!(self.baseline <= file_size);

        let old_ptr = self.data;
        let (file, map) = match &mut self.attachment {
            Attachment::File { file, map, .. } => (file, map),
            _ => {
                debug_assert!(false, "remap requires a file attachment");
                return Err(Error::File("Remap requires a file attachment".to_string()));
            }
        };

        // Map the grown region; the old mapping is released on replacement.
        *map = file.map(file_size)?;
        let addr_changed = map.as_ptr() != old_ptr;
        self.data = map.as_ptr();
        self.baseline = file_size;

        // Rebase slabs and free list. Clean state means exactly one free
        // chunk per slab, in slab order.
        debug_assert_eq!(self.slabs.len(), self.free_space.len());
        let mut slab_ref = file_size;
        for i in 0..self.slabs.len() {
            let size = self.free_space[i].size;
            self.free_space[i].ref_ = slab_ref;
            let slab_ref_end = slab_ref + size;
            self.slabs[i].ref_end = slab_ref_end;
            slab_ref = slab_ref_end;
        }

        Ok(addr_changed)
    }

    /// Commit a file on streaming form to header form.
    ///
    /// `mapping` is a writable mapping of at least the baseline region. The
    /// footer's top-ref is copied into header slot 1, made durable, and only
    /// then does the select bit flip; crash recovery on either side of the
    /// flip observes a valid database.
    pub fn prepare_for_update(&mut self, mapping: &mut MmapMut) -> Result<()> {
        assert!(self.file_on_streaming_form);
        assert!(mapping.len() >= self.baseline);

        // The header must still be the canonical streaming header (the
        // file-format and reserved fields are allowed to differ).
        let canonical = Header::streaming();
        let header = Header::from_bytes(&mapping[..HEADER_SIZE]);
        assert_eq!(header.flags, canonical.flags);
        assert_eq!(header.magic, canonical.magic);
        assert_eq!(header.top_ref, canonical.top_ref);

        let footer = StreamingFooter::from_bytes(&mapping[..self.baseline]);
        assert_eq!(footer.magic_cookie, FOOTER_MAGIC_COOKIE);

        mapping[8..16].copy_from_slice(&footer.top_ref.to_le_bytes());
        if !sync_to_disk_disabled() {
            mapping
                .flush()
                .map_err(|e| Error::File(format!("Sync failed: {}", e)))?;
        }
        // Flip the select bit only; the server-sync bit stays put.
        mapping[23] |= FLAGS_SELECT_BIT;

        self.file_on_streaming_form = false;
        Ok(())
    }

    /// Whether the attached file is still on streaming form.
    pub fn is_on_streaming_form(&self) -> bool {
        self.file_on_streaming_form
    }

    /// True iff the mutable free list exactly mirrors the slab chain.
    pub fn is_all_free(&self) -> bool {
        if self.free_space.len() != self.slabs.len() {
            return false;
        }

        let mut slab_ref = self.baseline;
        for slab in &self.slabs {
            let slab_size = slab.ref_end - slab_ref;
            match self.free_space.iter().find(|c| c.ref_ == slab_ref) {
                Some(chunk) if chunk.size == slab_size => {}
                _ => return false,
            }
            slab_ref = slab.ref_end;
        }
        true
    }

    /// Check that every mutable free chunk lies wholly inside one slab.
    ///
    /// # Panics
    ///
    /// Panics on the first violated invariant.
    pub fn verify(&self) {
        for chunk in &self.free_space {
            let i = self.slabs.partition_point(|s| s.ref_end <= chunk.ref_);
            assert!(i < self.slabs.len(), "free chunk outside any slab");
            assert!(
                chunk.ref_ + chunk.size <= self.slabs[i].ref_end,
                "free chunk crosses a slab boundary"
            );
        }
    }
}

impl Default for SlabAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SlabAlloc {
    fn drop(&mut self) {
        // A shared file does not guarantee that all space is free on close,
        // and there is no point checking when tracking is already lost.
        if cfg!(debug_assertions)
            && self.is_attached()
            && !matches!(self.attachment, Attachment::File { shared: true, .. })
            && self.free_space_state != FreeSpaceState::Invalid
            && !self.is_all_free()
        {
            warn!("SlabAlloc dropped with unfreed allocations");
        }
        if self.is_attached() {
            self.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tdb_alloc_{}_{}.tdb", name, std::process::id()))
    }

    fn init_segment(mem: &MemRef, byte_size: usize, capacity: usize) {
        unsafe { segment::init_header(mem.addr, byte_size, capacity) };
    }

    #[test]
    fn test_attach_empty_alloc_sequence() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        let a = alloc.alloc(256)?;
        let b = alloc.alloc(256)?;

        assert_eq!(a.ref_, HEADER_SIZE);
        assert_eq!(b.ref_, HEADER_SIZE + 256);
        assert_ne!(a.addr, b.addr);
        assert_eq!(a.ref_ % 8, 0);
        assert_eq!(b.ref_ % 8, 0);

        // Translation agrees with the returned addresses
        assert_eq!(alloc.translate(a.ref_), a.addr);
        assert_eq!(alloc.translate(b.ref_), b.addr);
        Ok(())
    }

    #[test]
    fn test_geometric_slab_growth() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        alloc.alloc(256)?; // slab 1: exactly the rounded request
        alloc.alloc(256)?; // slab 2: at least twice slab 1
        assert_eq!(alloc.get_total_size(), HEADER_SIZE + 256 + 512);

        // A large request overrides the doubling floor
        alloc.alloc(2048)?;
        let sizes: Vec<usize> = alloc.slabs.iter().map(|s| s.size).collect();
        assert_eq!(sizes, vec![256, 512, 2048]);
        alloc.verify();
        Ok(())
    }

    #[test]
    fn test_request_rounds_up_to_256() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        let a = alloc.alloc(8)?;
        assert_eq!(a.ref_, HEADER_SIZE);
        assert_eq!(alloc.get_total_size(), HEADER_SIZE + 256);
        // The remainder went onto the free list
        assert_eq!(alloc.free_space.len(), 1);
        assert_eq!(
            alloc.free_space[0],
            Chunk {
                ref_: HEADER_SIZE + 8,
                size: 248
            }
        );
        Ok(())
    }

    #[test]
    fn test_reuse_splits_chunk_from_front() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        let a = alloc.alloc(512)?;
        let _b = alloc.alloc(512)?;
        init_segment(&a, 512, 512);
        alloc.free(a.ref_, a.addr as *const u8);

        // The freed chunk is reused from its front, leaving a tail chunk
        let c = alloc.alloc(256)?;
        assert_eq!(c.ref_, a.ref_);
        assert!(alloc
            .free_space
            .iter()
            .any(|ch| ch.ref_ == a.ref_ + 256 && ch.size == 256));

        let d = alloc.alloc(256)?;
        assert_eq!(d.ref_, a.ref_ + 256);
        alloc.verify();
        Ok(())
    }

    #[test]
    fn test_coalesce_within_slab() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        let a = alloc.alloc(240)?; // slab 1 with a 16-byte tail
        let b = alloc.alloc(16)?; // adjacent to a, same slab
        assert_eq!(b.ref_, a.ref_ + 240);
        init_segment(&a, 240, 240);
        init_segment(&b, 16, 16);

        alloc.free(a.ref_, a.addr as *const u8);
        alloc.free(b.ref_, b.addr as *const u8);

        // One slab, one covering chunk
        assert_eq!(alloc.slabs.len(), 1);
        assert_eq!(alloc.free_space.len(), 1);
        assert!(alloc.is_all_free());
        Ok(())
    }

    #[test]
    fn test_no_coalescing_across_slab_boundary() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        let a = alloc.alloc(512)?; // slab 1: [24, 536), fully used
        let b = alloc.alloc(512)?; // slab 2: [536, 1560) with a 512-byte tail
        assert_eq!(b.ref_, a.ref_ + 512);
        init_segment(&a, 512, 512);
        init_segment(&b, 512, 512);

        // b merges with the tail chunk of its own slab
        alloc.free(b.ref_, b.addr as *const u8);
        assert_eq!(alloc.free_space.len(), 1);

        // a ends exactly at the slab border; no merge with slab 2's chunk
        alloc.free(a.ref_, a.addr as *const u8);
        assert_eq!(alloc.free_space.len(), 2);
        assert!(alloc.is_all_free());
        alloc.verify();
        Ok(())
    }

    #[test]
    fn test_free_round_trip_and_reset() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        let m = alloc.alloc(64)?;
        init_segment(&m, 64, 64);
        alloc.free(m.ref_, m.addr as *const u8);

        alloc.reset_free_space_tracking()?;
        assert!(alloc.is_all_free());

        // Idempotent
        alloc.reset_free_space_tracking()?;
        assert!(alloc.is_all_free());
        assert_eq!(alloc.free_space_state, FreeSpaceState::Clean);
        Ok(())
    }

    #[test]
    fn test_reset_rebuilds_one_chunk_per_slab() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        // Fragment the free list across three slabs
        for _ in 0..6 {
            alloc.alloc(264)?;
        }
        alloc.reset_free_space_tracking()?;

        assert_eq!(alloc.free_space.len(), alloc.slabs.len());
        assert!(alloc.is_all_free());

        let mut expected_ref = alloc.get_baseline();
        for (chunk, slab) in alloc.free_space.iter().zip(&alloc.slabs) {
            assert_eq!(chunk.ref_, expected_ref);
            assert_eq!(chunk.ref_ + chunk.size, slab.ref_end);
            expected_ref = slab.ref_end;
        }
        Ok(())
    }

    #[test]
    fn test_realloc_preserves_contents() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        let a = alloc.alloc(16)?;
        init_segment(&a, 16, 16);
        unsafe {
            for i in segment::SEGMENT_HEADER_SIZE..16 {
                *a.addr.add(i) = i as u8;
            }
        }

        let b = alloc.realloc(a.ref_, a.addr as *const u8, 16, 32)?;
        assert_ne!(b.ref_, a.ref_);
        unsafe {
            assert_eq!(segment::byte_size_from_header(b.addr), 16);
            for i in segment::SEGMENT_HEADER_SIZE..16 {
                assert_eq!(*b.addr.add(i), i as u8);
            }
        }
        Ok(())
    }

    #[test]
    fn test_alloc_requires_reset_after_file_attach() -> Result<()> {
        let path = temp_db_path("fresh");
        std::fs::remove_file(&path).ok();

        let mut alloc = SlabAlloc::new();
        let top_ref = alloc.attach_file(&path, AttachOptions::new())?;
        assert_eq!(top_ref, 0);
        assert_eq!(alloc.get_baseline(), 4096);

        // Free-space tracking starts out invalid
        match alloc.alloc(64) {
            Err(Error::InvalidFreeSpace) => {}
            other => panic!("Expected InvalidFreeSpace, got {:?}", other.map(|_| ())),
        }
        assert!(alloc.get_free_read_only().is_err());

        alloc.reset_free_space_tracking()?;
        let m = alloc.alloc(64)?;
        assert_eq!(m.ref_, 4096);

        // Cleanup
        drop(alloc);
        std::fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    #[should_panic]
    fn test_double_attach_is_rejected() {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();
        alloc.attach_empty();
    }

    #[test]
    fn test_detach_then_reattach() -> Result<()> {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();
        alloc.alloc(256)?;

        alloc.detach();
        assert!(!alloc.is_attached());

        alloc.attach_empty();
        let m = alloc.alloc(256)?;
        assert_eq!(m.ref_, HEADER_SIZE);
        Ok(())
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn test_unaligned_alloc_asserts() {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();
        let _ = alloc.alloc(12);
    }
}

//! Slab Allocator
//!
//! Translates opaque refs into addresses across a unified reference space:
//! the memory-mapped database file below the baseline, heap-backed slabs
//! above it. Uncommitted writes always land in slabs; a commit cycle
//! persists them into the file and resets free-space tracking.
//!
//! # Architecture
//!
//! ```text
//! SlabAlloc
//!   ├─→ mapped file   [0 ...... baseline)      read-only
//!   ├─→ slab 1        [baseline .. end1)       heap, zero-filled
//!   ├─→ slab 2        [end1 ..... end2)        ≥ 2 × slab 1
//!   └─→ slab 3        [end2 ..... end3)        ≥ 2 × slab 2
//!
//! Free space
//!   ├─→ mutable list    chunks inside slabs, feeds alloc()
//!   └─→ read-only list  chunks inside the file, bookkeeping only
//! ```
//!
//! Free chunks never cross a slab boundary, so every slab remains an
//! independently releasable unit. The file header carries two top-ref
//! slots selected by a flag bit; commits write the inactive slot, sync,
//! then flip the bit.

pub mod allocator;
pub mod bench;
pub mod format;
pub mod segment;

pub use allocator::{AttachOptions, Chunk, MemRef, Ref, SlabAlloc};
pub use format::{
    validate_buffer, Header, StreamingFooter, ValidatedBuffer, CURRENT_FILE_FORMAT, FOOTER_SIZE,
    HEADER_SIZE,
};
pub use segment::SEGMENT_HEADER_SIZE;

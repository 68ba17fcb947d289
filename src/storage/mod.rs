//! Storage layer
//!
//! # Architecture
//!
//! TDB stores all persistent data in a single database file. The file is
//! mapped read-only into the process; uncommitted modifications live in
//! heap-backed slabs appended past the end of the mapped region:
//!
//! ```text
//! Reference space (byte offsets, always 8-aligned)
//!   [0 .. baseline)          → memory-mapped file (read-only)
//!   [baseline .. total_size) → slab chain (mutable, heap-owned)
//! ```
//!
//! ## Components
//!
//! - **Slab allocator** (`slab`): translates references to addresses,
//!   allocates and frees space, tracks free chunks, validates and upgrades
//!   the on-disk format.
//! - **File object** (`file`): open/map/remap/sync primitives over the
//!   database file, built on `memmap2`.
//!
//! A commit cycle persists mutable content into the file (outside this
//! layer), grows the mapping with `remap`, and calls
//! `reset_free_space_tracking` to start the next cycle from a clean slate.

pub mod file;
pub mod slab;

pub use file::{disable_sync_to_disk, AccessMode, CreateMode, File};
pub use slab::{AttachOptions, Chunk, MemRef, Ref, SlabAlloc};

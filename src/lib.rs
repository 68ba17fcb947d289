// TDB - An embedded, file-backed object database
// Core storage layer: slab allocation over a memory-mapped database file

#![warn(rust_2018_idioms)]

pub mod storage;

// Re-exports for convenience
pub use storage::slab::{AttachOptions, MemRef, SlabAlloc};

/// TDB error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid database: {0}")]
        InvalidDatabase(String),

        #[error("Free space tracking was lost due to out-of-memory")]
        InvalidFreeSpace,

        #[error("Decryption failed: {0}")]
        DecryptionFailed(String),

        #[error("Out of memory: {0}")]
        OutOfMemory(String),

        #[error("File error: {0}")]
        File(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! renpak Core Library
//!
//! This library provides the RPA-3.0 container codec (reader and writer)
//! and the manifest format that maps original asset names to their
//! compressed locations.

pub mod container;
pub mod manifest;

pub use container::{RpaEntry, RpaIndex, RpaReader, RpaWriter};
pub use manifest::{Manifest, ManifestTarget, MANIFEST_NAME};

/// Result type for renpak-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for renpak-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad RPA-3.0 header: {0}")]
    BadHeader(String),

    #[error("short read for {name}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        name: String,
        wanted: u64,
        got: u64,
    },

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("duplicate entry name: {0}")]
    DuplicateEntry(String),
}

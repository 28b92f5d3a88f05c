//! renpak Build Library
//!
//! The build pipeline: classifies an archive index into encodable images and
//! passthrough entries, clusters numbered runs into sequence groups, drives a
//! memory-budgeted worker pool that encodes AVIS sequences and scatter AVIF
//! images, and emits the output archive with its manifest.

pub mod classify;
pub mod codec;
pub mod group;
pub mod memory;
pub mod progress;
pub mod scheduler;

pub use classify::ImageClassifier;
pub use codec::Codec;
pub use group::{group_by_prefix, SEQUENCE_THRESHOLD};
pub use progress::{NullSink, Phase, ProgressEvent, ProgressSink};
pub use scheduler::{BuildOptions, BuildReport, Builder};

use std::path::PathBuf;

/// Result type for renpak-build operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for renpak-build operations
///
/// Per-image encoder failures never surface here; they are recovered inside
/// the scheduler (AVIS → AVIF fallback, AVIF → verbatim copy) and reported
/// through the progress sink.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}: {source}", path.display())]
    Archive {
        path: PathBuf,
        source: renpak_core::Error,
    },

    #[error("writing {}: {source}", path.display())]
    Output {
        path: PathBuf,
        source: renpak_core::Error,
    },

    #[error("build cancelled")]
    Cancelled,
}

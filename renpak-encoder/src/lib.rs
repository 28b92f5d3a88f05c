//! renpak Encoder Library
//!
//! AV1 encoder facade: single-image AVIF via the pure-Rust ravif encoder,
//! multi-frame AVIS sequences via FFmpeg's AV1 encoders. The build pipeline
//! consumes this through the [`Av1Encoder`] capability object.

pub mod avif;
pub mod avis;
pub mod capability;

pub use avif::decode_rgba;
pub use capability::Av1Encoder;

/// Result type for renpak-encoder operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for renpak-encoder operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("frame {frame} has size {got_w}x{got_h}, expected {want_w}x{want_h}")]
    DimensionMismatch {
        frame: usize,
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },

    #[error("no frames to encode")]
    NoFrames,

    #[error("no AV1 sequence backend available (tried libsvtav1, libaom-av1, librav1e)")]
    AvisUnavailable,
}

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Quality 1-63; lower = smaller file, more loss
    pub quality: u8,
    /// Encoding speed 0-10; higher = faster, slightly larger
    pub speed: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality: 50,
            speed: 6,
        }
    }
}

/// Maps spec quality (1-63, higher = better) to ravif's 1-100 scale.
pub(crate) fn ravif_quality(quality: u8) -> f32 {
    f32::from(quality.clamp(1, 63)) * 100.0 / 63.0
}

/// Maps spec quality (1-63, higher = better) to an AV1 CRF (0-63, lower = better).
pub(crate) fn ffmpeg_crf(quality: u8) -> i32 {
    63 - i32::from(quality.clamp(1, 63))
}

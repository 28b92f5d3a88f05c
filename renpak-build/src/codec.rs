//! The seam between the scheduler and the AV1 backend

use image::RgbaImage;
use renpak_encoder::{Av1Encoder, Error as EncodeError};

/// Encoding capability consumed by the build scheduler.
///
/// [`Av1Encoder`] is the production implementation; scheduler tests
/// substitute a deterministic fake.
pub trait Codec: Send + Sync {
    /// Whether multi-frame AVIS encoding is usable in this process.
    fn avis_available(&self) -> bool;

    /// Encodes raw image bytes as a single-image AVIF.
    fn encode_avif(&self, data: &[u8]) -> Result<Vec<u8>, EncodeError>;

    /// Encodes equal-size RGBA frames as an AVIS sequence.
    fn encode_avis(
        &self,
        frames: &[RgbaImage],
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, EncodeError>;
}

impl Codec for Av1Encoder {
    fn avis_available(&self) -> bool {
        Av1Encoder::avis_available(self)
    }

    fn encode_avif(&self, data: &[u8]) -> Result<Vec<u8>, EncodeError> {
        Av1Encoder::encode_avif(self, data)
    }

    fn encode_avis(
        &self,
        frames: &[RgbaImage],
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, EncodeError> {
        Av1Encoder::encode_avis(self, frames, width, height)
    }
}

//! The AV1 capability object consumed by the build pipeline
//!
//! Bundles the encoder configuration with the result of probing the AVIS
//! backend once, up front. The build scheduler receives this object at
//! construction instead of reaching for any global encoder state; when the
//! probe fails, every sequence group is dissolved to scatter AVIF before
//! work starts.

use crate::{avif, avis, EncoderConfig, Error, Result};
use image::RgbaImage;

/// AV1 encoder facade with probed capabilities.
#[derive(Debug, Clone)]
pub struct Av1Encoder {
    config: EncoderConfig,
    avis_backend: Option<&'static str>,
}

impl Av1Encoder {
    /// Probes the FFmpeg AV1 backends and builds the facade.
    pub fn probe(config: EncoderConfig) -> Self {
        Self {
            avis_backend: avis::probe_backend(),
            config,
        }
    }

    /// Facade with AVIS disabled; sequences always fall back to AVIF.
    pub fn without_avis(config: EncoderConfig) -> Self {
        Self {
            avis_backend: None,
            config,
        }
    }

    /// Whether multi-frame AVIS encoding is usable in this process.
    pub fn avis_available(&self) -> bool {
        self.avis_backend.is_some()
    }

    /// Name of the probed AV1 sequence backend, if any.
    pub fn avis_backend(&self) -> Option<&'static str> {
        self.avis_backend
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encodes raw image bytes as a single-image AVIF.
    pub fn encode_avif(&self, data: &[u8]) -> Result<Vec<u8>> {
        avif::encode_avif(data, &self.config)
    }

    /// Encodes equal-size RGBA frames as an AVIS sequence.
    pub fn encode_avis(&self, frames: &[RgbaImage], width: u32, height: u32) -> Result<Vec<u8>> {
        if self.avis_backend.is_none() {
            return Err(Error::AvisUnavailable);
        }
        avis::encode_avis(frames, width, height, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_avis_rejects_sequences() {
        let encoder = Av1Encoder::without_avis(EncoderConfig::default());
        assert!(!encoder.avis_available());
        let err = encoder
            .encode_avis(&[RgbaImage::new(64, 64)], 64, 64)
            .unwrap_err();
        assert!(matches!(err, Error::AvisUnavailable));
    }
}

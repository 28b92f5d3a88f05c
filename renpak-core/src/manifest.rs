//! Manifest format shared with the host runtime
//!
//! The manifest maps lowercased original asset names to their compressed
//! locations and is embedded in the output archive under [`MANIFEST_NAME`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known archive entry name of the embedded manifest.
pub const MANIFEST_NAME: &str = "renpak_manifest.json";

/// Where a compressed asset ended up.
///
/// Serializes as either a bare string (the AVIF target name) or an object
/// `{"avis": "<sequence>", "frame": N}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestTarget {
    Avif(String),
    Sequence { avis: String, frame: u32 },
}

/// Accumulates the original-name → target mapping during a build.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestTarget>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a scatter-AVIF mapping. Keys are stored lowercase so the
    /// runtime can look names up case-insensitively.
    pub fn insert_avif(&mut self, original: &str, target: &str) {
        self.entries
            .insert(original.to_lowercase(), ManifestTarget::Avif(target.to_string()));
    }

    /// Records one frame of an AVIS sequence.
    pub fn insert_sequence_frame(&mut self, original: &str, sequence: &str, frame: u32) {
        self.entries.insert(
            original.to_lowercase(),
            ManifestTarget::Sequence {
                avis: sequence.to_string(),
                frame,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ManifestTarget> {
        self.entries.get(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ManifestTarget)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compact UTF-8 JSON, ready to embed in the archive.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

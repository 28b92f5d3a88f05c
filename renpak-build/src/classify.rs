//! Image classification from entry names

/// Default encodable image suffixes.
pub const IMAGE_SUFFIXES: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".bmp"];

/// Default name prefixes excluded from encoding. GUI atlases are resolved by
/// pixel position at runtime and must stay byte-identical.
pub const SKIP_PREFIXES: &[&str] = &["gui/"];

/// Decides, from a file name alone, whether an entry is an encodable image.
///
/// Suffix comparison is case-insensitive; the skip-prefix check is a
/// byte-exact match on the original (case-preserving) name.
#[derive(Debug, Clone)]
pub struct ImageClassifier {
    suffixes: Vec<String>,
    skip_prefixes: Vec<String>,
}

impl Default for ImageClassifier {
    fn default() -> Self {
        Self::new(
            IMAGE_SUFFIXES.iter().map(|s| s.to_string()),
            SKIP_PREFIXES.iter().map(|s| s.to_string()),
        )
    }
}

impl ImageClassifier {
    pub fn new(
        suffixes: impl IntoIterator<Item = String>,
        skip_prefixes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            suffixes: suffixes.into_iter().map(|s| s.to_lowercase()).collect(),
            skip_prefixes: skip_prefixes.into_iter().collect(),
        }
    }

    /// Whether the name carries a recognized image suffix.
    pub fn is_image(&self, name: &str) -> bool {
        match suffix_of(name) {
            Some(suffix) => self.suffixes.iter().any(|s| *s == suffix),
            None => false,
        }
    }

    /// Whether the entry should be AVIF-encoded (image and not skipped).
    pub fn should_encode(&self, name: &str) -> bool {
        self.is_image(name) && !self.skip_prefixes.iter().any(|p| name.starts_with(p))
    }
}

/// Case-folded suffix of the final path component, dot included.
/// Dotfiles and extension-less names have no suffix.
fn suffix_of(name: &str) -> Option<String> {
    let file = name.rsplit('/').next().unwrap_or(name);
    let dot = file.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some(file[dot..].to_lowercase())
}

//! SMS text normalization.
//!
//! The vocabulary is fitted on normalized text, so the exact character class
//! below is part of the model contract: changing it silently degrades every
//! previously trained model.

use std::sync::LazyLock;

use regex::Regex;

/// Anything that starts with `http` up to the next whitespace. The file,
/// group, record and unit separators (U+001C..U+001F) end a URL too, which
/// is how every trained vocabulary saw them.
const URL_PATTERN: &str = r"http[^\s\x1c-\x1f]+";

/// Everything outside lowercase Latin/Turkish letters, digits and a space.
const DISALLOWED_PATTERN: &str = r"[^a-zçğıöşü0-9 ]";

static NORMALIZER: LazyLock<Normalizer> = LazyLock::new(Normalizer::new);

/// Normalizes a message with the shared [`Normalizer`].
pub fn normalize(text: &str) -> String {
    NORMALIZER.normalize(text)
}

/// Lower-cases the text, strips URLs and drops disallowed characters.
#[derive(Debug, Clone)]
pub struct Normalizer {
    url: Regex,
    disallowed: Regex,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    /// Compiles the normalization patterns.
    pub fn new() -> Self {
        Self {
            url: Regex::new(URL_PATTERN).expect("URL pattern is valid"),
            disallowed: Regex::new(DISALLOWED_PATTERN).expect("Character class is valid"),
        }
    }

    /// Normalizes the text. Never fails, the output might be empty.
    pub fn normalize(&self, text: &str) -> String {
        let lowercase = text.to_lowercase();
        let without_urls = self.url.replace_all(&lowercase, "");
        let filtered = self.disallowed.replace_all(&without_urls, "");
        // Dropping characters may glue a new "http..." run together
        // ("h!ttpx"), strip it as well so that the output is a fixed point.
        self.url.replace_all(&filtered, "").into_owned()
    }
}

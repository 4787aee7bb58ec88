//! Control-character filter.
//!
//! NFKC-normalizes text and deletes every code point whose general category
//! is `C*` (control, format, surrogate, private use, unassigned). The external
//! tools downstream are line oriented and misbehave on embedded control bytes.

use crate::chain::TextStage;
use crate::error::Result;
use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

static OTHER_CATEGORY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\p{C}+").unwrap());

/// Stage that normalizes and strips non-printing characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCharFilter;

impl ControlCharFilter {
    pub fn new() -> Self {
        LazyLock::force(&OTHER_CATEGORY);
        Self
    }
}

impl TextStage for ControlCharFilter {
    fn name(&self) -> &str {
        "clean"
    }

    fn run(&self, text: &str) -> Result<String> {
        Ok(clean(text))
    }
}

/// Applies NFKC and removes category-C code points.
pub fn clean(text: &str) -> String {
    let normalized: String = text.nfkc().collect();
    OTHER_CATEGORY.replace_all(&normalized, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removes_control_and_format() {
        let result = clean("a\u{0000}b\u{200B}c");
        assert_eq!(result, "abc");
        assert!(!result.chars().any(|c| c.is_control()));
    }

    #[test]
    fn test_removes_newlines_and_tabs() {
        // Line breaks are Cc as well; each request is a single line downstream
        assert_eq!(clean("one\ntwo\tthree\r"), "onetwothree");
    }

    #[test]
    fn test_removes_private_use_and_bom() {
        assert_eq!(clean("\u{FEFF}text\u{E000}end"), "textend");
    }

    #[test]
    fn test_nfkc_applied() {
        // Fullwidth letters, ligatures and NBSP fold to their compatibility forms
        assert_eq!(clean("ＡＢＣ"), "ABC");
        assert_eq!(clean("ﬁne"), "fine");
        assert_eq!(clean("a\u{A0}b"), "a b");
    }

    #[test]
    fn test_korean_composed() {
        // Conjoining jamo compose into a syllable
        assert_eq!(clean("\u{1100}\u{1161}"), "가");
    }

    #[test]
    fn test_clean_is_idempotent() {
        let once = clean("Ｈｅｌｌｏ\u{7F}\u{2060}世界");
        assert_eq!(clean(&once), once);
        assert_eq!(once, "Hello世界");
    }
}

//! Script segmenter for languages written without inter-word spaces.
//!
//! Every code point of the target script is surrounded by spaces so the
//! generic tokenizer sees one unit per character. Runs of other scripts
//! (Latin words, digits) stay contiguous. A boundary is only inserted where
//! no whitespace exists yet; whitespace already in the line is left as it is,
//! apart from trimming both ends.

use crate::chain::TextStage;
use crate::error::Result;
use regex::Regex;
use std::sync::LazyLock;

/// Han ideographs plus CJK symbols/punctuation, radicals supplement and compatibility blocks.
static HAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\p{Han}\x{3000}-\x{303F}\x{2E80}-\x{2EFF}\x{3300}-\x{33FF}\x{F900}-\x{FAFF}])")
        .unwrap()
});

/// Precomposed Hangul syllables.
static HANGUL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([\x{AC00}-\x{D7A3}])").unwrap());

/// Scripts the segmenter knows how to split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Han,
    Hangul,
}

impl Script {
    fn pattern(self) -> &'static Regex {
        match self {
            Script::Han => LazyLock::force(&HAN),
            Script::Hangul => LazyLock::force(&HANGUL),
        }
    }
}

/// Stage that spaces out every character of one script.
#[derive(Debug, Clone, Copy)]
pub struct ScriptSegmenter {
    script: Script,
    pattern: &'static Regex,
}

impl ScriptSegmenter {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            pattern: script.pattern(),
        }
    }

    pub fn script(&self) -> Script {
        self.script
    }

    /// Inserts single-space boundaries around each character of the script.
    pub fn segment(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() * 2);
        let mut last = 0;
        for unit in self.pattern.find_iter(text) {
            push_separated(&mut out, &text[last..unit.start()], last > 0);
            push_separated(&mut out, unit.as_str(), true);
            last = unit.end();
        }
        push_separated(&mut out, &text[last..], last > 0);
        out.trim().to_string()
    }
}

/// Appends `piece`, first adding a space if `boundary` is set and neither
/// side of the join is already whitespace.
fn push_separated(out: &mut String, piece: &str, boundary: bool) {
    if piece.is_empty() {
        return;
    }
    if boundary
        && !out.is_empty()
        && !out.ends_with(char::is_whitespace)
        && !piece.starts_with(char::is_whitespace)
    {
        out.push(' ');
    }
    out.push_str(piece);
}

impl TextStage for ScriptSegmenter {
    fn name(&self) -> &str {
        match self.script {
            Script::Han => "segment-han",
            Script::Hangul => "segment-hangul",
        }
    }

    fn run(&self, text: &str) -> Result<String> {
        Ok(self.segment(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chinese_mixed_with_latin() {
        let seg = ScriptSegmenter::new(Script::Han);
        assert_eq!(seg.segment("我爱NLP"), "我 爱 NLP");
    }

    #[test]
    fn test_chinese_punctuation_split() {
        let seg = ScriptSegmenter::new(Script::Han);
        assert_eq!(seg.segment("你好，世界。"), "你 好 ， 世 界 。");
    }

    #[test]
    fn test_chinese_radical_and_compat() {
        let seg = ScriptSegmenter::new(Script::Han);
        // U+2E80 radical, U+3300 square katakana, U+F900 compatibility ideograph
        assert_eq!(seg.segment("a\u{2E80}\u{3300}\u{F900}b"), "a \u{2E80} \u{3300} \u{F900} b");
    }

    #[test]
    fn test_korean_syllables() {
        let seg = ScriptSegmenter::new(Script::Hangul);
        assert_eq!(seg.segment("한국어 text"), "한 국 어 text");
        // Han characters are left alone by the Hangul segmenter
        assert_eq!(seg.segment("漢字"), "漢字");
    }

    #[test]
    fn test_existing_spaces_kept() {
        let seg = ScriptSegmenter::new(Script::Hangul);
        assert_eq!(seg.segment("  안녕   하세요  "), "안 녕   하 세 요");
        // Runs away from any inserted boundary are untouched too
        assert_eq!(seg.segment("a  b 한"), "a  b 한");
        assert_eq!(seg.segment("x\t한y"), "x\t한 y");
    }

    #[test]
    fn test_empty_and_latin_only() {
        let seg = ScriptSegmenter::new(Script::Han);
        assert_eq!(seg.segment(""), "");
        assert_eq!(seg.segment("plain latin text"), "plain latin text");
        assert_eq!(seg.name(), "segment-han");
    }
}

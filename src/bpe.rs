//! # Subword Encoding
//!
//! Byte-pair encoding with a pre-trained, ordered merge table, and its
//! inverse.
//!
//! ## Merge table format
//!
//! One merge per line, two symbols separated by a single space, most frequent
//! first. An optional first line `#version: 0.2` selects the newer end-of-word
//! convention where the word-final marker `</w>` is attached to the last
//! character instead of being a symbol of its own.
//!
//! ```text
//! #version: 0.2
//! l o
//! lo w
//! e r</w>
//! ```

use crate::chain::TextStage;
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Word-final marker used inside the merge table.
pub const END_OF_WORD: &str = "</w>";

/// Default continuation marker appended to every non-final subword unit.
pub const DEFAULT_SEPARATOR: &str = "@@";

static DEFAULT_DEBPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@@( |$)").unwrap());

/// End-of-word convention of a merge table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableVersion {
    /// `</w>` is a separate trailing symbol.
    V0_1,
    /// `</w>` is fused onto the final character.
    V0_2,
}

/// Ordered symbol-pair merges.
#[derive(Debug, Clone)]
pub struct MergeTable {
    version: TableVersion,
    /// left symbol -> right symbol -> rank (lower merges first)
    ranks: HashMap<String, HashMap<String, usize>>,
    len: usize,
}

impl MergeTable {
    /// Loads a merge table from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::resource(path, format!("cannot read merge table: {e}")))?;
        Self::parse(&content).map_err(|message| Error::resource(path, message))
    }

    /// Parses merge-table text. On failure returns a description of the bad line.
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut lines = content.lines().enumerate().peekable();

        let version = match lines.peek() {
            Some((_, first)) if first.starts_with("#version:") => {
                let version = parse_version(first)?;
                lines.next();
                version
            }
            _ => TableVersion::V0_1,
        };

        let mut ranks: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut len = 0;
        for (index, line) in lines {
            let line = line.trim_matches(|c| c == '\r' || c == '\n' || c == ' ');
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split(' ');
            let (Some(left), Some(right), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(format!("invalid line {}: {line:?}", index + 1));
            };
            // Duplicate pairs keep their first (lowest) rank
            ranks
                .entry(left.to_string())
                .or_default()
                .entry(right.to_string())
                .or_insert(len);
            len += 1;
        }

        Ok(Self {
            version,
            ranks,
            len,
        })
    }

    /// Number of merge rules.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn version(&self) -> TableVersion {
        self.version
    }

    /// Returns the rank of a pair, if it is a merge rule.
    pub fn rank(&self, left: &str, right: &str) -> Option<usize> {
        self.ranks.get(left)?.get(right).copied()
    }

    /// Splits one word into subword units, without continuation markers.
    pub fn encode_word(&self, word: &str) -> Vec<String> {
        let chars: Vec<char> = word.chars().collect();
        let Some((last, init)) = chars.split_last() else {
            return Vec::new();
        };

        let mut symbols: Vec<String> = init.iter().map(|c| c.to_string()).collect();
        match self.version {
            TableVersion::V0_1 => {
                symbols.push(last.to_string());
                symbols.push(END_OF_WORD.to_string());
            }
            TableVersion::V0_2 => symbols.push(format!("{last}{END_OF_WORD}")),
        }

        while symbols.len() > 1 {
            let best = symbols
                .windows(2)
                .filter_map(|pair| self.rank(&pair[0], &pair[1]))
                .min();
            let Some(best) = best else {
                break;
            };
            symbols = self.merge_all(symbols, best);
        }

        if symbols.last().is_some_and(|s| s == END_OF_WORD) {
            symbols.pop();
        } else if let Some(last) = symbols.last_mut() {
            if let Some(stripped) = last.strip_suffix(END_OF_WORD) {
                *last = stripped.to_string();
            }
        }
        symbols
    }

    /// Merges every non-overlapping occurrence of the pair with rank `rank`, left to right.
    fn merge_all(&self, symbols: Vec<String>, rank: usize) -> Vec<String> {
        let mut merged = Vec::with_capacity(symbols.len());
        let mut iter = symbols.into_iter().peekable();
        while let Some(current) = iter.next() {
            let matches = iter
                .peek()
                .is_some_and(|next| self.rank(&current, next) == Some(rank));
            if matches {
                if let Some(next) = iter.next() {
                    merged.push(current + &next);
                    continue;
                }
            }
            merged.push(current);
        }
        merged
    }
}

fn parse_version(line: &str) -> std::result::Result<TableVersion, String> {
    let value = line.trim_start_matches("#version:").trim();
    match value {
        "0.1" => Ok(TableVersion::V0_1),
        "0.2" => Ok(TableVersion::V0_2),
        other => Err(format!("unsupported merge table version {other:?}")),
    }
}

/// Stage that applies a merge table to every whitespace token.
#[derive(Debug, Clone)]
pub struct BpeEncoder {
    table: MergeTable,
    separator: String,
}

impl BpeEncoder {
    pub fn new(table: MergeTable) -> Self {
        Self::with_separator(table, DEFAULT_SEPARATOR)
    }

    pub fn with_separator(table: MergeTable, separator: impl Into<String>) -> Self {
        Self {
            table,
            separator: separator.into(),
        }
    }

    /// Loads the merge table at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(MergeTable::from_file(path)?))
    }

    pub fn table(&self) -> &MergeTable {
        &self.table
    }

    /// Encodes a line, keeping its leading and trailing whitespace.
    pub fn encode(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let is_edge = |c: char| c == '\r' || c == '\n' || c == ' ';
        let body = text.trim_matches(is_edge);
        if body.is_empty() {
            return text.to_string();
        }
        let leading = &text[..text.len() - text.trim_start_matches(is_edge).len()];
        let trailing = &text[text.trim_end_matches(is_edge).len()..];

        let mut units: Vec<String> = Vec::new();
        for word in body.split(' ').filter(|w| !w.is_empty()) {
            let pieces = self.table.encode_word(word);
            let count = pieces.len();
            for (i, piece) in pieces.into_iter().enumerate() {
                if i + 1 < count {
                    units.push(piece + &self.separator);
                } else {
                    units.push(piece);
                }
            }
        }

        format!("{leading}{}{trailing}", units.join(" "))
    }
}

impl TextStage for BpeEncoder {
    fn name(&self) -> &str {
        "bpe"
    }

    fn run(&self, text: &str) -> Result<String> {
        Ok(self.encode(text))
    }
}

/// Stage that removes continuation markers.
#[derive(Debug, Clone)]
pub struct BpeDecoder {
    pattern: Regex,
}

impl Default for BpeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BpeDecoder {
    /// Decoder for the default `@@` marker.
    pub fn new() -> Self {
        Self {
            pattern: DEFAULT_DEBPE.clone(),
        }
    }

    /// Decoder for a custom marker.
    pub fn with_separator(separator: &str) -> Result<Self> {
        let pattern = Regex::new(&format!("{}( |$)", regex::escape(separator)))?;
        Ok(Self { pattern })
    }

    /// Removes every marker followed by a space or the end of text, then trims.
    pub fn decode(&self, text: &str) -> String {
        self.pattern.replace_all(text, "").trim().to_string()
    }
}

impl TextStage for BpeDecoder {
    fn name(&self) -> &str {
        "debpe"
    }

    fn run(&self, text: &str) -> Result<String> {
        Ok(self.decode(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODES_V2: &str = "#version: 0.2\nl o\nlo w\ne r</w>\n";

    fn encoder() -> BpeEncoder {
        BpeEncoder::new(MergeTable::parse(CODES_V2).unwrap())
    }

    #[test]
    fn test_parse_version_and_len() {
        let table = MergeTable::parse(CODES_V2).unwrap();
        assert_eq!(table.version(), TableVersion::V0_2);
        assert_eq!(table.len(), 3);
        assert_eq!(table.rank("l", "o"), Some(0));
        assert_eq!(table.rank("e", "r</w>"), Some(2));
        assert_eq!(table.rank("o", "w"), None);
    }

    #[test]
    fn test_parse_invalid_line() {
        let err = MergeTable::parse("a b\nc d e\n").unwrap_err();
        assert!(err.contains("line 2"));
        assert!(MergeTable::parse("#version: 9.9\n").is_err());
    }

    #[test]
    fn test_duplicate_pair_keeps_first_rank() {
        let table = MergeTable::parse("a b\nc d\na b\n").unwrap();
        assert_eq!(table.rank("a", "b"), Some(0));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_encode_word_v2() {
        let table = MergeTable::parse(CODES_V2).unwrap();
        assert_eq!(table.encode_word("lower"), vec!["low", "er"]);
        assert_eq!(table.encode_word("lowest"), vec!["low", "e", "s", "t"]);
        assert!(table.encode_word("").is_empty());
    }

    #[test]
    fn test_encode_word_v1() {
        let table = MergeTable::parse("l o\nlo w\nlow </w>\n").unwrap();
        assert_eq!(table.version(), TableVersion::V0_1);
        assert_eq!(table.encode_word("low"), vec!["low"]);
        assert_eq!(table.encode_word("lo"), vec!["lo"]);
    }

    #[test]
    fn test_overlapping_pairs_merge_left_to_right() {
        let table = MergeTable::parse("#version: 0.2\na a\n").unwrap();
        // a a a</w>: only the first pair merges, the final symbol carries </w>
        assert_eq!(table.encode_word("aaa"), vec!["aa", "a"]);
    }

    #[test]
    fn test_encode_line() {
        let bpe = encoder();
        assert_eq!(bpe.encode("the lower  lowest "), "t@@ h@@ e low@@ er low@@ e@@ s@@ t ");
        assert_eq!(bpe.encode(""), "");
        assert_eq!(bpe.encode("  "), "  ");
    }

    #[test]
    fn test_round_trip_words() {
        let bpe = encoder();
        let debpe = BpeDecoder::new();
        for word in ["lower", "lowest", "low", "flow", "l", "éclair", "낮은"] {
            assert_eq!(debpe.decode(&bpe.encode(word)), word);
        }
        let line = "slower flowers lower";
        assert_eq!(debpe.decode(&bpe.encode(line)), line);
    }

    #[test]
    fn test_decoder_marker_positions() {
        let debpe = BpeDecoder::new();
        assert_eq!(debpe.decode("a@@ b@@"), "ab");
        assert_eq!(debpe.decode(" x@@y "), "x@@y");
    }

    #[test]
    fn test_custom_separator() {
        let table = MergeTable::parse(CODES_V2).unwrap();
        let bpe = BpeEncoder::with_separator(table, "￭");
        assert_eq!(bpe.encode("lower"), "low￭ er");
        let debpe = BpeDecoder::with_separator("￭").unwrap();
        assert_eq!(debpe.decode("low￭ er"), "lower");
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = BpeEncoder::from_file(dir.path().join("bpe-codes.txt")).unwrap_err();
        assert!(matches!(err, Error::ResourceLoad { .. }));
    }

    #[test]
    fn test_from_file_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bpe-codes.txt");
        std::fs::write(&path, "a b c\n").unwrap();
        let err = BpeEncoder::from_file(&path).unwrap_err();
        assert!(matches!(err, Error::ResourceLoad { .. }));
    }
}

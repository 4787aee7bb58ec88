//! # Entity Canonicalizer
//!
//! Repairs single- and double-escaped HTML character references and decodes
//! them to literal Unicode.
//!
//! ## Passes
//!
//! 1. Collapse double escapes (`&amp;lt;`, `&amp;#60;`, `&amp;#x3c;`) to single escapes
//! 2. Canonicalize single escapes with stray spaces (`& lt ;` -> `&lt;`)
//! 3. Delete soft hyphens together with one adjacent space on each side
//! 4. Decode character references
//! 5. Collapse malformed non-breaking-space renderings to a space
//!
//! The passes repeat until the text stops changing, so arbitrarily deep
//! escaping collapses and `unescape` is idempotent.

use crate::chain::TextStage;
use crate::error::Result;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Longest name the decoder will look at, as in the HTML5 tokenizer.
const MAX_NAME_LEN: usize = 32;

/// Legacy names the HTML5 parser also accepts without a terminating `;`.
const LEGACY_NAMES: &[&str] = &[
    "AElig", "AMP", "Aacute", "Acirc", "Agrave", "Aring", "Atilde", "Auml", "COPY", "Ccedil",
    "ETH", "Eacute", "Ecirc", "Egrave", "Euml", "GT", "Iacute", "Icirc", "Igrave", "Iuml", "LT",
    "Ntilde", "Oacute", "Ocirc", "Ograve", "Oslash", "Otilde", "Ouml", "QUOT", "REG", "THORN",
    "Uacute", "Ucirc", "Ugrave", "Uuml", "Yacute", "aacute", "acirc", "acute", "aelig", "agrave",
    "amp", "aring", "atilde", "auml", "brvbar", "ccedil", "cedil", "cent", "copy", "curren",
    "deg", "divide", "eacute", "ecirc", "egrave", "eth", "euml", "frac12", "frac14", "frac34",
    "gt", "iacute", "icirc", "iexcl", "igrave", "iquest", "iuml", "laquo", "lt", "macr",
    "micro", "middot", "nbsp", "not", "ntilde", "oacute", "ocirc", "ograve", "ordf", "ordm",
    "oslash", "otilde", "ouml", "para", "plusmn", "pound", "quot", "raquo", "reg", "sect",
    "shy", "sup1", "sup2", "sup3", "szlig", "thorn", "times", "uacute", "ucirc", "ugrave", "uml",
    "uuml", "yacute", "yen", "yuml",
];

/// Entity name (without `&`, with or without the trailing `;`) to replacement text.
static DECODE_TABLE: LazyLock<HashMap<String, &'static str>> = LazyLock::new(|| {
    let mut table: HashMap<String, &'static str> = entities::ENTITIES
        .iter()
        .map(|e| (e.entity.trim_start_matches('&').to_string(), e.characters))
        .collect();
    for name in LEGACY_NAMES {
        if let Some(chars) = table.get(&format!("{name};")).copied() {
            table.entry((*name).to_string()).or_insert(chars);
        }
    }
    table
});

/// Lowercased entity names without delimiters, for case-insensitive canonicalization.
static ENTITY_NAMES: LazyLock<HashSet<String>> = LazyLock::new(|| {
    entities::ENTITIES
        .iter()
        .map(|e| {
            e.entity
                .trim_start_matches('&')
                .trim_end_matches(';')
                .to_ascii_lowercase()
        })
        .collect()
});

static DOUBLE_NAMED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)&[ ]?amp[ ]?;[ ]?([a-z][a-z0-9]*)[ ]?;").unwrap());

static DOUBLE_NUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)&[ ]?amp[ ]?;[ ]?#[ ]?([0-9]+)[ ]?;").unwrap());

static DOUBLE_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)&[ ]?amp[ ]?;[ ]?#[ ]?x[ ]?([a-f0-9]+)[ ]?;").unwrap());

static SINGLE_NAMED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)&[ ]?([a-z][a-z0-9]*)[ ]?;").unwrap());

static SINGLE_NUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)&[ ]?#[ ]?([0-9]+)[ ]?;").unwrap());

static SINGLE_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)&[ ]?#[ ]?x[ ]?([a-f0-9]+)[ ]?;").unwrap());

static SHY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[ ]?&[ ]?s[ ]?h[ ]?y[ ]?;[ ]?").unwrap());

static NBSP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(&[ ]?x?[ ]?n[ ]?b[ ]?([a-z][ ]?){0,6}[ ]?;)|(&[ ]?o[ ]?s[ ]?p[ ]?;)").unwrap()
});

static CHARREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]+;?|#[xX][0-9a-fA-F]+;?|[^\t\n\f <&#;]{1,32};?)").unwrap()
});

/// Numeric references the HTML5 parser remaps (mostly Windows-1252 C1 slots).
const REMAPPED_CHARREFS: &[(u32, char)] = &[
    (0x00, '\u{FFFD}'),
    (0x0D, '\r'),
    (0x80, '\u{20AC}'),
    (0x81, '\u{81}'),
    (0x82, '\u{201A}'),
    (0x83, '\u{0192}'),
    (0x84, '\u{201E}'),
    (0x85, '\u{2026}'),
    (0x86, '\u{2020}'),
    (0x87, '\u{2021}'),
    (0x88, '\u{02C6}'),
    (0x89, '\u{2030}'),
    (0x8A, '\u{0160}'),
    (0x8B, '\u{2039}'),
    (0x8C, '\u{0152}'),
    (0x8D, '\u{8D}'),
    (0x8E, '\u{017D}'),
    (0x8F, '\u{8F}'),
    (0x90, '\u{90}'),
    (0x91, '\u{2018}'),
    (0x92, '\u{2019}'),
    (0x93, '\u{201C}'),
    (0x94, '\u{201D}'),
    (0x95, '\u{2022}'),
    (0x96, '\u{2013}'),
    (0x97, '\u{2014}'),
    (0x98, '\u{02DC}'),
    (0x99, '\u{2122}'),
    (0x9A, '\u{0161}'),
    (0x9B, '\u{203A}'),
    (0x9C, '\u{0153}'),
    (0x9D, '\u{9D}'),
    (0x9E, '\u{017E}'),
    (0x9F, '\u{0178}'),
];

/// Stage that canonicalizes and decodes HTML character references.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityCanonicalizer;

impl EntityCanonicalizer {
    pub fn new() -> Self {
        // Force table and pattern compilation at construction time.
        LazyLock::force(&DECODE_TABLE);
        LazyLock::force(&ENTITY_NAMES);
        Self
    }
}

impl TextStage for EntityCanonicalizer {
    fn name(&self) -> &str {
        "unescape"
    }

    fn run(&self, text: &str) -> Result<String> {
        Ok(unescape(text))
    }
}

/// Canonicalizes and decodes every HTML character reference in `text`.
///
/// # Example
///
/// ```
/// use nmtprep::entity::unescape;
///
/// assert_eq!(unescape("Tom &amp;amp; Jerry"), "Tom & Jerry");
/// assert_eq!(unescape("&amp;amp;lt;"), "<");
/// ```
pub fn unescape(text: &str) -> String {
    let mut current = text.to_string();
    // Every pass that changes the text also shortens it, so this terminates
    loop {
        let next = unescape_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn unescape_once(line: &str) -> String {
    // Double escapes must collapse before anything else is decoded
    let line = DOUBLE_NAMED.replace_all(line, |caps: &Captures| named_or_keep(caps));
    let line = DOUBLE_NUM.replace_all(&line, "&#${1};");
    let line = DOUBLE_HEX.replace_all(&line, "&#x${1};");

    let line = SINGLE_NAMED.replace_all(&line, |caps: &Captures| named_or_keep(caps));
    let line = SINGLE_NUM.replace_all(&line, "&#${1};");
    let line = SINGLE_HEX.replace_all(&line, "&#x${1};");

    let line = SHY.replace_all(&line, "");
    let line = decode_charrefs(&line);
    NBSP.replace_all(&line, " ").into_owned()
}

/// Rewrites a matched escape as `&name;` when `name` is a known entity.
fn named_or_keep(caps: &Captures) -> String {
    let name = &caps[1];
    if ENTITY_NAMES.contains(&name.to_ascii_lowercase()) {
        format!("&{name};")
    } else {
        caps[0].to_string()
    }
}

/// Decodes named and numeric character references.
pub fn decode_charrefs(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    CHARREF
        .replace_all(text, |caps: &Captures| decode_reference(&caps[1]))
        .into_owned()
}

fn decode_reference(body: &str) -> String {
    if let Some(num) = body.strip_prefix('#') {
        let digits = num.trim_end_matches(';');
        let value = match digits.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => digits.parse::<u32>(),
        };
        // Out of range values fail to parse and become U+FFFD
        return decode_numeric(value.unwrap_or(u32::MAX));
    }

    if let Some(chars) = DECODE_TABLE.get(body) {
        return (*chars).to_string();
    }

    // Longest legacy name that prefixes the reference, e.g. "&notit;" -> "¬it;"
    let limit = body.len().min(MAX_NAME_LEN);
    for end in (2..limit).rev() {
        if !body.is_char_boundary(end) {
            continue;
        }
        if let Some(chars) = DECODE_TABLE.get(&body[..end]) {
            return format!("{chars}{}", &body[end..]);
        }
    }
    format!("&{body}")
}

fn decode_numeric(value: u32) -> String {
    if let Some((_, c)) = REMAPPED_CHARREFS.iter().find(|(code, _)| *code == value) {
        return c.to_string();
    }
    if (0xD800..=0xDFFF).contains(&value) || value > 0x10FFFF {
        return '\u{FFFD}'.to_string();
    }
    if is_invalid_codepoint(value) {
        return String::new();
    }
    char::from_u32(value).map(String::from).unwrap_or_default()
}

fn is_invalid_codepoint(value: u32) -> bool {
    matches!(value, 0x01..=0x08 | 0x0B | 0x0E..=0x1F | 0x7F..=0x9F | 0xFDD0..=0xFDEF)
        || (value & 0xFFFE) == 0xFFFE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_named() {
        assert_eq!(unescape("a &lt;b&gt; c"), "a <b> c");
        assert_eq!(unescape("caf&eacute;"), "café");
    }

    #[test]
    fn test_double_escaped_named() {
        assert_eq!(unescape("&amp;lt;"), "<");
        assert_eq!(unescape("&amp;amp;lt;"), "<");
        assert_eq!(unescape("&amp;quot;hi&amp;quot;"), "\"hi\"");
    }

    #[test]
    fn test_double_escaped_numeric() {
        assert_eq!(unescape("&amp;#60;"), "<");
        assert_eq!(unescape("&amp;#x3C;"), "<");
        assert_eq!(unescape("&amp; # x 3c ;"), "<");
    }

    #[test]
    fn test_stray_spaces_and_case() {
        assert_eq!(unescape("& lt ;"), "<");
        assert_eq!(unescape("&# 39 ;"), "'");
        assert_eq!(unescape("&#X41;"), "A");
        assert_eq!(unescape("&AMP; LT;"), "<");
    }

    #[test]
    fn test_unknown_entity_kept() {
        assert_eq!(unescape("&foobar;"), "&foobar;");
        assert_eq!(unescape("fish & chips"), "fish & chips");
    }

    #[test]
    fn test_soft_hyphen_removed() {
        assert_eq!(unescape("co&shy;operate"), "cooperate");
        assert_eq!(unescape("co & shy ; operate"), "cooperate");
    }

    #[test]
    fn test_nbsp_variants() {
        assert_eq!(unescape("a&osp;b"), "a b");
        assert_eq!(unescape("a&nbxp;b"), "a b");
        assert_eq!(unescape("a&xnbsp;b"), "a b");
        assert_eq!(unescape("a&nb sp;b"), "a b");
        // The real entity decodes to U+00A0
        assert_eq!(unescape("a&nbsp;b"), "a\u{A0}b");
    }

    #[test]
    fn test_numeric_edge_cases() {
        assert_eq!(decode_charrefs("&#128;"), "\u{20AC}");
        assert_eq!(decode_charrefs("&#0;"), "\u{FFFD}");
        assert_eq!(decode_charrefs("&#xD800;"), "\u{FFFD}");
        assert_eq!(decode_charrefs("&#99999999999;"), "\u{FFFD}");
        assert_eq!(decode_charrefs("&#1;"), "");
        assert_eq!(decode_charrefs("&#x1F600;"), "😀");
    }

    #[test]
    fn test_legacy_prefix_decoding() {
        assert_eq!(decode_charrefs("&notit;"), "¬it;");
        assert_eq!(decode_charrefs("&amp"), "&");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "&amp;amp;lt;",
            "Tom &amp; Jerry &#38;lt;",
            "&amp;#38;amp;",
            "plain text",
            "a &shy; b &osp; c",
            "한국어 &lt;태그&gt;",
            "中文&amp;nbsp;测试",
        ];
        for s in samples {
            let once = unescape(s);
            assert_eq!(unescape(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn test_deeply_nested_escapes() {
        let nested = format!("&amp;{}lt;", "amp;".repeat(40));
        let decoded = unescape(&nested);
        assert_eq!(decoded, "<");
        assert_eq!(unescape(&decoded), decoded);

        let sentence = format!("Fish &amp;{}amp; chips", "amp;".repeat(50));
        assert_eq!(unescape(&sentence), "Fish & chips");
    }

    #[test]
    fn test_stage_name() {
        let stage = EntityCanonicalizer::new();
        assert_eq!(stage.name(), "unescape");
        assert_eq!(stage.run("&gt;").unwrap(), ">");
    }
}

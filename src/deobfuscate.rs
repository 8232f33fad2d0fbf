//! Encoded-region detection and recursive re-scan.
//!
//! Four independent detectors find base64, hex-escape, unicode-escape,
//! and zero-width encoded regions, decode them, and emit a finding per
//! successful decode. Decoded text is then fed back through the
//! heuristic scanner; anything found inside is escalated to critical.
//! The recursion is one level deep: decoded content is not itself
//! re-deobfuscated.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;

use crate::entropy::line_of_offset;
use crate::heuristics::{HeuristicScanner, MATCH_TRUNCATE};
use crate::model::{Finding, Severity, take_chars, truncate_with_ellipsis};

static BASE64_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/]{20,}={0,2}").expect("base64 regex"));
static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\\x[0-9a-fA-F]{2}){4,}").expect("hex regex"));
static UNICODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\\u[0-9a-fA-F]{4}){3,}").expect("unicode regex"));
static ZERO_WIDTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[\u{200b}\u{200c}\u{200d}\u{feff}]+").expect("zero-width regex"));

/// Fraction of printable characters a base64 decode must reach to be
/// treated as text rather than binary noise.
const PRINTABLE_RATIO_GATE: f64 = 0.7;

/// The encoding a region was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Base64,
    Hex,
    UnicodeEscape,
    ZeroWidth,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Base64 => "base64",
            Encoding::Hex => "hex",
            Encoding::UnicodeEscape => "unicode_escape",
            Encoding::ZeroWidth => "zero_width",
        }
    }

    /// Finding id for a successful decode of this encoding.
    pub fn rule_id(&self) -> &'static str {
        match self {
            Encoding::Base64 => "DO-BAS",
            Encoding::Hex => "DO-HEX",
            Encoding::UnicodeEscape => "DO-UNI",
            Encoding::ZeroWidth => "DO-ZER",
        }
    }
}

/// One successfully decoded region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeobfuscationResult {
    pub encoding: Encoding,
    /// The encoded region as it appeared, truncated to 200 chars.
    pub original: String,
    /// Decoded text, truncated to 500 chars.
    pub decoded: String,
    /// 1-based line where the region starts.
    pub line_number: usize,
}

/// Decoders run in a fixed order as plain function values.
type Decoder = fn(&str) -> Vec<DeobfuscationResult>;

const DECODERS: &[Decoder] = &[
    detect_base64,
    detect_hex_encoding,
    detect_unicode_escapes,
    detect_zero_width,
];

pub fn detect_base64(content: &str) -> Vec<DeobfuscationResult> {
    let mut results = Vec::new();
    for m in BASE64_RE.find_iter(content) {
        let candidate = m.as_str();
        let Ok(bytes) = BASE64.decode(candidate) else {
            continue;
        };
        let decoded = String::from_utf8_lossy(&bytes);
        let total = decoded.chars().count().max(1);
        let printable = decoded
            .chars()
            .filter(|c| !c.is_control() || c.is_whitespace())
            .count();
        if printable as f64 / total as f64 > PRINTABLE_RATIO_GATE {
            results.push(DeobfuscationResult {
                encoding: Encoding::Base64,
                original: take_chars(candidate, 200).to_string(),
                decoded: take_chars(&decoded, 500).to_string(),
                line_number: line_of_offset(content, m.start()),
            });
        }
    }
    results
}

pub fn detect_hex_encoding(content: &str) -> Vec<DeobfuscationResult> {
    let mut results = Vec::new();
    for m in HEX_RE.find_iter(content) {
        let raw = m.as_str();
        let bytes: Vec<u8> = raw
            .split("\\x")
            .filter(|s| !s.is_empty())
            .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
            .collect();
        if bytes.is_empty() {
            continue;
        }
        let decoded = String::from_utf8_lossy(&bytes);
        results.push(DeobfuscationResult {
            encoding: Encoding::Hex,
            original: take_chars(raw, 200).to_string(),
            decoded: take_chars(&decoded, 500).to_string(),
            line_number: line_of_offset(content, m.start()),
        });
    }
    results
}

pub fn detect_unicode_escapes(content: &str) -> Vec<DeobfuscationResult> {
    let mut results = Vec::new();
    for m in UNICODE_RE.find_iter(content) {
        let raw = m.as_str();
        let Some(decoded) = decode_unicode_units(raw) else {
            continue;
        };
        results.push(DeobfuscationResult {
            encoding: Encoding::UnicodeEscape,
            original: take_chars(raw, 200).to_string(),
            decoded: take_chars(&decoded, 500).to_string(),
            line_number: line_of_offset(content, m.start()),
        });
    }
    results
}

/// Decode a run of `\uXXXX` escapes. Returns `None` when any unit is
/// not a valid scalar value (lone surrogates).
fn decode_unicode_units(raw: &str) -> Option<String> {
    let mut out = String::new();
    for unit in raw.split("\\u").filter(|s| !s.is_empty()) {
        let code = u32::from_str_radix(unit, 16).ok()?;
        out.push(char::from_u32(code)?);
    }
    Some(out)
}

pub fn detect_zero_width(content: &str) -> Vec<DeobfuscationResult> {
    let mut results = Vec::new();
    for m in ZERO_WIDTH_RE.find_iter(content) {
        let raw = m.as_str();
        let char_count = raw.chars().count();
        if char_count < 2 {
            continue;
        }

        // 200b -> 0, 200c -> 1, joiner/BOM carry no payload bit.
        let binary: String = raw
            .chars()
            .filter_map(|c| match c {
                '\u{200b}' => Some('0'),
                '\u{200c}' => Some('1'),
                _ => None,
            })
            .collect();

        let mut decoded = String::new();
        for chunk in binary.as_bytes().chunks(8) {
            if chunk.len() != 8 {
                continue;
            }
            let mut value = 0u8;
            for &bit in chunk {
                value = (value << 1) | (bit - b'0');
            }
            if value > 0 {
                decoded.push(char::from(value));
            }
        }
        if decoded.is_empty() {
            decoded = format!("[{char_count} zero-width chars]");
        }

        let escaped: String = raw.chars().flat_map(char::escape_unicode).collect();
        results.push(DeobfuscationResult {
            encoding: Encoding::ZeroWidth,
            original: take_chars(&escaped, 200).to_string(),
            decoded: take_chars(&decoded, 500).to_string(),
            line_number: line_of_offset(content, m.start()),
        });
    }
    results
}

/// Run all decoders and re-scan each decoded region.
///
/// Each successful decode emits a danger-severity finding; heuristic
/// findings inside the decoded text are re-emitted at critical with
/// the source encoding named.
pub fn scan_deobfuscation(
    content: &str,
    file_path: &str,
    heuristic: &HeuristicScanner,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    for decoder in DECODERS {
        for region in decoder(content) {
            let encoding = region.encoding.name();
            findings.push(Finding {
                rule_id: region.encoding.rule_id().to_string(),
                description: format!(
                    "Decoded {encoding} content: {}",
                    take_chars(&region.decoded, 100)
                ),
                severity: Severity::Danger,
                file_path: file_path.to_string(),
                line_number: region.line_number,
                matched_text: truncate_with_ellipsis(&region.original, MATCH_TRUNCATE),
                context: None,
            });

            for hidden in heuristic.scan(&region.decoded, file_path) {
                findings.push(Finding {
                    rule_id: hidden.rule_id,
                    description: format!("[hidden in {encoding}] {}", hidden.description),
                    severity: Severity::Critical,
                    file_path: file_path.to_string(),
                    line_number: region.line_number,
                    matched_text: hidden.matched_text,
                    context: Some(format!(
                        "Decoded from {encoding}: {}",
                        take_chars(&region.original, 100)
                    )),
                });
            }
        }
    }

    findings
}

//! High-entropy literal detection.
//!
//! Extracts string literals and long unbroken tokens from content and
//! measures their Shannon entropy in bits per character. Random-looking
//! strings (keys, encoded payloads) sit well above the entropy of
//! natural language or source code.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::heuristics::MATCH_TRUNCATE;
use crate::model::{Finding, Severity, truncate_with_ellipsis};

/// Entropy above this many bits/char flags a candidate.
pub const DEFAULT_ENTROPY_THRESHOLD: f64 = 4.5;

/// Candidates shorter than this are ignored.
pub const MIN_CANDIDATE_LENGTH: usize = 20;

// Triple-quoted forms first so they win over single-char delimiters.
static QUOTED_STRING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:"""[\s\S]*?"""|'''[\s\S]*?'''|"(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')"#,
    )
    .expect("quoted string regex")
});

static LONG_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/=_\-]{20,}").expect("long token regex"));

/// Shannon entropy of `s` in bits per character. Empty input is 0.
pub fn calculate_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut length = 0usize;
    for ch in s.chars() {
        *counts.entry(ch).or_insert(0) += 1;
        length += 1;
    }
    let length = length as f64;
    let mut entropy = 0.0;
    for &count in counts.values() {
        let p = count as f64 / length;
        entropy -= p * p.log2();
    }
    entropy
}

/// Extract candidate strings with their 1-based line numbers.
///
/// Pass (a): quoted literals (single-, double-, and triple-quoted) with
/// the delimiters stripped. Pass (b): unbroken `[A-Za-z0-9+/=_-]` runs
/// whose start offset was not claimed by pass (a).
pub fn extract_string_literals(content: &str) -> Vec<(usize, String)> {
    let mut results = Vec::new();
    let mut covered: Vec<(usize, usize)> = Vec::new();

    for m in QUOTED_STRING_RE.find_iter(content) {
        let text = m.as_str();
        let inner = if text.starts_with("\"\"\"") || text.starts_with("'''") {
            &text[3..text.len() - 3]
        } else {
            &text[1..text.len() - 1]
        };
        if inner.chars().count() >= MIN_CANDIDATE_LENGTH {
            results.push((line_of_offset(content, m.start()), inner.to_string()));
            covered.push((m.start(), m.end()));
        }
    }

    for m in LONG_TOKEN_RE.find_iter(content) {
        if covered
            .iter()
            .any(|&(start, end)| m.start() >= start && m.start() < end)
        {
            continue;
        }
        let text = m.as_str();
        if text.chars().count() >= MIN_CANDIDATE_LENGTH {
            results.push((line_of_offset(content, m.start()), text.to_string()));
        }
    }

    results
}

/// Scan content for high-entropy strings that may be encoded payloads.
pub fn scan_entropy(content: &str, file_path: &str, threshold: f64) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (line_number, candidate) in extract_string_literals(content) {
        let entropy = calculate_entropy(&candidate);
        if entropy > threshold {
            findings.push(Finding {
                rule_id: "EN-001".to_string(),
                description: format!(
                    "High-entropy string ({entropy:.1} bits/char), possible encoded payload"
                ),
                severity: Severity::Warning,
                file_path: file_path.to_string(),
                line_number,
                matched_text: truncate_with_ellipsis(&candidate, MATCH_TRUNCATE),
                context: None,
            });
        }
    }
    findings
}

/// 1-based line containing the byte offset.
pub(crate) fn line_of_offset(content: &str, offset: usize) -> usize {
    content.as_bytes()[..offset]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
        + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_entropy_zero() {
        assert_eq!(calculate_entropy(""), 0.0);
    }

    #[test]
    fn test_uniform_string_entropy_zero() {
        assert_eq!(calculate_entropy("aaaa"), 0.0);
    }

    #[test]
    fn test_two_symbol_entropy_one_bit() {
        for k in 1..5 {
            let s = "ab".repeat(k);
            assert!((calculate_entropy(&s) - 1.0).abs() < 1e-2);
        }
    }

    #[test]
    fn test_distinct_chars_entropy_log2_n() {
        let s = "abcdefgh"; // 8 distinct chars
        assert!((calculate_entropy(s) - 3.0).abs() < 1e-2);
        let s16 = "abcdefghijklmnop";
        assert!((calculate_entropy(s16) - 4.0).abs() < 1e-2);
    }

    #[test]
    fn test_extract_quoted_literal() {
        let content = r#"key = "AAAABBBBCCCCDDDDEEEE""#;
        let literals = extract_string_literals(content);
        assert_eq!(literals.len(), 1);
        assert_eq!(literals[0].1, "AAAABBBBCCCCDDDDEEEE");
        assert_eq!(literals[0].0, 1);
    }

    #[test]
    fn test_extract_triple_quoted() {
        let content = "doc = \"\"\"AAAABBBBCCCCDDDDEEEEFFFF\"\"\"";
        let literals = extract_string_literals(content);
        assert_eq!(literals.len(), 1);
        assert_eq!(literals[0].1, "AAAABBBBCCCCDDDDEEEEFFFF");
    }

    #[test]
    fn test_short_literals_ignored() {
        let literals = extract_string_literals(r#"x = "short""#);
        assert!(literals.is_empty());
    }

    #[test]
    fn test_bare_token_extracted() {
        let content = "token: ghp1234567890abcdefghij";
        let literals = extract_string_literals(content);
        assert_eq!(literals.len(), 1);
    }

    #[test]
    fn test_line_numbers_in_multiline_content() {
        let content = "a = 1\nb = 2\nkey = \"AAAABBBBCCCCDDDDEEEE\"\n";
        let literals = extract_string_literals(content);
        assert_eq!(literals[0].0, 3);
    }

    #[test]
    fn test_high_entropy_flagged() {
        // 32 distinct chars -> 5 bits/char, above the 4.5 threshold
        let content = r#"secret = "abcdefghijklmnopqrstuvwxyz012345""#;
        let findings = scan_entropy(content, "a.py", DEFAULT_ENTROPY_THRESHOLD);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, "EN-001");
        assert_eq!(findings[0].severity, Severity::Warning);
    }

    #[test]
    fn test_low_entropy_not_flagged() {
        let content = r#"banner = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa""#;
        let findings = scan_entropy(content, "a.py", DEFAULT_ENTROPY_THRESHOLD);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_matched_text_truncated() {
        let alphabet = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
        let payload: String = alphabet.chars().cycle().take(400).collect();
        let content = format!("x = \"{payload}\"");
        let findings = scan_entropy(&content, "a.py", DEFAULT_ENTROPY_THRESHOLD);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].matched_text.chars().count() <= 203);
    }

    #[test]
    fn test_line_of_offset() {
        let content = "one\ntwo\nthree";
        assert_eq!(line_of_offset(content, 0), 1);
        assert_eq!(line_of_offset(content, 4), 2);
        assert_eq!(line_of_offset(content, 8), 3);
    }
}

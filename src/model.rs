//! Core value types shared by the scan pipeline and the policy engine.
//!
//! `Finding` and `ScanResult` are immutable values with structural
//! equality; nothing in the crate mutates one after construction. The
//! ordered classifications (`Severity`, `RiskLevel`) are closed sets and
//! derive their ordering from variant order.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a single finding.
///
/// Totally ordered: `info < warning < danger < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Danger,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Danger => "danger",
            Severity::Critical => "critical",
        }
    }

    /// Parse a lowercase severity name. Unknown names map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "danger" => Some(Severity::Danger),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk classification of a whole file.
///
/// Totally ordered: `clean < low < medium < high < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Clean,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Clean => "clean",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(RiskLevel::Clean),
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected issue in a file at a line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable rule key (e.g. "PI-001", "DO-BAS", "TS-007").
    pub rule_id: String,
    /// Human-readable description.
    pub description: String,
    pub severity: Severity,
    /// Path of the scanned file as given to the scanner.
    pub file_path: String,
    /// 1-based line of the match; 0 means the finding applies to the
    /// whole file (signature hits).
    pub line_number: usize,
    /// Matched text, truncated to 200 characters with a trailing
    /// ellipsis when cut.
    pub matched_text: String,
    /// Optional context window around the match line.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<String>,
}

/// Aggregate of findings for one file with a computed risk level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub file_path: String,
    pub risk_level: RiskLevel,
    pub findings: Vec<Finding>,
    /// SHA-256 hex digest of the file contents; empty when the file was
    /// skipped or unreadable before hashing.
    pub sha256: String,
    pub scan_time_ms: f64,
    /// True when the result came from the hash cache or the reputation
    /// store rather than a fresh scan.
    pub cached: bool,
}

impl ScanResult {
    /// An empty, clean result for a skipped or missing file.
    pub fn clean(file_path: impl Into<String>, scan_time_ms: f64) -> Self {
        ScanResult {
            file_path: file_path.into(),
            risk_level: RiskLevel::Clean,
            findings: Vec::new(),
            sha256: String::new(),
            scan_time_ms,
            cached: false,
        }
    }
}

/// Compute the risk level implied by a set of findings.
///
/// `clean` iff empty; otherwise the maximum severity maps
/// `info -> low`, `warning -> medium`, `danger -> high`,
/// `critical -> critical`.
pub fn aggregate_risk_level(findings: &[Finding]) -> RiskLevel {
    let Some(max) = findings.iter().map(|f| f.severity).max() else {
        return RiskLevel::Clean;
    };
    match max {
        Severity::Info => RiskLevel::Low,
        Severity::Warning => RiskLevel::Medium,
        Severity::Danger => RiskLevel::High,
        Severity::Critical => RiskLevel::Critical,
    }
}

/// Worst-risk summary an external caller maps to an OS exit code
/// (conventionally 0/1/2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitSignal {
    None,
    Medium,
    High,
}

impl ExitSignal {
    /// Classify a single risk level.
    pub fn from_risk(risk: RiskLevel) -> Self {
        match risk {
            RiskLevel::Clean | RiskLevel::Low => ExitSignal::None,
            RiskLevel::Medium => ExitSignal::Medium,
            RiskLevel::High | RiskLevel::Critical => ExitSignal::High,
        }
    }

    /// Worst signal over a batch of results.
    pub fn from_results(results: &[ScanResult]) -> Self {
        results
            .iter()
            .map(|r| ExitSignal::from_risk(r.risk_level))
            .max()
            .unwrap_or(ExitSignal::None)
    }

    pub fn code(&self) -> u8 {
        match self {
            ExitSignal::None => 0,
            ExitSignal::Medium => 1,
            ExitSignal::High => 2,
        }
    }
}

/// Truncate to `max_chars` characters, appending an ellipsis if cut.
///
/// Char-based so multi-byte content never splits a UTF-8 boundary.
pub(crate) fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

/// Take at most `max_chars` characters without an ellipsis.
pub(crate) fn take_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

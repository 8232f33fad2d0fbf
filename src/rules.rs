//! Static detection rule catalog and the compiled rule set.
//!
//! The catalog is fixed at build time and covers five threat
//! categories. Dynamic rules from the reputation store are merged in at
//! scanner construction; an invalid dynamic regex is logged and
//! dropped, never fatal. A regex error in the static catalog is a
//! programming error and panics at first use.

use std::fmt;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::model::Severity;

/// Threat category of a detection rule.
///
/// The five built-in categories are closed; rules imported from the
/// reputation store may carry any label and land in `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleCategory {
    PromptInjection,
    DataExfiltration,
    Obfuscation,
    SuspiciousCommands,
    NetworkSuspicious,
    Custom(String),
}

impl RuleCategory {
    pub fn as_str(&self) -> &str {
        match self {
            RuleCategory::PromptInjection => "prompt_injection",
            RuleCategory::DataExfiltration => "data_exfiltration",
            RuleCategory::Obfuscation => "obfuscation",
            RuleCategory::SuspiciousCommands => "suspicious_commands",
            RuleCategory::NetworkSuspicious => "network_suspicious",
            RuleCategory::Custom(s) => s,
        }
    }

    /// Parse a category label; unknown labels become `Custom`.
    pub fn parse(s: &str) -> Self {
        match s {
            "prompt_injection" => RuleCategory::PromptInjection,
            "data_exfiltration" => RuleCategory::DataExfiltration,
            "obfuscation" => RuleCategory::Obfuscation,
            "suspicious_commands" => RuleCategory::SuspiciousCommands,
            "network_suspicious" => RuleCategory::NetworkSuspicious,
            other => RuleCategory::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detection rule: a case-insensitive regex with metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionRule {
    /// Stable key, unique across the catalog (e.g. "PI-001").
    pub rule_id: String,
    pub category: RuleCategory,
    pub severity: Severity,
    /// Regex source; matched case-insensitively.
    pub pattern: String,
    pub description: String,
}

use RuleCategory::{
    DataExfiltration as DE, NetworkSuspicious as NS, Obfuscation as OB, PromptInjection as PI,
    SuspiciousCommands as SC,
};
use Severity::{Critical, Danger, Warning};

type RuleRow = (&'static str, RuleCategory, Severity, &'static str, &'static str);

#[rustfmt::skip]
const STATIC_RULES: &[RuleRow] = &[
    // Prompt injection
    ("PI-001", PI, Critical, r"ignore\s+(all\s+)?previous\s+instructions",
     "Instruction override: ignore previous instructions"),
    ("PI-002", PI, Critical, r"ignore\s+(all\s+)?above\s+instructions",
     "Instruction override: ignore above instructions"),
    ("PI-003", PI, Critical, r"disregard\s+(all\s+)?prior",
     "Instruction override: disregard prior instructions"),
    ("PI-004", PI, Danger, r"you\s+are\s+now\s+a",
     "Role reassignment attempt"),
    ("PI-005", PI, Danger, r"new\s+instructions?\s*:",
     "New instruction injection"),
    ("PI-006", PI, Danger, r"system\s*:\s*you",
     "Fake system prompt injection"),
    ("PI-007", PI, Critical, r"<\s*system\s*>",
     "XML system tag injection"),
    ("PI-008", PI, Critical, r"IMPORTANT:\s*ignore",
     "Directive to ignore safety rules"),
    // Data exfiltration
    ("DE-001", DE, Critical, r"\.ssh[/\\]",
     "SSH directory access"),
    ("DE-002", DE, Critical, r"\.env\b",
     "Environment file access"),
    ("DE-003", DE, Critical, r"\.aws[/\\]credentials",
     "AWS credentials access"),
    ("DE-004", DE, Danger, r"\.gitconfig",
     "Git config access"),
    ("DE-005", DE, Critical, r"id_rsa",
     "SSH private key access"),
    ("DE-006", DE, Critical, r"\.gnupg",
     "GPG keyring access"),
    ("DE-007", DE, Danger, r"keychain",
     "Keychain access"),
    ("DE-008", DE, Danger, r"\.npmrc",
     "NPM config access (may contain tokens)"),
    ("DE-009", DE, Danger, r"\.pypirc",
     "PyPI config access (may contain tokens)"),
    ("DE-010", DE, Critical, r"curl\s+.*-d\s+.*\$",
     "Curl POST with variable interpolation (data exfiltration)"),
    ("DE-011", DE, Critical, r"wget\s+.*--post",
     "Wget POST request (data exfiltration)"),
    ("DE-012", DE, Critical, r"nc\s+-[a-z]*\s+\d+",
     "Netcat connection (potential reverse shell/exfiltration)"),
    // Obfuscation
    ("OB-001", OB, Warning, r"[A-Za-z0-9+/]{50,}={0,2}",
     "Possible Base64-encoded payload (long encoded string)"),
    ("OB-002", OB, Danger, r"\\x[0-9a-fA-F]{2}(\\x[0-9a-fA-F]{2}){10,}",
     "Hex-encoded byte sequence"),
    ("OB-003", OB, Danger, r"\\u[0-9a-fA-F]{4}(\\u[0-9a-fA-F]{4}){5,}",
     "Unicode escape sequence chain"),
    ("OB-004", OB, Critical, "[\u{200b}\u{200c}\u{200d}\u{feff}]",
     "Zero-width character detected (potential hidden content)"),
    // Suspicious commands
    ("SC-001", SC, Danger, r"subprocess\.(call|run|Popen)",
     "Subprocess execution"),
    ("SC-002", SC, Danger, r"os\.system\s*\(",
     "OS system command execution"),
    ("SC-003", SC, Danger, r"exec\s*\(",
     "Dynamic code execution via exec()"),
    ("SC-004", SC, Danger, r"eval\s*\(",
     "Dynamic code evaluation via eval()"),
    ("SC-005", SC, Danger, r"child_process",
     "Node.js child process spawning"),
    ("SC-006", SC, Danger, r"Runtime\.getRuntime\(\)\.exec",
     "Java runtime command execution"),
    // Network suspicious
    ("NS-001", NS, Warning, r"requests\.(get|post|put)\s*\(",
     "Python requests library HTTP call"),
    ("NS-002", NS, Warning, r"urllib\.request",
     "Python urllib network request"),
    ("NS-003", NS, Warning, r"fetch\s*\(",
     "JavaScript fetch() call"),
    ("NS-004", NS, Warning, r"XMLHttpRequest",
     "XMLHttpRequest usage"),
    ("NS-005", NS, Warning, r#"\.connect\s*\(\s*['"]"#,
     "Socket/database connection to literal address"),
    ("NS-006", NS, Danger, r"dns\.(resolver|query)",
     "DNS resolution (potential DNS exfiltration)"),
    ("NS-007", NS, Warning, r"socket\.getaddrinfo",
     "Socket address resolution"),
];

/// The built-in catalog as owned rules, materialized once.
pub static CATALOG: LazyLock<Vec<DetectionRule>> = LazyLock::new(|| {
    STATIC_RULES
        .iter()
        .map(|(id, category, severity, pattern, description)| DetectionRule {
            rule_id: (*id).to_string(),
            category: category.clone(),
            severity: *severity,
            pattern: (*pattern).to_string(),
            description: (*description).to_string(),
        })
        .collect()
});

/// A rule paired with its compiled regex.
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: DetectionRule,
    pub regex: Regex,
}

/// Pre-compiled, immutable set of detection rules in stable order:
/// the static catalog first, then accepted dynamic rules.
#[derive(Debug)]
pub struct CompiledRuleSet {
    rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    /// Compile the static catalog alone.
    pub fn from_static() -> Self {
        let rules = CATALOG
            .iter()
            .map(|rule| CompiledRule {
                regex: compile_pattern(&rule.pattern)
                    .unwrap_or_else(|e| panic!("static rule {} failed to compile: {e}", rule.rule_id)),
                rule: rule.clone(),
            })
            .collect();
        CompiledRuleSet { rules }
    }

    /// Compile the static catalog plus dynamic rules.
    ///
    /// Dynamic rules with invalid regexes are logged and dropped.
    pub fn with_dynamic(dynamic: impl IntoIterator<Item = DetectionRule>) -> Self {
        let mut set = Self::from_static();
        for rule in dynamic {
            match compile_pattern(&rule.pattern) {
                Ok(regex) => set.rules.push(CompiledRule { rule, regex }),
                Err(e) => {
                    tracing::warn!(
                        rule_id = %rule.rule_id,
                        error = %e,
                        "Dropping dynamic rule with invalid regex"
                    );
                }
            }
        }
        set
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

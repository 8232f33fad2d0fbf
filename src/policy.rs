//! Policy model and evaluator.
//!
//! A `Policy` is an immutable tree of defaults, file-access globs,
//! network globs, alert settings, and per-tool overrides. The engine
//! maps a scan result (plus an optional tool identity) to an action
//! and a list of violations. Deny-first with allow override for file
//! access; for network findings a deny match wins even when the
//! effective settings allow network activity.

use std::io::Write;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::model::{RiskLevel, ScanResult};

/// Rule-id prefixes that mark a finding as network-related.
const NETWORK_PREFIXES: &[&str] = &["NS-", "DE-010", "DE-011", "DE-012"];
/// Rule-id prefixes that mark a finding as shell-related.
const SHELL_PREFIXES: &[&str] = &["SC-"];

/// Triage outcome. Totally ordered: `log < warn < block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Log,
    Warn,
    Block,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Log => "log",
            PolicyAction::Warn => "warn",
            PolicyAction::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "log" => Some(PolicyAction::Log),
            "warn" => Some(PolicyAction::Warn),
            "block" => Some(PolicyAction::Block),
            _ => None,
        }
    }

    /// Exit code external callers conventionally map this to.
    pub fn code(&self) -> u8 {
        match self {
            PolicyAction::Log => 0,
            PolicyAction::Warn => 1,
            PolicyAction::Block => 2,
        }
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDefaults {
    pub action: PolicyAction,
    pub allow_network: bool,
    pub allow_shell: bool,
    pub max_risk_level: RiskLevel,
    pub deep_scan: bool,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        PolicyDefaults {
            action: PolicyAction::Block,
            allow_network: false,
            allow_shell: false,
            max_risk_level: RiskLevel::Medium,
            deep_scan: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAccessPolicy {
    pub deny: Vec<String>,
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub console: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        AlertsConfig {
            console: true,
            log_file: None,
        }
    }
}

/// Per-tool override; `None` fields inherit from the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOverride {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action: Option<PolicyAction>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub allow_network: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub allow_shell: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_risk_level: Option<RiskLevel>,
}

impl ToolOverride {
    pub fn named(name: impl Into<String>) -> Self {
        ToolOverride {
            name: name.into(),
            action: None,
            allow_network: None,
            allow_shell: None,
            max_risk_level: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub defaults: PolicyDefaults,
    pub file_access: FileAccessPolicy,
    pub network: NetworkPolicy,
    pub alerts: AlertsConfig,
    pub tool_overrides: Vec<ToolOverride>,
}

impl Policy {
    /// YAML rendering of the policy; `None` override fields are
    /// omitted and override order is preserved.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}

/// One policy violation.
///
/// `severity` is a display label: the result's risk level for
/// `risk_level` violations, `critical` for `file_access`, and the
/// finding's severity for network/shell violations. Nothing orders or
/// branches on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub rule: String,
    pub description: String,
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub action: PolicyAction,
    pub violations: Vec<PolicyViolation>,
}

impl PolicyResult {
    pub fn passed(&self) -> bool {
        self.action == PolicyAction::Log
    }
}

/// Effective settings after tool-override resolution.
#[derive(Debug, Clone, Copy)]
struct Effective {
    action: PolicyAction,
    allow_network: bool,
    allow_shell: bool,
    max_risk_level: RiskLevel,
}

/// Evaluate scan results against a policy.
#[derive(Debug)]
pub struct PolicyEngine {
    policy: Policy,
    deny_patterns: Vec<Pattern>,
    allow_patterns: Vec<Pattern>,
    net_allow_patterns: Vec<Pattern>,
    net_deny_patterns: Vec<Pattern>,
}

impl PolicyEngine {
    pub fn new(policy: Policy) -> Self {
        let deny_patterns = compile_patterns(&policy.file_access.deny);
        let allow_patterns = compile_patterns(&policy.file_access.allow);
        let net_allow_patterns = compile_patterns(&policy.network.allow);
        let net_deny_patterns = compile_patterns(&policy.network.deny);
        PolicyEngine {
            policy,
            deny_patterns,
            allow_patterns,
            net_allow_patterns,
            net_deny_patterns,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn evaluate(&self, scan_result: &ScanResult, tool_name: Option<&str>) -> PolicyResult {
        let effective = self.resolve(tool_name);
        let mut violations = Vec::new();

        // 1. Risk level
        if scan_result.risk_level > effective.max_risk_level {
            violations.push(PolicyViolation {
                rule: "risk_level".to_string(),
                description: format!(
                    "Risk level '{}' exceeds maximum '{}'",
                    scan_result.risk_level, effective.max_risk_level
                ),
                severity: scan_result.risk_level.as_str().to_string(),
            });
        }

        // 2. File access: deny-first, allow overrides deny
        let expanded_path = expand_tilde(&scan_result.file_path);
        if matches_any(&self.deny_patterns, &expanded_path)
            && !matches_any(&self.allow_patterns, &expanded_path)
        {
            violations.push(PolicyViolation {
                rule: "file_access".to_string(),
                description: format!(
                    "File '{}' matches a denied path pattern",
                    scan_result.file_path
                ),
                severity: "critical".to_string(),
            });
        }

        // 3. Network findings
        for finding in &scan_result.findings {
            if !has_prefix(&finding.rule_id, NETWORK_PREFIXES) {
                continue;
            }
            if matches_any(&self.net_deny_patterns, &finding.matched_text) {
                // A deny match wins even when network is allowed
                violations.push(PolicyViolation {
                    rule: "network_deny".to_string(),
                    description: format!(
                        "Denied network target [{}]: {}",
                        finding.rule_id, finding.description
                    ),
                    severity: finding.severity.as_str().to_string(),
                });
                continue;
            }
            if effective.allow_network {
                continue;
            }
            if matches_any(&self.net_allow_patterns, &finding.matched_text) {
                continue;
            }
            violations.push(PolicyViolation {
                rule: "network".to_string(),
                description: format!(
                    "Network-related finding [{}]: {}",
                    finding.rule_id, finding.description
                ),
                severity: finding.severity.as_str().to_string(),
            });
        }

        // 4. Shell findings
        if !effective.allow_shell {
            for finding in &scan_result.findings {
                if has_prefix(&finding.rule_id, SHELL_PREFIXES) {
                    violations.push(PolicyViolation {
                        rule: "shell".to_string(),
                        description: format!(
                            "Shell-related finding [{}]: {}",
                            finding.rule_id, finding.description
                        ),
                        severity: finding.severity.as_str().to_string(),
                    });
                }
            }
        }

        // 5. Final action
        let action = if violations.is_empty() {
            PolicyAction::Log
        } else {
            effective.action
        };

        PolicyResult { action, violations }
    }

    /// Append violation lines to the configured alert log, one per
    /// violation: `ISO8601 [severity] file: rule - description`.
    ///
    /// No-op when no log file is configured; write failures are logged
    /// and never fatal.
    pub fn log_violations(&self, results: &[ScanResult], policy_results: &[PolicyResult]) {
        let Some(log_file) = &self.policy.alerts.log_file else {
            return;
        };

        if let Some(parent) = log_file.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!(error = %e, "Failed to create alert log directory");
            return;
        }

        let mut file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
        {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %log_file.display(), error = %e, "Failed to open alert log");
                return;
            }
        };

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        for (result, policy_result) in results.iter().zip(policy_results) {
            for violation in &policy_result.violations {
                let line = format!(
                    "{timestamp} [{}] {}: {} - {}\n",
                    violation.severity, result.file_path, violation.rule, violation.description
                );
                if let Err(e) = file.write_all(line.as_bytes()) {
                    tracing::warn!(error = %e, "Failed to append alert log line");
                    return;
                }
            }
        }
    }

    fn resolve(&self, tool_name: Option<&str>) -> Effective {
        let d = &self.policy.defaults;
        let mut effective = Effective {
            action: d.action,
            allow_network: d.allow_network,
            allow_shell: d.allow_shell,
            max_risk_level: d.max_risk_level,
        };

        if let Some(name) = tool_name
            && let Some(o) = self.policy.tool_overrides.iter().find(|o| o.name == name)
        {
            if let Some(action) = o.action {
                effective.action = action;
            }
            if let Some(allow_network) = o.allow_network {
                effective.allow_network = allow_network;
            }
            if let Some(allow_shell) = o.allow_shell {
                effective.allow_shell = allow_shell;
            }
            if let Some(max_risk) = o.max_risk_level {
                effective.max_risk_level = max_risk;
            }
        }

        effective
    }
}

/// Shell-style glob matching; `*` stays within a path component,
/// `**` crosses.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn compile_patterns(sources: &[String]) -> Vec<Pattern> {
    sources
        .iter()
        .filter_map(|s| match Pattern::new(s) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(pattern = %s, error = %e, "Skipping invalid policy glob");
                None
            }
        })
        .collect()
}

fn matches_any(patterns: &[Pattern], value: &str) -> bool {
    patterns
        .iter()
        .any(|p| p.matches_with(value, GLOB_OPTIONS))
}

fn has_prefix(rule_id: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| rule_id.starts_with(p))
}

/// Expand a leading tilde to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest).to_string_lossy().into_owned();
    }
    path.to_string()
}

//! Policy file discovery, YAML parsing, and defaults.
//!
//! Discovery walks parent directories from a start path looking for
//! `.icu-policy.yml` / `.icu-policy.yaml`, falling back to the global
//! `~/.config/icu/policy.yml`. Parsing is strict about shapes: unknown
//! top-level keys are accepted, but a section with the wrong type
//! produces a load error naming that section. Tilde and
//! `${PROJECT_DIR}` are expanded in every path-valued field.

use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::model::RiskLevel;
use crate::policy::{
    AlertsConfig, FileAccessPolicy, NetworkPolicy, Policy, PolicyAction, PolicyDefaults,
    ToolOverride, expand_tilde,
};

const POLICY_FILENAMES: &[&str] = &[".icu-policy.yml", ".icu-policy.yaml"];

/// Walk up from `start` looking for a policy file, falling back to the
/// global config location. `None` when nothing is found.
pub fn discover_policy_path(start: Option<&Path>) -> Option<PathBuf> {
    let start = match start {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir().ok()?,
    };
    let mut current = start.as_path();
    loop {
        for name in POLICY_FILENAMES {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }

    let global = global_policy_path();
    if global.is_file() { Some(global) } else { None }
}

/// `~/.config/icu/policy.yml`.
pub fn global_policy_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".config")
        .join("icu")
        .join("policy.yml")
}

/// Load and parse a policy file.
pub fn load_policy(path: &Path, project_dir: Option<&Path>) -> Result<Policy> {
    if !path.is_file() {
        return Err(Error::PolicyNotFound {
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
        context: format!("reading {}", path.display()),
        source,
    })?;
    load_policy_str(&content, project_dir)
}

/// Parse YAML policy content.
pub fn load_policy_str(content: &str, project_dir: Option<&Path>) -> Result<Policy> {
    let root: Value = serde_yaml::from_str(content).map_err(|e| Error::PolicyLoad {
        section: "document".to_string(),
        reason: e.to_string(),
    })?;
    if !root.is_mapping() {
        return Err(Error::PolicyLoad {
            section: "document".to_string(),
            reason: "policy must be a YAML mapping".to_string(),
        });
    }

    let project_dir = match project_dir {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let expand = move |raw: &str| -> String {
        let replaced = raw.replace("${PROJECT_DIR}", &project_dir.to_string_lossy());
        expand_tilde(&replaced)
    };

    let defaults = parse_defaults(section(&root, "defaults")?)?;
    let (deny, allow) = parse_pattern_lists(section(&root, "file_access")?, "file_access", &expand)?;
    let file_access = FileAccessPolicy { deny, allow };
    let (deny, allow) = parse_pattern_lists(section(&root, "network")?, "network", &expand)?;
    let network = NetworkPolicy { deny, allow };
    let alerts = parse_alerts(section(&root, "alerts")?, &expand)?;
    let tool_overrides = parse_tool_overrides(root.get("tool_overrides"))?;

    Ok(Policy {
        defaults,
        file_access,
        network,
        alerts,
        tool_overrides,
    })
}

/// Fetch a section, requiring it to be a mapping (or absent/null).
fn section<'a>(root: &'a Value, name: &str) -> Result<Option<&'a Value>> {
    match root.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) if v.is_mapping() => Ok(Some(v)),
        Some(_) => Err(Error::PolicyLoad {
            section: name.to_string(),
            reason: "must be a mapping".to_string(),
        }),
    }
}

fn parse_defaults(raw: Option<&Value>) -> Result<PolicyDefaults> {
    let mut defaults = PolicyDefaults::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };

    if let Some(v) = raw.get("action") {
        defaults.action = parse_action(v, "defaults")?;
    }
    if let Some(v) = raw.get("allow_network") {
        defaults.allow_network = parse_bool(v, "defaults", "allow_network")?;
    }
    if let Some(v) = raw.get("allow_shell") {
        defaults.allow_shell = parse_bool(v, "defaults", "allow_shell")?;
    }
    if let Some(v) = raw.get("max_risk_level") {
        defaults.max_risk_level = parse_risk(v, "defaults")?;
    }
    if let Some(v) = raw.get("deep_scan") {
        defaults.deep_scan = parse_bool(v, "defaults", "deep_scan")?;
    }
    Ok(defaults)
}

/// Parse the `deny` / `allow` lists of a section, expanding each entry.
fn parse_pattern_lists(
    raw: Option<&Value>,
    name: &str,
    expand: &dyn Fn(&str) -> String,
) -> Result<(Vec<String>, Vec<String>)> {
    let Some(raw) = raw else {
        return Ok((Vec::new(), Vec::new()));
    };
    let deny = parse_string_list(raw.get("deny"), name, "deny", expand)?;
    let allow = parse_string_list(raw.get("allow"), name, "allow", expand)?;
    Ok((deny, allow))
}

fn parse_string_list(
    value: Option<&Value>,
    section: &str,
    key: &str,
    expand: &dyn Fn(&str) -> String,
) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|item| match item.as_str() {
                Some(s) => Ok(expand(s)),
                None => Err(Error::PolicyLoad {
                    section: section.to_string(),
                    reason: format!("'{key}' entries must be strings"),
                }),
            })
            .collect(),
        Some(_) => Err(Error::PolicyLoad {
            section: section.to_string(),
            reason: format!("'{key}' must be a list"),
        }),
    }
}

fn parse_alerts(raw: Option<&Value>, expand: &dyn Fn(&str) -> String) -> Result<AlertsConfig> {
    let mut alerts = AlertsConfig::default();
    let Some(raw) = raw else {
        return Ok(alerts);
    };
    if let Some(v) = raw.get("console") {
        alerts.console = parse_bool(v, "alerts", "console")?;
    }
    match raw.get("log_file") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => alerts.log_file = Some(PathBuf::from(expand(s))),
        Some(_) => {
            return Err(Error::PolicyLoad {
                section: "alerts".to_string(),
                reason: "'log_file' must be a string".to_string(),
            });
        }
    }
    Ok(alerts)
}

fn parse_tool_overrides(value: Option<&Value>) -> Result<Vec<ToolOverride>> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Sequence(seq)) => seq,
        Some(_) => {
            return Err(Error::PolicyLoad {
                section: "tool_overrides".to_string(),
                reason: "must be a list".to_string(),
            });
        }
    };

    let mut overrides = Vec::with_capacity(items.len());
    for item in items {
        if !item.is_mapping() {
            return Err(Error::PolicyLoad {
                section: "tool_overrides".to_string(),
                reason: "each override must be a mapping with a 'name' key".to_string(),
            });
        }
        let Some(name) = item.get("name").and_then(Value::as_str) else {
            return Err(Error::PolicyLoad {
                section: "tool_overrides".to_string(),
                reason: "each override must be a mapping with a 'name' key".to_string(),
            });
        };

        let mut o = ToolOverride::named(name);
        if let Some(v) = item.get("action") {
            o.action = Some(parse_action(v, "tool_overrides")?);
        }
        if let Some(v) = item.get("allow_network") {
            o.allow_network = Some(parse_bool(v, "tool_overrides", "allow_network")?);
        }
        if let Some(v) = item.get("allow_shell") {
            o.allow_shell = Some(parse_bool(v, "tool_overrides", "allow_shell")?);
        }
        if let Some(v) = item.get("max_risk_level") {
            o.max_risk_level = Some(parse_risk(v, "tool_overrides")?);
        }
        overrides.push(o);
    }
    Ok(overrides)
}

fn parse_action(value: &Value, section: &str) -> Result<PolicyAction> {
    value
        .as_str()
        .and_then(PolicyAction::parse)
        .ok_or_else(|| Error::PolicyLoad {
            section: section.to_string(),
            reason: format!("'action' must be one of block, warn, log (got {value:?})"),
        })
}

fn parse_risk(value: &Value, section: &str) -> Result<RiskLevel> {
    value
        .as_str()
        .and_then(RiskLevel::parse)
        .ok_or_else(|| Error::PolicyLoad {
            section: section.to_string(),
            reason: format!(
                "'max_risk_level' must be one of clean, low, medium, high, critical (got {value:?})"
            ),
        })
}

fn parse_bool(value: &Value, section: &str, key: &str) -> Result<bool> {
    value.as_bool().ok_or_else(|| Error::PolicyLoad {
        section: section.to_string(),
        reason: format!("'{key}' must be a boolean"),
    })
}

/// Non-fatal review of a loaded policy.
pub fn validate_policy(policy: &Policy) -> Vec<String> {
    let mut warnings = Vec::new();

    if policy.file_access.deny.is_empty() {
        warnings.push("No file access deny patterns; sensitive files are unprotected".to_string());
    }

    let mut seen = std::collections::HashSet::new();
    for o in &policy.tool_overrides {
        if !seen.insert(o.name.as_str()) {
            warnings.push(format!(
                "Duplicate tool override '{}'; only the first entry applies",
                o.name
            ));
        }
        if o.action.is_none()
            && o.allow_network.is_none()
            && o.allow_shell.is_none()
            && o.max_risk_level.is_none()
        {
            warnings.push(format!("Tool override '{}' overrides nothing", o.name));
        }
    }

    if !policy.alerts.console && policy.alerts.log_file.is_none() {
        warnings.push("Alerts are disabled: no console output and no log file".to_string());
    }

    warnings
}

/// Policy with safe defaults: strict action, sensitive paths denied.
pub fn default_policy() -> Policy {
    Policy {
        defaults: PolicyDefaults::default(),
        file_access: FileAccessPolicy {
            deny: [
                "~/.ssh/*",
                "~/.aws/*",
                "~/.gnupg/*",
                "~/.config/gcloud/*",
                "**/.env",
                "**/.env.*",
                "**/credentials.json",
                "**/secrets.yml",
                "**/secrets.yaml",
            ]
            .iter()
            .map(|p| expand_tilde(p))
            .collect(),
            allow: Vec::new(),
        },
        network: NetworkPolicy {
            allow: Vec::new(),
            deny: vec!["*.onion".to_string(), "*.i2p".to_string()],
        },
        alerts: AlertsConfig::default(),
        tool_overrides: Vec::new(),
    }
}

/// Commented starter policy written by `icu policy init`.
pub fn default_policy_yaml() -> &'static str {
    r#"# ICU Policy Configuration
# https://github.com/i-see-you/icu
version: "1.0"

# Default settings applied to all scans
defaults:
  # Action when policy is violated: block | warn | log
  action: block

  # Whether to allow network-related findings
  allow_network: false

  # Whether to allow shell command findings
  allow_shell: false

  # Maximum acceptable risk level: clean | low | medium | high | critical
  max_risk_level: medium

  # Enable deep scanning (entropy + deobfuscation)
  deep_scan: true

# File access policy: deny-first, allow overrides deny
file_access:
  deny:
    - "~/.ssh/*"
    - "~/.aws/*"
    - "~/.gnupg/*"
    - "~/.config/gcloud/*"
    - "**/.env"
    - "**/.env.*"
    - "**/credentials.json"
    - "**/secrets.yml"
    - "**/secrets.yaml"
  allow: []

# Network policy
network:
  allow: []
  deny:
    - "*.onion"
    - "*.i2p"

# Alert configuration
alerts:
  console: true
  # log_file: /var/log/icu/alerts.log

# Per-tool overrides (inherit from defaults if omitted)
# tool_overrides:
#   - name: cursor
#     allow_network: true
#     max_risk_level: low
#   - name: copilot
#     action: warn
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document() {
        let policy = load_policy_str("version: \"1.0\"\n", None).unwrap();
        assert_eq!(policy, Policy::default());
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
version: "1.0"
defaults:
  action: warn
  allow_network: true
  allow_shell: false
  max_risk_level: high
  deep_scan: false
file_access:
  deny:
    - "/secrets/*"
  allow:
    - "/secrets/public/*"
network:
  allow:
    - "api.internal.*"
  deny:
    - "*.onion"
alerts:
  console: false
  log_file: /var/log/icu/alerts.log
tool_overrides:
  - name: cursor
    allow_network: true
    max_risk_level: critical
  - name: copilot
    action: log
"#;
        let policy = load_policy_str(yaml, None).unwrap();
        assert_eq!(policy.defaults.action, PolicyAction::Warn);
        assert!(policy.defaults.allow_network);
        assert_eq!(policy.defaults.max_risk_level, RiskLevel::High);
        assert!(!policy.defaults.deep_scan);
        assert_eq!(policy.file_access.deny, vec!["/secrets/*"]);
        assert_eq!(policy.file_access.allow, vec!["/secrets/public/*"]);
        assert_eq!(policy.network.allow, vec!["api.internal.*"]);
        assert_eq!(policy.network.deny, vec!["*.onion"]);
        assert!(!policy.alerts.console);
        assert_eq!(
            policy.alerts.log_file.as_deref(),
            Some(Path::new("/var/log/icu/alerts.log"))
        );
        // Override order preserved
        assert_eq!(policy.tool_overrides[0].name, "cursor");
        assert_eq!(policy.tool_overrides[1].name, "copilot");
        assert_eq!(policy.tool_overrides[1].action, Some(PolicyAction::Log));
        assert_eq!(policy.tool_overrides[0].allow_shell, None);
    }

    #[test]
    fn test_round_trip_through_to_yaml() {
        let yaml = r#"
defaults:
  action: warn
  max_risk_level: high
file_access:
  deny: ["/secrets/*"]
tool_overrides:
  - name: cursor
    allow_network: true
"#;
        let policy = load_policy_str(yaml, None).unwrap();
        let rendered = policy.to_yaml();
        let reparsed = load_policy_str(&rendered, None).unwrap();
        assert_eq!(policy, reparsed);
    }

    #[test]
    fn test_malformed_section_named_in_error() {
        let err = load_policy_str("defaults: [1, 2]\n", None).unwrap_err();
        assert!(err.to_string().contains("defaults"));

        let err = load_policy_str("tool_overrides: {a: 1}\n", None).unwrap_err();
        assert!(err.to_string().contains("tool_overrides"));

        let err = load_policy_str("file_access:\n  deny: \"not a list\"\n", None).unwrap_err();
        assert!(err.to_string().contains("file_access"));
    }

    #[test]
    fn test_override_requires_name() {
        let err = load_policy_str("tool_overrides:\n  - action: warn\n", None).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_invalid_action_rejected() {
        let err = load_policy_str("defaults:\n  action: destroy\n", None).unwrap_err();
        assert!(err.to_string().contains("action"));
    }

    #[test]
    fn test_unknown_top_level_keys_accepted() {
        let policy = load_policy_str("version: \"2\"\nfuture_section:\n  a: 1\n", None).unwrap();
        assert_eq!(policy, Policy::default());
    }

    #[test]
    fn test_project_dir_expansion() {
        let yaml = "file_access:\n  deny:\n    - \"${PROJECT_DIR}/secrets/*\"\n";
        let policy = load_policy_str(yaml, Some(Path::new("/work/proj"))).unwrap();
        assert_eq!(policy.file_access.deny, vec!["/work/proj/secrets/*"]);
    }

    #[test]
    fn test_tilde_expansion() {
        let yaml = "file_access:\n  deny:\n    - \"~/.ssh/*\"\n";
        let policy = load_policy_str(yaml, None).unwrap();
        assert!(!policy.file_access.deny[0].starts_with('~'));
        assert!(policy.file_access.deny[0].ends_with("/.ssh/*"));
    }

    #[test]
    fn test_load_policy_missing_file() {
        let err = load_policy(Path::new("/nonexistent/.icu-policy.yml"), None).unwrap_err();
        assert!(matches!(err, Error::PolicyNotFound { .. }));
    }

    #[test]
    fn test_discover_walks_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let policy_file = tmp.path().join(".icu-policy.yml");
        std::fs::write(&policy_file, "version: \"1.0\"\n").unwrap();

        let found = discover_policy_path(Some(&nested)).unwrap();
        assert_eq!(found, policy_file);
    }

    #[test]
    fn test_discover_prefers_yml_over_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".icu-policy.yml"), "a: 1\n").unwrap();
        std::fs::write(tmp.path().join(".icu-policy.yaml"), "a: 1\n").unwrap();
        let found = discover_policy_path(Some(tmp.path())).unwrap();
        assert!(found.ends_with(".icu-policy.yml"));
    }

    #[test]
    fn test_default_policy_yaml_parses() {
        let policy = load_policy_str(default_policy_yaml(), None).unwrap();
        assert_eq!(policy.defaults.action, PolicyAction::Block);
        assert_eq!(policy.defaults.max_risk_level, RiskLevel::Medium);
        assert!(!policy.file_access.deny.is_empty());
        assert_eq!(policy.network.deny, vec!["*.onion", "*.i2p"]);
    }

    #[test]
    fn test_default_policy_matches_starter_yaml() {
        let parsed = load_policy_str(default_policy_yaml(), None).unwrap();
        assert_eq!(parsed, default_policy());
    }

    #[test]
    fn test_validate_warns_on_empty_deny() {
        let warnings = validate_policy(&Policy::default());
        assert!(warnings.iter().any(|w| w.contains("deny")));
        assert!(validate_policy(&default_policy()).is_empty());
    }

    #[test]
    fn test_validate_warns_on_empty_override() {
        let mut policy = default_policy();
        policy.tool_overrides = vec![ToolOverride::named("cursor")];
        let warnings = validate_policy(&policy);
        assert!(warnings.iter().any(|w| w.contains("overrides nothing")));
    }

    #[test]
    fn test_validate_warns_on_duplicate_override() {
        let mut policy = default_policy();
        policy.tool_overrides = vec![
            ToolOverride {
                action: Some(PolicyAction::Warn),
                ..ToolOverride::named("cursor")
            },
            ToolOverride {
                action: Some(PolicyAction::Log),
                ..ToolOverride::named("cursor")
            },
        ];
        let warnings = validate_policy(&policy);
        assert!(warnings.iter().any(|w| w.contains("Duplicate")));
    }
}

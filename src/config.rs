//! Project and global configuration loading.
//!
//! Discovery walks parent directories from a start path looking for
//! `.icu.yml` / `.icu.yaml`, merged over the global `~/.icu/config.yml`
//! (project wins). Environment variables overlay YAML values, and CLI
//! flags overlay the environment. A parallel walk collects `.icuignore`
//! patterns (gitignore-style: one glob per line, `#` comments).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;

use crate::scanner::ScanDepth;

const CONFIG_FILENAMES: &[&str] = &[".icu.yml", ".icu.yaml"];
const IGNORE_FILENAME: &str = ".icuignore";

pub const ENV_DEPTH: &str = "ICU_DEPTH";
pub const ENV_MAX_SIZE: &str = "ICU_MAX_SIZE";
pub const ENV_NO_DB: &str = "ICU_NO_DB";
pub const ENV_POLICY: &str = "ICU_POLICY";

pub const DEFAULT_MAX_FILE_SIZE: u64 = 1_048_576;

/// Merged configuration from global + project files + environment.
#[derive(Debug, Clone, PartialEq)]
pub struct IcuConfig {
    pub depth: ScanDepth,
    pub max_file_size: u64,
    pub exclude: Vec<String>,
    pub policy_path: Option<PathBuf>,
    pub no_db: bool,
}

impl Default for IcuConfig {
    fn default() -> Self {
        IcuConfig {
            depth: ScanDepth::Auto,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            exclude: Vec::new(),
            policy_path: None,
            no_db: false,
        }
    }
}

/// Raw YAML shape; every field optional so partial files merge.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    depth: Option<String>,
    max_file_size: Option<u64>,
    exclude: Option<Vec<String>>,
    policy_path: Option<String>,
    no_db: Option<bool>,
}

impl RawConfig {
    fn overlay(&mut self, other: RawConfig) {
        if other.depth.is_some() {
            self.depth = other.depth;
        }
        if other.max_file_size.is_some() {
            self.max_file_size = other.max_file_size;
        }
        if other.exclude.is_some() {
            self.exclude = other.exclude;
        }
        if other.policy_path.is_some() {
            self.policy_path = other.policy_path;
        }
        if other.no_db.is_some() {
            self.no_db = other.no_db;
        }
    }
}

/// Load configuration by walking up from `start`, merging the global
/// file underneath and the environment on top. `.icuignore` patterns
/// are appended to the exclude list.
pub fn load_config(start: Option<&Path>) -> IcuConfig {
    let mut raw = RawConfig::default();

    if let Some(global) = read_yaml_config(&global_config_path()) {
        raw.overlay(global);
    }
    if let Some(project_path) = discover_config(start)
        && let Some(project) = read_yaml_config(&project_path)
    {
        raw.overlay(project);
    }
    overlay_env(&mut raw);

    let mut exclude = raw.exclude.unwrap_or_default();
    exclude.extend(load_icuignore(start));

    IcuConfig {
        depth: raw
            .depth
            .as_deref()
            .and_then(ScanDepth::parse)
            .unwrap_or(ScanDepth::Auto),
        max_file_size: raw.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE),
        exclude,
        policy_path: raw.policy_path.map(PathBuf::from),
        no_db: raw.no_db.unwrap_or(false),
    }
}

fn overlay_env(raw: &mut RawConfig) {
    if let Ok(depth) = std::env::var(ENV_DEPTH) {
        raw.depth = Some(depth);
    }
    if let Ok(max_size) = std::env::var(ENV_MAX_SIZE) {
        match max_size.parse::<u64>() {
            Ok(n) => raw.max_file_size = Some(n),
            Err(_) => tracing::warn!(value = %max_size, "Ignoring non-numeric ICU_MAX_SIZE"),
        }
    }
    if let Ok(no_db) = std::env::var(ENV_NO_DB) {
        raw.no_db = Some(matches!(
            no_db.to_lowercase().as_str(),
            "1" | "true" | "yes"
        ));
    }
    if let Ok(policy) = std::env::var(ENV_POLICY) {
        raw.policy_path = Some(policy);
    }
}

/// Walk up from `start` looking for `.icuignore`; first hit wins.
pub fn load_icuignore(start: Option<&Path>) -> Vec<String> {
    let Some(path) = walk_up(start, |dir| {
        let candidate = dir.join(IGNORE_FILENAME);
        candidate.is_file().then_some(candidate)
    }) else {
        return Vec::new();
    };
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    parse_icuignore(&content)
}

/// One glob per line; `#` comments and blank lines ignored.
pub fn parse_icuignore(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn discover_config(start: Option<&Path>) -> Option<PathBuf> {
    walk_up(start, |dir| {
        CONFIG_FILENAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    })
}

fn walk_up<F>(start: Option<&Path>, mut probe: F) -> Option<PathBuf>
where
    F: FnMut(&Path) -> Option<PathBuf>,
{
    let start = match start {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir().ok()?,
    };
    let mut current = start.as_path();
    loop {
        if let Some(found) = probe(current) {
            return Some(found);
        }
        current = current.parent()?;
    }
}

/// `~/.icu/config.yml`.
pub fn global_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".icu")
        .join("config.yml")
}

/// Best-effort YAML read; malformed or non-mapping files are ignored.
fn read_yaml_config(path: &Path) -> Option<RawConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    let value: Value = serde_yaml::from_str(&content).ok()?;
    if !value.is_mapping() {
        tracing::warn!(path = %path.display(), "Ignoring non-mapping config file");
        return None;
    }
    match serde_yaml::from_value(value) {
        Ok(raw) => Some(raw),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed config");
            None
        }
    }
}

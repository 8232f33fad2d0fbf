//! Tiered scan orchestrator.
//!
//! Per file: fast-path rejection, fingerprint, hash-cache lookup,
//! reputation short-circuit, heuristic pass, and a conditional deep
//! pass (entropy + deobfuscation). Directory scans traverse in sorted
//! order and fan files out to a bounded worker pool, returning results
//! in traversal order. Store writes are best-effort; a failure never
//! fails the scan.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::cache::HashCache;
use crate::deobfuscate::scan_deobfuscation;
use crate::entropy::{DEFAULT_ENTROPY_THRESHOLD, scan_entropy};
use crate::fingerprint::hash_file;
use crate::heuristics::HeuristicScanner;
use crate::model::{Finding, RiskLevel, ScanResult, Severity, aggregate_risk_level};
use crate::reputation::{ReputationStore, ScanType, Signature};
use crate::rules::CompiledRuleSet;

/// How much of the pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDepth {
    /// Heuristics only.
    Fast,
    /// Heuristics plus entropy and deobfuscation.
    Deep,
    /// Fast, escalating to deep when the fast pass finds anything.
    Auto,
}

impl ScanDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanDepth::Fast => "fast",
            ScanDepth::Deep => "deep",
            ScanDepth::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(ScanDepth::Fast),
            "deep" => Some(ScanDepth::Deep),
            "auto" => Some(ScanDepth::Auto),
            _ => None,
        }
    }
}

/// Extensions never scanned (binaries, media, archives).
pub const SKIP_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "so", "dylib", "dll", "exe", "png", "jpg", "jpeg", "gif", "ico", "svg", "woff",
    "woff2", "ttf", "eot", "zip", "tar", "gz", "bz2",
];

/// Directory names pruned from traversal and rejected per file.
pub const SKIP_DIRS: &[&str] = &["__pycache__", ".git", "node_modules", ".venv", ".tox"];

/// Skip rules shared by the orchestrator and the watcher: a skipped
/// extension or a skipped directory anywhere in the path.
pub fn should_skip_path(path: &Path) -> bool {
    if path
        .components()
        .any(|c| SKIP_DIRS.contains(&c.as_os_str().to_string_lossy().as_ref()))
    {
        return true;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => SKIP_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        None => false,
    }
}

#[derive(Debug, Clone)]
pub struct ScannerOptions {
    pub max_file_size: u64,
    /// fnmatch-style globs; a match rejects the file.
    pub exclude: Vec<String>,
    /// Worker cap for directory scans; capped at available parallelism.
    pub max_workers: Option<usize>,
    pub entropy_threshold: f64,
    pub cache_size: usize,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        ScannerOptions {
            max_file_size: crate::config::DEFAULT_MAX_FILE_SIZE,
            exclude: Vec::new(),
            max_workers: None,
            entropy_threshold: DEFAULT_ENTROPY_THRESHOLD,
            cache_size: crate::cache::DEFAULT_CACHE_SIZE,
        }
    }
}

/// Core scan orchestrator implementing the tiered pipeline.
pub struct Scanner {
    store: Option<Arc<ReputationStore>>,
    cache: HashCache,
    heuristic: HeuristicScanner,
    exclude: Vec<glob::Pattern>,
    max_file_size: u64,
    entropy_threshold: f64,
    workers: usize,
}

impl Scanner {
    /// Build a scanner, merging dynamic rules from the store (when
    /// attached) into the compiled set.
    pub fn new(store: Option<Arc<ReputationStore>>, options: ScannerOptions) -> Self {
        let dynamic = match &store {
            Some(store) => store.dynamic_rules().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Could not load dynamic rules, using static catalog");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let rules = CompiledRuleSet::with_dynamic(dynamic);

        let exclude = options
            .exclude
            .iter()
            .filter_map(|s| match glob::Pattern::new(s) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(pattern = %s, error = %e, "Skipping invalid exclude glob");
                    None
                }
            })
            .collect();

        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = options
            .max_workers
            .map_or(available, |cap| cap.min(available))
            .max(1);

        Scanner {
            store,
            cache: HashCache::new(options.cache_size),
            heuristic: HeuristicScanner::new(Arc::new(rules)),
            exclude,
            max_file_size: options.max_file_size,
            entropy_threshold: options.entropy_threshold,
            workers,
        }
    }

    /// Scanner with no reputation store and default options.
    pub fn with_defaults() -> Self {
        Scanner::new(None, ScannerOptions::default())
    }

    pub fn rules(&self) -> &CompiledRuleSet {
        self.heuristic.rules()
    }

    /// Scan a single file through the tiered pipeline.
    pub fn scan_file(&self, path: &Path, depth: ScanDepth) -> ScanResult {
        let start = Instant::now();
        let file_path = path.to_string_lossy().into_owned();

        // Stage 0: fast-path rejections produce a clean, hashless result
        if !path.is_file()
            || should_skip_path(path)
            || self.is_excluded(&file_path)
            || self.exceeds_size_cap(path)
        {
            return ScanResult::clean(file_path, elapsed_ms(start));
        }

        // Stage 1: fingerprint
        let sha256 = match hash_file(path) {
            Ok(digest) => digest,
            Err(e) => {
                tracing::warn!(path = %file_path, error = %e, "Could not hash file");
                return ScanResult::clean(file_path, elapsed_ms(start));
            }
        };

        // Stage 2: hash cache
        if let Some(prior) = self.cache.get(&sha256) {
            return ScanResult {
                file_path,
                risk_level: prior.risk_level,
                findings: prior.findings,
                sha256,
                scan_time_ms: elapsed_ms(start),
                cached: true,
            };
        }

        // Stage 3: reputation short-circuit
        if let Some(result) = self.check_reputation(&file_path, &sha256, start) {
            self.cache.put(&sha256, result.clone());
            return result;
        }

        // Stage 4: read content, replacing invalid UTF-8
        let content = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!(path = %file_path, error = %e, "Could not read file");
                return ScanResult {
                    file_path,
                    risk_level: RiskLevel::Clean,
                    findings: Vec::new(),
                    sha256,
                    scan_time_ms: elapsed_ms(start),
                    cached: false,
                };
            }
        };

        // Stage 5: fast scan
        let mut findings = self.heuristic.scan(&content, &file_path);

        // Stage 6: conditional deep scan
        let deep = depth == ScanDepth::Deep || (depth == ScanDepth::Auto && !findings.is_empty());
        if deep {
            findings.extend(scan_entropy(&content, &file_path, self.entropy_threshold));
            findings.extend(scan_deobfuscation(&content, &file_path, &self.heuristic));
        }

        // Stage 7: aggregate and record
        let risk_level = aggregate_risk_level(&findings);
        let result = ScanResult {
            file_path,
            risk_level,
            findings,
            sha256: sha256.clone(),
            scan_time_ms: elapsed_ms(start),
            cached: false,
        };
        self.cache.put(&sha256, result.clone());
        self.record(&result, if deep { ScanType::Deep } else { ScanType::Fast });

        result
    }

    /// Scan a directory recursively; results come back in traversal
    /// (sorted path) order even when produced concurrently.
    pub fn scan_directory(&self, path: &Path, depth: ScanDepth) -> Vec<ScanResult> {
        if !path.is_dir() {
            return vec![self.scan_file(path, depth)];
        }

        let mut files = Vec::new();
        collect_files(path, &mut files);
        files.retain(|p| !should_skip_path(p) && !self.is_excluded(&p.to_string_lossy()));
        files.sort();

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
        {
            Ok(pool) => pool.install(|| {
                files
                    .par_iter()
                    .map(|p| self.scan_file(p, depth))
                    .collect()
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Worker pool unavailable, scanning serially");
                files.iter().map(|p| self.scan_file(p, depth)).collect()
            }
        }
    }

    fn check_reputation(
        &self,
        file_path: &str,
        sha256: &str,
        start: Instant,
    ) -> Option<ScanResult> {
        let store = self.store.as_ref()?;
        let sig = match store.lookup(sha256) {
            Ok(sig) => sig?,
            Err(e) => {
                tracing::warn!(error = %e, "Reputation lookup failed, continuing without it");
                return None;
            }
        };

        if sig.risk_level == RiskLevel::Clean && !sig.flagged {
            return Some(ScanResult {
                file_path: file_path.to_string(),
                risk_level: RiskLevel::Clean,
                findings: Vec::new(),
                sha256: sha256.to_string(),
                scan_time_ms: elapsed_ms(start),
                cached: true,
            });
        }

        if sig.risk_level >= RiskLevel::High || sig.flagged {
            // line_number 0: the signature hit applies to the whole file
            let finding = Finding {
                rule_id: "DB-001".to_string(),
                description: "File hash matches known malicious signature".to_string(),
                severity: Severity::Critical,
                file_path: file_path.to_string(),
                line_number: 0,
                matched_text: sha256.to_string(),
                context: None,
            };
            return Some(ScanResult {
                file_path: file_path.to_string(),
                risk_level: RiskLevel::Critical,
                findings: vec![finding],
                sha256: sha256.to_string(),
                scan_time_ms: elapsed_ms(start),
                cached: true,
            });
        }

        None
    }

    fn record(&self, result: &ScanResult, scan_type: ScanType) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.record_signature(&Signature::new(&result.sha256, result.risk_level)) {
            tracing::warn!(error = %e, "Failed to record signature");
        }
        if let Err(e) = store.log_scan(
            &result.sha256,
            scan_type,
            result.risk_level,
            &result.findings,
            result.scan_time_ms,
        ) {
            tracing::warn!(error = %e, "Failed to append scan log");
        }
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(path))
    }

    fn exceeds_size_cap(&self, path: &Path) -> bool {
        path.metadata().map(|m| m.len()).unwrap_or(0) > self.max_file_size
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Recursive traversal pruning skipped directories.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::warn!(path = %dir.display(), "Could not read directory");
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let name = entry.file_name();
            if !SKIP_DIRS.contains(&name.to_string_lossy().as_ref()) {
                collect_files(&path, out);
            }
        } else if path.is_file() {
            out.push(path);
        }
    }
}

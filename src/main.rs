//! icu CLI.
//!
//! Binary entry point: clap parsing and output formatting. All scan
//! and policy decisions live in the library crate; this file maps
//! flags to library calls and library outcomes to exit codes
//! (0 = clean/log, 1 = medium/warn, 2 = high/block).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::{Parser, Subcommand};

use icu_firewall::config::{self, IcuConfig};
use icu_firewall::model::{ExitSignal, ScanResult, Severity};
use icu_firewall::policy::{PolicyEngine, PolicyResult};
use icu_firewall::policy_loader;
use icu_firewall::reputation::{ReputationStore, Signature, ThreatSignature};
use icu_firewall::rules::CATALOG;
use icu_firewall::scanner::{ScanDepth, Scanner, ScannerOptions};
use icu_firewall::watcher::{self, watch_directory};

#[derive(Parser, Debug)]
#[command(name = "icu")]
#[command(version)]
#[command(about = "AI supply-chain firewall: scan files for threats targeting AI coding assistants")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a file or directory for threats
    Scan(ScanArgs),
    /// Watch a directory and scan files as they change
    Watch(WatchArgs),
    /// List detection rules
    Rules(RulesArgs),
    /// Manage the scan policy
    Policy(PolicyArgs),
    /// Inspect and manage the reputation store
    Db(DbArgs),
}

#[derive(clap::Args, Debug)]
struct ScanArgs {
    /// File or directory to scan
    target: PathBuf,

    /// Scan depth: fast, deep, or auto (escalate if suspicious)
    #[arg(long, default_value = "auto")]
    depth: String,

    /// Output format: text or json
    #[arg(long, default_value = "text")]
    format: String,

    /// Disable the reputation store
    #[arg(long)]
    no_db: bool,

    /// Max file size in bytes (default 1048576)
    #[arg(long)]
    max_size: Option<u64>,

    /// Glob pattern to exclude (repeatable)
    #[arg(long)]
    exclude: Vec<String>,

    /// Worker thread cap for directory scans
    #[arg(long)]
    workers: Option<usize>,

    /// Policy YAML to evaluate results against
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Tool identity for policy tool_overrides
    #[arg(long)]
    tool: Option<String>,
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    /// Directory to watch
    target: PathBuf,

    /// Scan depth: fast, deep, or auto
    #[arg(long, default_value = "auto")]
    depth: String,

    /// Policy YAML to evaluate results against
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Disable the reputation store
    #[arg(long)]
    no_db: bool,
}

#[derive(clap::Args, Debug)]
struct RulesArgs {
    /// Filter by category
    #[arg(long)]
    category: Option<String>,

    /// Filter by severity
    #[arg(long)]
    severity: Option<String>,

    /// Regex search against rule id and description
    #[arg(long)]
    search: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PolicyArgs {
    #[command(subcommand)]
    command: PolicyCommand,
}

#[derive(Subcommand, Debug)]
enum PolicyCommand {
    /// Write a commented starter policy to .icu-policy.yml
    Init {
        /// Overwrite an existing policy file
        #[arg(long)]
        force: bool,
    },
    /// Load a policy file and report problems
    Check {
        /// Policy file to check
        file: PathBuf,
    },
    /// Print the effective policy (discovered or explicit)
    Show {
        /// Policy file to show; discovered when omitted
        file: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct DbArgs {
    /// Path to the reputation database (defaults to ~/.icu/reputation.db)
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: DbCommand,
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Look up a fingerprint
    Lookup { sha256: String },
    /// Flag a fingerprint as malicious
    Flag {
        sha256: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Aggregate store statistics
    Stats,
    /// Scan history for a fingerprint, newest first
    History {
        sha256: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Add a dynamic detection rule
    AddRule {
        #[arg(long)]
        name: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        pattern: String,
        #[arg(long, default_value = "warning")]
        severity: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List dynamic detection rules
    ListRules {
        #[arg(long)]
        category: Option<String>,
    },
    /// Remove a dynamic detection rule by id
    RemoveRule { id: i64 },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Scan(args) => run_scan(args),
        Command::Watch(args) => run_watch(args),
        Command::Rules(args) => run_rules(args),
        Command::Policy(args) => run_policy(args.command),
        Command::Db(args) => run_db(args),
    }
}

fn parse_depth(flag: &str, config: &IcuConfig) -> anyhow::Result<ScanDepth> {
    let depth = ScanDepth::parse(flag)
        .with_context(|| format!("invalid depth '{flag}' (expected fast, deep, or auto)"))?;
    // "auto" on the command line defers to the configured depth
    Ok(if depth == ScanDepth::Auto {
        config.depth
    } else {
        depth
    })
}

fn open_store(no_db: bool, path: Option<&Path>) -> Option<Arc<ReputationStore>> {
    if no_db {
        return None;
    }
    match ReputationStore::open(path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            eprintln!("warning: reputation store unavailable: {e}");
            None
        }
    }
}

fn load_engine(path: &Path) -> anyhow::Result<PolicyEngine> {
    let policy = policy_loader::load_policy(path, None)?;
    Ok(PolicyEngine::new(policy))
}

fn run_scan(args: ScanArgs) -> anyhow::Result<ExitCode> {
    let cfg = config::load_config(None);
    let depth = parse_depth(&args.depth, &cfg)?;
    if !args.target.exists() {
        anyhow::bail!("target does not exist: {}", args.target.display());
    }

    let mut exclude = args.exclude.clone();
    exclude.extend(cfg.exclude.iter().cloned());

    let store = open_store(args.no_db || cfg.no_db, None);
    let engine = match args.policy.as_deref().or(cfg.policy_path.as_deref()) {
        Some(path) => Some(load_engine(path)?),
        None => None,
    };

    let scanner = Scanner::new(
        store,
        ScannerOptions {
            max_file_size: args.max_size.unwrap_or(cfg.max_file_size),
            exclude,
            max_workers: args.workers,
            ..ScannerOptions::default()
        },
    );

    let results = if args.target.is_dir() {
        scanner.scan_directory(&args.target, depth)
    } else {
        vec![scanner.scan_file(&args.target, depth)]
    };

    let policy_results: Option<Vec<PolicyResult>> = engine.as_ref().map(|engine| {
        let prs: Vec<PolicyResult> = results
            .iter()
            .map(|r| engine.evaluate(r, args.tool.as_deref()))
            .collect();
        engine.log_violations(&results, &prs);
        prs
    });

    match args.format.as_str() {
        "json" => print_json(&results, policy_results.as_deref())?,
        "text" => print_text(&results, policy_results.as_deref()),
        other => anyhow::bail!("unknown format '{other}' (expected text or json)"),
    }

    // Policy action wins over the risk-based signal when a policy is active
    let code = match &policy_results {
        Some(prs) => prs.iter().map(|pr| pr.action.code()).max().unwrap_or(0),
        None => ExitSignal::from_results(&results).code(),
    };
    Ok(ExitCode::from(code))
}

fn run_watch(args: WatchArgs) -> anyhow::Result<ExitCode> {
    let cfg = config::load_config(None);
    let depth = parse_depth(&args.depth, &cfg)?;

    let store = open_store(args.no_db || cfg.no_db, None);
    let engine = match args.policy.as_deref().or(cfg.policy_path.as_deref()) {
        Some(path) => Some(load_engine(path)?),
        None => None,
    };
    let scanner = Scanner::new(store, ScannerOptions::default());

    println!(
        "Watching {} (depth={}, Ctrl+C to stop)",
        args.target.display(),
        depth.as_str()
    );

    let stop = AtomicBool::new(false);
    watch_directory(
        &args.target,
        &scanner,
        depth,
        |result| {
            if result.findings.is_empty() {
                return;
            }
            print_result_text(&result);
            if let Some(engine) = &engine {
                let pr = engine.evaluate(&result, None);
                engine.log_violations(
                    std::slice::from_ref(&result),
                    std::slice::from_ref(&pr),
                );
                print_policy_text(&pr);
            }
        },
        &stop,
        watcher::DEFAULT_DEBOUNCE,
    )?;

    Ok(ExitCode::SUCCESS)
}

fn run_rules(args: RulesArgs) -> anyhow::Result<ExitCode> {
    let search = match args.search.as_deref() {
        Some(s) => Some(
            regex::RegexBuilder::new(s)
                .case_insensitive(true)
                .build()
                .context("invalid --search regex")?,
        ),
        None => None,
    };

    let mut shown = 0;
    for rule in CATALOG.iter() {
        if let Some(category) = &args.category
            && rule.category.as_str() != category.as_str()
        {
            continue;
        }
        if let Some(severity) = &args.severity
            && rule.severity.as_str() != severity.as_str()
        {
            continue;
        }
        if let Some(re) = &search
            && !re.is_match(&rule.rule_id)
            && !re.is_match(&rule.description)
        {
            continue;
        }
        println!(
            "{:<8} {:<20} {:<9} {}",
            rule.rule_id,
            rule.category.as_str(),
            rule.severity.as_str(),
            rule.description
        );
        println!("{:<8} pattern: {}", "", rule.pattern);
        shown += 1;
    }
    println!("\nShowing {shown} of {} rules", CATALOG.len());
    Ok(ExitCode::SUCCESS)
}

fn run_policy(command: PolicyCommand) -> anyhow::Result<ExitCode> {
    match command {
        PolicyCommand::Init { force } => {
            let path = PathBuf::from(".icu-policy.yml");
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            std::fs::write(&path, policy_loader::default_policy_yaml())
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        PolicyCommand::Check { file } => {
            let policy = policy_loader::load_policy(&file, None)?;
            let warnings = policy_loader::validate_policy(&policy);
            if warnings.is_empty() {
                println!("{}: ok", file.display());
                Ok(ExitCode::SUCCESS)
            } else {
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                println!("{}: {} warning(s)", file.display(), warnings.len());
                Ok(ExitCode::from(1))
            }
        }
        PolicyCommand::Show { file } => {
            let path = match file {
                Some(path) => path,
                None => policy_loader::discover_policy_path(None)
                    .context("no policy file found (run `icu policy init`)")?,
            };
            let policy = policy_loader::load_policy(&path, None)?;
            println!("# {}", path.display());
            print!("{}", policy.to_yaml());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_db(args: DbArgs) -> anyhow::Result<ExitCode> {
    let store = ReputationStore::open(args.db_path.as_deref())?;
    match args.command {
        DbCommand::Lookup { sha256 } => match store.lookup(&sha256)? {
            Some(sig) => {
                print_signature(&sig);
                Ok(ExitCode::SUCCESS)
            }
            None => {
                println!("{sha256}: not found");
                Ok(ExitCode::from(1))
            }
        },
        DbCommand::Flag { sha256, notes } => {
            store.flag(&sha256, &notes)?;
            println!("Flagged {sha256}");
            Ok(ExitCode::SUCCESS)
        }
        DbCommand::Stats => {
            let stats = store.stats()?;
            println!("Signatures by risk level:");
            for (risk, count) in &stats.signatures_by_risk {
                println!("  {risk:<9} {count}");
            }
            println!("Flagged signatures: {}", stats.flagged_signatures);
            println!("Threat rules by category:");
            for (category, count) in &stats.threat_rules_by_category {
                println!("  {category:<20} {count}");
            }
            println!("Scan log rows: {}", stats.scan_log_rows);
            Ok(ExitCode::SUCCESS)
        }
        DbCommand::History { sha256, limit } => {
            let entries = store.scan_history(&sha256, limit)?;
            if entries.is_empty() {
                println!("{sha256}: no scan history");
                return Ok(ExitCode::from(1));
            }
            for entry in entries {
                println!(
                    "#{} {} {} {} ({:.1} ms)",
                    entry.id,
                    entry
                        .timestamp
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    entry.scan_type,
                    entry.result,
                    entry.duration_ms
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        DbCommand::AddRule {
            name,
            category,
            pattern,
            severity,
            description,
        } => {
            let severity = Severity::parse(&severity)
                .with_context(|| format!("invalid severity '{severity}'"))?;
            // Reject unusable patterns up front instead of at scan time
            regex::Regex::new(&pattern).context("invalid --pattern regex")?;
            let mut sig = ThreatSignature::new(name, category, pattern, severity);
            sig.description = description;
            let id = store.add_threat_signature(&sig)?;
            println!("Added rule TS-{id:03}");
            Ok(ExitCode::SUCCESS)
        }
        DbCommand::ListRules { category } => {
            let sigs = store.threat_signatures(category.as_deref())?;
            for sig in &sigs {
                println!(
                    "TS-{:03} {:<20} {:<9} {} ({})",
                    sig.id.unwrap_or(0),
                    sig.category,
                    sig.severity.as_str(),
                    sig.name,
                    sig.source
                );
                println!("       pattern: {}", sig.pattern);
            }
            println!("\n{} dynamic rule(s)", sigs.len());
            Ok(ExitCode::SUCCESS)
        }
        DbCommand::RemoveRule { id } => {
            if store.remove_threat_signature(id)? {
                println!("Removed rule TS-{id:03}");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("No rule with id {id}");
                Ok(ExitCode::from(1))
            }
        }
    }
}

fn print_signature(sig: &Signature) {
    println!("sha256:     {}", sig.sha256);
    println!("risk level: {}", sig.risk_level);
    println!("flagged:    {}", sig.flagged);
    println!("scan count: {}", sig.scan_count);
    if let Some(first) = sig.first_seen {
        println!("first seen: {first}");
    }
    if let Some(last) = sig.last_seen {
        println!("last seen:  {last}");
    }
    if !sig.notes.is_empty() {
        println!("notes:      {}", sig.notes);
    }
}

fn print_text(results: &[ScanResult], policy_results: Option<&[PolicyResult]>) {
    for (i, result) in results.iter().enumerate() {
        print_result_text(result);
        if let Some(prs) = policy_results {
            print_policy_text(&prs[i]);
        }
    }
    if results.len() > 1 {
        let clean = results
            .iter()
            .filter(|r| r.risk_level == icu_firewall::model::RiskLevel::Clean)
            .count();
        println!(
            "\n{} file(s) scanned, {} clean, {} with findings",
            results.len(),
            clean,
            results.len() - clean
        );
    }
}

fn print_result_text(result: &ScanResult) {
    let cached = if result.cached { " (cached)" } else { "" };
    println!(
        "{}: {}{} [{:.1} ms]",
        result.file_path, result.risk_level, cached, result.scan_time_ms
    );
    for finding in &result.findings {
        let line = if finding.line_number == 0 {
            "file".to_string()
        } else {
            format!("line {}", finding.line_number)
        };
        println!(
            "  [{}] {} {}: {}",
            finding.severity, finding.rule_id, line, finding.description
        );
        println!("      match: {}", finding.matched_text);
    }
}

fn print_policy_text(pr: &PolicyResult) {
    if pr.passed() {
        println!("  policy: log (passed)");
        return;
    }
    println!("  policy: {} ({} violation(s))", pr.action, pr.violations.len());
    for v in &pr.violations {
        println!("    [{}] {}: {}", v.severity, v.rule, v.description);
    }
}

fn print_json(results: &[ScanResult], policy_results: Option<&[PolicyResult]>) -> anyhow::Result<()> {
    use icu_firewall::model::RiskLevel;

    let rendered: Vec<serde_json::Value> = results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let mut value = serde_json::to_value(result)?;
            if let Some(prs) = policy_results
                && let Some(map) = value.as_object_mut()
            {
                map.insert("policy".to_string(), serde_json::to_value(&prs[i])?);
            }
            Ok(value)
        })
        .collect::<anyhow::Result<_>>()?;

    let output = serde_json::json!({
        "results": rendered,
        "summary": {
            "total_files": results.len(),
            "clean": results.iter().filter(|r| r.risk_level == RiskLevel::Clean).count(),
            "warnings": results
                .iter()
                .filter(|r| matches!(r.risk_level, RiskLevel::Low | RiskLevel::Medium))
                .count(),
            "critical": results
                .iter()
                .filter(|r| matches!(r.risk_level, RiskLevel::High | RiskLevel::Critical))
                .count(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

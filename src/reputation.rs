//! Durable reputation store: content signatures, dynamic threat rules,
//! and the append-only scan log.
//!
//! Single-file SQLite database in WAL mode. One connection is shared
//! across threads behind a mutex, which serializes writes; WAL keeps
//! readers in other processes unblocked. All writes from the scan path
//! are best-effort: the orchestrator logs and continues when the store
//! is unavailable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{Finding, RiskLevel, Severity};
use crate::rules::{DetectionRule, RuleCategory};

/// Environment variable overriding the store path.
pub const ENV_DB_PATH: &str = "ICU_DB_PATH";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS signatures (
    sha256          TEXT PRIMARY KEY,
    name            TEXT,
    version         TEXT,
    source_url      TEXT,
    first_seen      DATETIME DEFAULT CURRENT_TIMESTAMP,
    last_seen       DATETIME DEFAULT CURRENT_TIMESTAMP,
    risk_level      TEXT CHECK(
        risk_level IN ('clean','low','medium','high','critical')
    ),
    scan_count      INTEGER DEFAULT 1,
    community_votes INTEGER DEFAULT 0,
    flagged         BOOLEAN DEFAULT FALSE,
    notes           TEXT
);

CREATE TABLE IF NOT EXISTS threat_signatures (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    category        TEXT NOT NULL,
    pattern         TEXT NOT NULL,
    severity        TEXT CHECK(severity IN ('info','warning','danger','critical')),
    description     TEXT,
    added_date      DATETIME DEFAULT CURRENT_TIMESTAMP,
    source          TEXT DEFAULT 'local'
);

CREATE TABLE IF NOT EXISTS behavioral_profiles (
    sha256          TEXT PRIMARY KEY,
    syscalls        TEXT,
    network_hosts   TEXT,
    files_accessed  TEXT,
    profile_date    DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (sha256) REFERENCES signatures(sha256)
);

CREATE TABLE IF NOT EXISTS scan_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    sha256          TEXT,
    scan_type       TEXT,
    result          TEXT,
    findings_json   TEXT,
    duration_ms     REAL,
    timestamp       DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_signatures_risk ON signatures(risk_level);
CREATE INDEX IF NOT EXISTS idx_threat_sigs_category ON threat_signatures(category);
CREATE INDEX IF NOT EXISTS idx_scan_log_timestamp ON scan_log(timestamp);
";

const SEED_SIGNATURES: &str = include_str!("seed_signatures.yml");
const SQLITE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reputation record for one content fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub sha256: String,
    pub name: String,
    pub version: String,
    pub source_url: String,
    pub first_seen: Option<NaiveDateTime>,
    pub last_seen: Option<NaiveDateTime>,
    pub risk_level: RiskLevel,
    pub scan_count: i64,
    pub community_votes: i64,
    pub flagged: bool,
    pub notes: String,
}

impl Signature {
    pub fn new(sha256: impl Into<String>, risk_level: RiskLevel) -> Self {
        Signature {
            sha256: sha256.into(),
            name: String::new(),
            version: String::new(),
            source_url: String::new(),
            first_seen: None,
            last_seen: None,
            risk_level,
            scan_count: 1,
            community_votes: 0,
            flagged: false,
            notes: String::new(),
        }
    }

    pub fn flagged(mut self, flagged: bool) -> Self {
        self.flagged = flagged;
        self
    }
}

/// Dynamic detection rule stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreatSignature {
    pub id: Option<i64>,
    pub name: String,
    pub category: String,
    pub pattern: String,
    pub severity: Severity,
    pub description: String,
    pub added_date: Option<NaiveDateTime>,
    pub source: String,
}

impl ThreatSignature {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        pattern: impl Into<String>,
        severity: Severity,
    ) -> Self {
        ThreatSignature {
            id: None,
            name: name.into(),
            category: category.into(),
            pattern: pattern.into(),
            severity,
            description: String::new(),
            added_date: None,
            source: "local".to_string(),
        }
    }

    /// Convert to a detection rule with a zero-padded `TS-NNN` id.
    ///
    /// Returns `None` when the stored pattern is not a valid regex; the
    /// caller logs and drops it.
    pub fn to_rule(&self) -> Option<DetectionRule> {
        if let Err(e) = regex::RegexBuilder::new(&self.pattern)
            .case_insensitive(true)
            .build()
        {
            tracing::warn!(
                id = ?self.id,
                name = %self.name,
                error = %e,
                "Invalid regex in threat signature"
            );
            return None;
        }

        let rule_id = match self.id {
            Some(id) => format!("TS-{id:03}"),
            None => "TS-000".to_string(),
        };
        let description = if self.description.starts_with("[dynamic]") {
            self.description.clone()
        } else {
            format!("[dynamic] {}", self.description)
        };

        Some(DetectionRule {
            rule_id,
            category: RuleCategory::parse(&self.category),
            severity: self.severity,
            pattern: self.pattern.clone(),
            description,
        })
    }
}

/// How much of the pipeline ran for a logged scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Fast,
    Deep,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Fast => "fast",
            ScanType::Deep => "deep",
        }
    }
}

/// One append-only scan log row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanLogEntry {
    pub id: i64,
    pub sha256: String,
    pub scan_type: String,
    pub result: RiskLevel,
    pub findings_json: Option<String>,
    pub duration_ms: f64,
    pub timestamp: Option<NaiveDateTime>,
}

/// Aggregate counts over the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub signatures_by_risk: BTreeMap<String, i64>,
    pub flagged_signatures: i64,
    pub threat_rules_by_category: BTreeMap<String, i64>,
    pub scan_log_rows: i64,
}

#[derive(Debug, Deserialize)]
struct SeedEntry {
    name: String,
    category: String,
    pattern: String,
    severity: Option<String>,
    description: Option<String>,
    source: Option<String>,
}

/// SQLite-backed reputation store.
#[derive(Debug)]
pub struct ReputationStore {
    conn: Mutex<Connection>,
}

impl ReputationStore {
    /// Open (creating if needed) the store at `path`, or at the
    /// canonical per-user path when `None`. Seeds the default threat
    /// signatures when the table is empty.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::Io {
                context: format!("creating {}", parent.display()),
                source,
            })?;
        }

        let conn = Connection::open(&path)?;
        // journal_mode returns the new mode as a row
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch(SCHEMA)?;

        let store = ReputationStore {
            conn: Mutex::new(conn),
        };
        if store.count_threat_signatures()? == 0 {
            let seeded = store.seed_default_signatures()?;
            tracing::debug!(count = seeded, "Seeded default threat signatures");
        }
        Ok(store)
    }

    /// Canonical store path: `$ICU_DB_PATH`, else `~/.icu/reputation.db`.
    pub fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var(ENV_DB_PATH) {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".icu")
            .join("reputation.db")
    }

    // -- Signatures --

    pub fn lookup(&self, sha256: &str) -> Result<Option<Signature>> {
        let conn = self.conn.lock().expect("store mutex");
        let sig = conn
            .query_row(
                "SELECT sha256, name, version, source_url, first_seen, last_seen,
                        risk_level, scan_count, community_votes, flagged, notes
                 FROM signatures WHERE sha256 = ?1",
                params![sha256],
                |row| {
                    Ok(Signature {
                        sha256: row.get(0)?,
                        name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        version: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        source_url: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        first_seen: parse_timestamp(row.get::<_, Option<String>>(4)?),
                        last_seen: parse_timestamp(row.get::<_, Option<String>>(5)?),
                        risk_level: row
                            .get::<_, Option<String>>(6)?
                            .and_then(|s| RiskLevel::parse(&s))
                            .unwrap_or(RiskLevel::Clean),
                        scan_count: row.get::<_, Option<i64>>(7)?.unwrap_or(1),
                        community_votes: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
                        flagged: row.get::<_, Option<bool>>(9)?.unwrap_or(false),
                        notes: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(sig)
    }

    /// Insert or refresh a signature. On conflict the verdict fields
    /// are overwritten, `last_seen` refreshed, and `scan_count`
    /// incremented.
    pub fn record_signature(&self, sig: &Signature) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO signatures
                 (sha256, name, version, source_url,
                  risk_level, scan_count, flagged, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(sha256) DO UPDATE SET
                 last_seen = CURRENT_TIMESTAMP,
                 scan_count = scan_count + 1,
                 risk_level = excluded.risk_level,
                 flagged = excluded.flagged,
                 notes = excluded.notes",
            params![
                sig.sha256,
                sig.name,
                sig.version,
                sig.source_url,
                sig.risk_level.as_str(),
                sig.scan_count,
                sig.flagged,
                sig.notes,
            ],
        )?;
        Ok(())
    }

    /// Mark a fingerprint as flagged, creating a critical signature if
    /// it was never seen.
    pub fn flag(&self, sha256: &str, notes: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO signatures (sha256, risk_level, flagged, notes)
             VALUES (?1, 'critical', TRUE, ?2)
             ON CONFLICT(sha256) DO UPDATE SET
                 flagged = TRUE,
                 notes = excluded.notes,
                 last_seen = CURRENT_TIMESTAMP",
            params![sha256, notes],
        )?;
        Ok(())
    }

    /// Clean verdict on record and not flagged.
    pub fn is_known_good(&self, sha256: &str) -> Result<bool> {
        Ok(self
            .lookup(sha256)?
            .is_some_and(|s| s.risk_level == RiskLevel::Clean && !s.flagged))
    }

    /// High/critical verdict on record, or flagged.
    pub fn is_known_bad(&self, sha256: &str) -> Result<bool> {
        Ok(self
            .lookup(sha256)?
            .is_some_and(|s| s.risk_level >= RiskLevel::High || s.flagged))
    }

    // -- Scan log --

    pub fn log_scan(
        &self,
        sha256: &str,
        scan_type: ScanType,
        result: RiskLevel,
        findings: &[Finding],
        duration_ms: f64,
    ) -> Result<()> {
        let findings_json = if findings.is_empty() {
            None
        } else {
            serde_json::to_string(findings).ok()
        };
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO scan_log (sha256, scan_type, result, findings_json, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sha256,
                scan_type.as_str(),
                result.as_str(),
                findings_json,
                duration_ms,
            ],
        )?;
        Ok(())
    }

    /// Scan log rows for a fingerprint, newest first.
    pub fn scan_history(&self, sha256: &str, limit: usize) -> Result<Vec<ScanLogEntry>> {
        let conn = self.conn.lock().expect("store mutex");
        let mut stmt = conn.prepare(
            "SELECT id, sha256, scan_type, result, findings_json, duration_ms, timestamp
             FROM scan_log
             WHERE sha256 = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![sha256, limit as i64], |row| {
            Ok(ScanLogEntry {
                id: row.get(0)?,
                sha256: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                scan_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                result: row
                    .get::<_, Option<String>>(3)?
                    .and_then(|s| RiskLevel::parse(&s))
                    .unwrap_or(RiskLevel::Clean),
                findings_json: row.get(4)?,
                duration_ms: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                timestamp: parse_timestamp(row.get::<_, Option<String>>(6)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -- Threat signatures --

    pub fn add_threat_signature(&self, sig: &ThreatSignature) -> Result<i64> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO threat_signatures
                 (name, category, pattern, severity, description, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sig.name,
                sig.category,
                sig.pattern,
                sig.severity.as_str(),
                sig.description,
                sig.source,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn threat_signatures(&self, category: Option<&str>) -> Result<Vec<ThreatSignature>> {
        let conn = self.conn.lock().expect("store mutex");
        let (sql, filter) = match category {
            Some(c) => (
                "SELECT id, name, category, pattern, severity, description, added_date, source
                 FROM threat_signatures WHERE category = ?1 ORDER BY id",
                Some(c),
            ),
            None => (
                "SELECT id, name, category, pattern, severity, description, added_date, source
                 FROM threat_signatures ORDER BY id",
                None,
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let map = |row: &rusqlite::Row<'_>| {
            Ok(ThreatSignature {
                id: row.get(0)?,
                name: row.get(1)?,
                category: row.get(2)?,
                pattern: row.get(3)?,
                severity: row
                    .get::<_, Option<String>>(4)?
                    .and_then(|s| Severity::parse(&s))
                    .unwrap_or(Severity::Warning),
                description: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                added_date: parse_timestamp(row.get::<_, Option<String>>(6)?),
                source: row
                    .get::<_, Option<String>>(7)?
                    .unwrap_or_else(|| "local".to_string()),
            })
        };
        let rows = match filter {
            Some(c) => stmt.query_map(params![c], map)?,
            None => stmt.query_map([], map)?,
        };
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn remove_threat_signature(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("store mutex");
        let changed = conn.execute("DELETE FROM threat_signatures WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn count_threat_signatures(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("store mutex");
        let count = conn.query_row("SELECT COUNT(*) FROM threat_signatures", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Dynamic detection rules for the scanner: every stored threat
    /// signature whose pattern compiles.
    pub fn dynamic_rules(&self) -> Result<Vec<DetectionRule>> {
        Ok(self
            .threat_signatures(None)?
            .iter()
            .filter_map(ThreatSignature::to_rule)
            .collect())
    }

    /// Import threat signatures from a YAML document with a top-level
    /// `signatures` list. A malformed entry is skipped with a warning;
    /// only an unparseable document or a missing list is an error.
    /// Returns the number imported.
    pub fn import_signatures_yaml(&self, content: &str, source: &str) -> Result<usize> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| Error::SignatureImport {
                path: PathBuf::from("<inline>"),
                reason: e.to_string(),
            })?;
        let Some(entries) = doc.get("signatures").and_then(|v| v.as_sequence()) else {
            return Err(Error::SignatureImport {
                path: PathBuf::from("<inline>"),
                reason: "missing top-level 'signatures' list".to_string(),
            });
        };

        let mut imported = 0;
        for raw in entries {
            let entry: SeedEntry = match serde_yaml::from_value(raw.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed threat signature entry");
                    continue;
                }
            };
            let severity = entry
                .severity
                .as_deref()
                .and_then(Severity::parse)
                .unwrap_or(Severity::Warning);
            let sig = ThreatSignature {
                id: None,
                name: entry.name,
                category: entry.category,
                pattern: entry.pattern,
                severity,
                description: entry.description.unwrap_or_default(),
                added_date: None,
                source: entry.source.unwrap_or_else(|| source.to_string()),
            };
            match self.add_threat_signature(&sig) {
                Ok(_) => imported += 1,
                Err(e) => {
                    tracing::warn!(name = %sig.name, error = %e, "Skipping threat signature");
                }
            }
        }
        Ok(imported)
    }

    fn seed_default_signatures(&self) -> Result<usize> {
        self.import_signatures_yaml(SEED_SIGNATURES, "seed")
    }

    // -- Stats --

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().expect("store mutex");
        let mut stats = StoreStats::default();

        let mut stmt = conn.prepare(
            "SELECT risk_level, COUNT(*) FROM signatures
             WHERE risk_level IS NOT NULL GROUP BY risk_level",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (risk, count) = row?;
            stats.signatures_by_risk.insert(risk, count);
        }

        stats.flagged_signatures =
            conn.query_row("SELECT COUNT(*) FROM signatures WHERE flagged", [], |row| {
                row.get(0)
            })?;

        let mut stmt =
            conn.prepare("SELECT category, COUNT(*) FROM threat_signatures GROUP BY category")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (category, count) = row?;
            stats.threat_rules_by_category.insert(category, count);
        }

        stats.scan_log_rows =
            conn.query_row("SELECT COUNT(*) FROM scan_log", [], |row| row.get(0))?;

        Ok(stats)
    }
}

fn parse_timestamp(value: Option<String>) -> Option<NaiveDateTime> {
    let value = value?;
    NaiveDateTime::parse_from_str(&value, SQLITE_TIME_FORMAT).ok()
}

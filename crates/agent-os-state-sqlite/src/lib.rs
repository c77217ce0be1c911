#![forbid(unsafe_code)]

//! Durable evidence store: append-only JSON Lines event logs as the source of
//! truth, a small SQLite index for latest-per-key and window queries, and a
//! content-addressed artifact area under `artifacts/<2-hex>/<sha256>`.
//!
//! Layout under the state root:
//!
//! ```text
//! events/*.jsonl      append-only, one schema-versioned event per line
//! index.db            SQLite index (WAL), append-only tables have triggers
//! artifacts/ab/<sha>  immutable content-addressed artifact bytes
//! backups/<name>/     manifest-verified backups
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use agent_os_domain::{
    format_rfc3339, hash_bytes, now_utc, ArtifactKind, ArtifactRef, AttemptStatus, BreakerRecord,
    DateTimeUtc, DeliveryBundle, EvaluationRecord, ExecutionAttempt, ExecutionPlan,
    FeedbackRecord, OverrideSnapshot, ReplayRecord, RunId, RunSummary, TaskId, TaskKind, TaskSpec,
    TelemetryEvent,
};
use agent_os_state_core::{
    BackupFileEntry, BackupManifest, FailureCluster, StateStore, StrategyWindowStats,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
  task_id TEXT PRIMARY KEY,
  task_kind TEXT NOT NULL,
  entered_at TEXT NOT NULL,
  payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS plans (
  run_id TEXT PRIMARY KEY,
  task_kind TEXT NOT NULL,
  payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attempts (
  attempt_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  rank INTEGER NOT NULL,
  strategy_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('succeeded','failed','skipped','aborted')),
  error_kind TEXT,
  started_at TEXT NOT NULL,
  latency_ms INTEGER NOT NULL,
  payload_json TEXT NOT NULL,
  UNIQUE(run_id, rank)
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  task_id TEXT NOT NULL,
  task_kind TEXT NOT NULL,
  outcome TEXT NOT NULL,
  chosen_strategy TEXT,
  sealed_at TEXT NOT NULL,
  payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bundles (
  run_id TEXT PRIMARY KEY,
  payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback (
  feedback_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  submitted_at TEXT NOT NULL,
  processed INTEGER NOT NULL CHECK (processed IN (0,1)),
  payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evaluations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  strategy_id TEXT NOT NULL,
  task_kind TEXT NOT NULL,
  window_end TEXT NOT NULL,
  payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS override_snapshots (
  snapshot_id TEXT PRIMARY KEY,
  applied_at TEXT NOT NULL,
  payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS breakers (
  key TEXT PRIMARY KEY,
  state TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS telemetry (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts TEXT NOT NULL,
  module TEXT NOT NULL,
  action TEXT NOT NULL,
  status TEXT NOT NULL,
  error_code TEXT,
  run_id TEXT,
  payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS replay (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  step_id INTEGER NOT NULL,
  payload_json TEXT NOT NULL,
  UNIQUE(run_id, step_id)
);

CREATE INDEX IF NOT EXISTS idx_attempts_run_rank ON attempts(run_id, rank);
CREATE INDEX IF NOT EXISTS idx_attempts_started ON attempts(started_at);
CREATE INDEX IF NOT EXISTS idx_runs_kind_sealed ON runs(task_kind, sealed_at);
CREATE INDEX IF NOT EXISTS idx_feedback_processed ON feedback(processed, submitted_at);
CREATE INDEX IF NOT EXISTS idx_evaluations_strategy ON evaluations(strategy_id, window_end);
CREATE INDEX IF NOT EXISTS idx_telemetry_ts ON telemetry(ts);

CREATE TRIGGER IF NOT EXISTS trg_attempts_no_update
BEFORE UPDATE ON attempts
BEGIN
  SELECT RAISE(FAIL, 'attempts is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_attempts_no_delete
BEFORE DELETE ON attempts
BEGIN
  SELECT RAISE(FAIL, 'attempts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_no_update
BEFORE UPDATE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_override_snapshots_no_update
BEFORE UPDATE ON override_snapshots
BEGIN
  SELECT RAISE(FAIL, 'override_snapshots is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_override_snapshots_no_delete
BEFORE DELETE ON override_snapshots
BEGIN
  SELECT RAISE(FAIL, 'override_snapshots is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_telemetry_no_update
BEFORE UPDATE ON telemetry
BEGIN
  SELECT RAISE(FAIL, 'telemetry is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_telemetry_no_delete
BEFORE DELETE ON telemetry
BEGIN
  SELECT RAISE(FAIL, 'telemetry is append-only');
END;
";

/// Event-log file names under `events/`.
const LOG_TASKS: &str = "tasks.jsonl";
const LOG_PLANS: &str = "plans.jsonl";
const LOG_ATTEMPTS: &str = "attempts.jsonl";
const LOG_RUNS: &str = "runs.jsonl";
const LOG_BUNDLES: &str = "bundles.jsonl";
const LOG_FEEDBACK: &str = "feedback.jsonl";
const LOG_EVALUATIONS: &str = "evaluations.jsonl";
const LOG_OVERRIDES: &str = "override_snapshots.jsonl";
const LOG_TELEMETRY: &str = "telemetry.jsonl";
const LOG_REPLAY: &str = "replay.jsonl";

pub struct SqliteStateStore {
    root: PathBuf,
    conn: Mutex<Connection>,
    log_guard: Mutex<()>,
}

impl SqliteStateStore {
    /// Open (or create) a state root and its SQLite index.
    ///
    /// # Errors
    /// Returns an error when directories cannot be created or the database
    /// cannot be opened.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("events"))
            .with_context(|| format!("failed to create events dir under {}", root.display()))?;
        fs::create_dir_all(root.join("artifacts"))?;
        let conn = Connection::open(root.join("index.db"))
            .with_context(|| format!("failed to open sqlite index at {}", root.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        Ok(Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
            log_guard: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state store writer lock poisoned"))
    }

    /// Appends one schema-versioned line to an event log. Writers are
    /// serialized; each line is a complete JSON document terminated by LF.
    fn append_log<T: Serialize>(&self, file: &str, schema: &str, record: &T) -> Result<()> {
        let _guard = self
            .log_guard
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        let line = serde_json::to_string(&serde_json::json!({
            "schema": schema,
            "record": record,
        }))?;
        let path = self.root.join("events").join(file);
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        handle.write_all(line.as_bytes())?;
        handle.write_all(b"\n")?;
        handle.sync_data()?;
        Ok(())
    }

    fn artifact_path(&self, sha256: &str) -> PathBuf {
        let shard = &sha256[..2.min(sha256.len())];
        self.root.join("artifacts").join(shard).join(sha256)
    }

    /// Write a manifest-verified backup of the whole evidence tree.
    ///
    /// # Errors
    /// Returns an error when any file cannot be copied or hashed.
    pub fn backup(&self, name: &str) -> Result<PathBuf> {
        let target = self.root.join("backups").join(name);
        fs::create_dir_all(&target)?;
        let mut entries = Vec::new();
        for relative in self.backup_candidates()? {
            let source = self.root.join(&relative);
            let bytes = fs::read(&source)
                .with_context(|| format!("failed to read {}", source.display()))?;
            let destination = target.join(&relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&destination, &bytes)?;
            entries.push(BackupFileEntry {
                relative_path: relative,
                sha256: hash_bytes(&bytes),
                size_bytes: bytes.len() as u64,
            });
        }
        entries.sort();
        let manifest = BackupManifest {
            schema_version: SCHEMA_VERSION,
            created_at: now_utc(),
            files: entries,
        };
        fs::write(
            target.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        Ok(target)
    }

    /// Verify a backup's manifest: schema version fingerprint plus per-file
    /// content hashes.
    ///
    /// # Errors
    /// Returns an error describing the first integrity violation found.
    pub fn verify_backup(backup_dir: &Path) -> Result<BackupManifest> {
        let raw = fs::read_to_string(backup_dir.join("manifest.json"))
            .with_context(|| format!("missing manifest in {}", backup_dir.display()))?;
        let manifest: BackupManifest = serde_json::from_str(&raw)?;
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(anyhow!(
                "backup schema version {} does not match runtime schema {SCHEMA_VERSION}",
                manifest.schema_version
            ));
        }
        for entry in &manifest.files {
            let path = backup_dir.join(&entry.relative_path);
            let bytes = fs::read(&path)
                .with_context(|| format!("backup file missing: {}", path.display()))?;
            let digest = hash_bytes(&bytes);
            if digest != entry.sha256 {
                return Err(anyhow!(
                    "integrity mismatch for {}: expected {}, found {digest}",
                    entry.relative_path,
                    entry.sha256
                ));
            }
        }
        Ok(manifest)
    }

    fn backup_candidates(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let events = self.root.join("events");
        if events.is_dir() {
            for entry in fs::read_dir(&events)? {
                let entry = entry?;
                if entry.path().is_file() {
                    out.push(format!("events/{}", entry.file_name().to_string_lossy()));
                }
            }
        }
        let artifacts = self.root.join("artifacts");
        let mut stack = vec![artifacts.clone()];
        while let Some(current) = stack.pop() {
            if !current.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&current)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    out.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn rfc3339(value: DateTimeUtc) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!("{err}"))
}

fn payload_from_row<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|err| anyhow!("corrupt index payload: {err}"))
}

impl StateStore for SqliteStateStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply state schema")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, rfc3339(now_utc())?],
        )
        .context("failed to record migration")?;
        Ok(())
    }

    fn insert_task(&self, task: &TaskSpec) -> Result<()> {
        self.append_log(LOG_TASKS, "task.v1", task)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO tasks(task_id, task_kind, entered_at, payload_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                task.task_id.to_string(),
                task.task_kind.as_str(),
                rfc3339(task.entered_at)?,
                serde_json::to_string(task)?,
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, task_id: TaskId) -> Result<Option<TaskSpec>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM tasks WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| payload_from_row(&value)).transpose()
    }

    fn append_plan(&self, plan: &ExecutionPlan) -> Result<()> {
        self.append_log(LOG_PLANS, "plan.v1", plan)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO plans(run_id, task_kind, payload_json) VALUES (?1, ?2, ?3)",
            params![
                plan.run_id.to_string(),
                plan.task_kind.as_str(),
                serde_json::to_string(plan)?,
            ],
        )?;
        Ok(())
    }

    fn get_plan(&self, run_id: RunId) -> Result<Option<ExecutionPlan>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM plans WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| payload_from_row(&value)).transpose()
    }

    fn append_attempt(&self, attempt: &ExecutionAttempt) -> Result<()> {
        self.append_log(LOG_ATTEMPTS, "attempt.v1", attempt)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO attempts(
                attempt_id, run_id, rank, strategy_id, status, error_kind,
                started_at, latency_ms, payload_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                attempt.attempt_id.to_string(),
                attempt.run_id.to_string(),
                attempt.rank as i64,
                attempt.strategy_id,
                attempt.status.as_str(),
                attempt.error_kind.map(agent_os_domain::ErrorKind::as_str),
                rfc3339(attempt.started_at)?,
                attempt.telemetry.latency_ms as i64,
                serde_json::to_string(attempt)?,
            ],
        )
        .context("failed to index attempt")?;
        Ok(())
    }

    fn list_attempts(&self, run_id: RunId) -> Result<Vec<ExecutionAttempt>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM attempts WHERE run_id = ?1 ORDER BY rank ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn attempts_in_window(
        &self,
        start: DateTimeUtc,
        end: DateTimeUtc,
    ) -> Result<Vec<ExecutionAttempt>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM attempts
             WHERE started_at >= ?1 AND started_at < ?2
             ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map(params![rfc3339(start)?, rfc3339(end)?], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn seal_run(&self, summary: &RunSummary, bundle: &DeliveryBundle) -> Result<()> {
        bundle.validate().map_err(|err| anyhow!("{err}"))?;
        let mut referenced: Vec<&ArtifactRef> = bundle.supporting_artifacts.iter().collect();
        if let Some(primary) = &bundle.primary_artifact {
            referenced.push(primary);
        }
        for artifact in referenced {
            if !self.verify_artifact(artifact)? {
                return Err(anyhow!(
                    "artifact {} failed hash verification at seal time",
                    artifact.uri
                ));
            }
        }
        self.append_log(LOG_RUNS, "run_summary.v1", summary)?;
        self.append_log(LOG_BUNDLES, "delivery_bundle.v1", bundle)?;
        let task_kind = self
            .get_plan(summary.run_id)?
            .map_or(TaskKind::Other, |plan| plan.task_kind);
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO runs(
                run_id, task_id, task_kind, outcome, chosen_strategy, sealed_at, payload_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                summary.run_id.to_string(),
                summary.task_id.to_string(),
                task_kind.as_str(),
                summary.outcome.as_str(),
                summary.chosen_strategy,
                rfc3339(summary.sealed_at)?,
                serde_json::to_string(summary)?,
            ],
        )
        .context("failed to index run summary")?;
        conn.execute(
            "INSERT OR IGNORE INTO bundles(run_id, payload_json) VALUES (?1, ?2)",
            params![summary.run_id.to_string(), serde_json::to_string(bundle)?],
        )?;
        Ok(())
    }

    fn get_run_summary(&self, run_id: RunId) -> Result<Option<RunSummary>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| payload_from_row(&value)).transpose()
    }

    fn get_delivery_bundle(&self, run_id: RunId) -> Result<Option<DeliveryBundle>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM bundles WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| payload_from_row(&value)).transpose()
    }

    fn list_run_summaries(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM runs ORDER BY sealed_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit.max(1) as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn latest_run_for_kind(&self, task_kind: TaskKind) -> Result<Option<RunSummary>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM runs WHERE task_kind = ?1
                 ORDER BY sealed_at DESC LIMIT 1",
                params![task_kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| payload_from_row(&value)).transpose()
    }

    fn append_feedback(&self, record: &FeedbackRecord) -> Result<()> {
        record.validate().map_err(|err| anyhow!("{err}"))?;
        self.append_log(LOG_FEEDBACK, "feedback.v1", record)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO feedback(
                feedback_id, run_id, submitted_at, processed, payload_json
             ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.feedback_id,
                record.run_id.to_string(),
                rfc3339(record.submitted_at)?,
                i64::from(record.processed),
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    fn list_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM feedback ORDER BY submitted_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit.max(1) as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn unprocessed_feedback(&self) -> Result<Vec<FeedbackRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM feedback WHERE processed = 0 ORDER BY submitted_at ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn mark_feedback_processed(&self, feedback_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE feedback SET processed = 1 WHERE feedback_id = ?1",
            params![feedback_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("unknown feedback_id {feedback_id}"));
        }
        Ok(())
    }

    fn append_evaluation(&self, record: &EvaluationRecord) -> Result<()> {
        self.append_log(LOG_EVALUATIONS, "evaluation.v1", record)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO evaluations(strategy_id, task_kind, window_end, payload_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.strategy_id,
                record.task_kind.as_str(),
                rfc3339(record.window_end)?,
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    fn evaluations_for(
        &self,
        strategy_id: &str,
        since: DateTimeUtc,
    ) -> Result<Vec<EvaluationRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM evaluations
             WHERE strategy_id = ?1 AND window_end >= ?2
             ORDER BY window_end ASC",
        )?;
        let rows = stmt.query_map(params![strategy_id, rfc3339(since)?], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn list_evaluations(&self, since: DateTimeUtc) -> Result<Vec<EvaluationRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM evaluations WHERE window_end >= ?1
             ORDER BY window_end ASC",
        )?;
        let rows = stmt.query_map(params![rfc3339(since)?], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn append_override_snapshot(&self, snapshot: &OverrideSnapshot) -> Result<()> {
        self.append_log(LOG_OVERRIDES, "override_snapshot.v1", snapshot)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO override_snapshots(snapshot_id, applied_at, payload_json)
             VALUES (?1, ?2, ?3)",
            params![
                snapshot.snapshot_id.to_string(),
                rfc3339(snapshot.applied_at)?,
                serde_json::to_string(snapshot)?,
            ],
        )?;
        Ok(())
    }

    fn list_override_snapshots(&self) -> Result<Vec<OverrideSnapshot>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM override_snapshots ORDER BY applied_at ASC, snapshot_id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn upsert_breaker(&self, record: &BreakerRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO breakers(key, state, updated_at, payload_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at,
                payload_json = excluded.payload_json",
            params![
                record.key,
                record.state.as_str(),
                rfc3339(record.updated_at)?,
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    fn get_breaker(&self, key: &str) -> Result<Option<BreakerRecord>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM breakers WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| payload_from_row(&value)).transpose()
    }

    fn list_breakers(&self) -> Result<Vec<BreakerRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT payload_json FROM breakers ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn append_telemetry(&self, event: &TelemetryEvent) -> Result<()> {
        self.append_log(LOG_TELEMETRY, "telemetry.v1", event)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO telemetry(ts, module, action, status, error_code, run_id, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rfc3339(event.ts)?,
                event.module,
                event.action,
                event.status,
                event.error_code,
                event.run_id.map(|id| id.to_string()),
                serde_json::to_string(event)?,
            ],
        )?;
        Ok(())
    }

    fn telemetry_in_window(
        &self,
        start: DateTimeUtc,
        end: DateTimeUtc,
    ) -> Result<Vec<TelemetryEvent>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM telemetry WHERE ts >= ?1 AND ts < ?2 ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![rfc3339(start)?, rfc3339(end)?], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn append_replay(&self, record: &ReplayRecord) -> Result<()> {
        self.append_log(LOG_REPLAY, "replay.v1", record)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO replay(run_id, step_id, payload_json) VALUES (?1, ?2, ?3)",
            params![
                record.run_id.to_string(),
                i64::from(record.step_id),
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    fn list_replay(&self, run_id: RunId) -> Result<Vec<ReplayRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM replay WHERE run_id = ?1 ORDER BY step_id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(payload_from_row(&row?)?);
        }
        Ok(out)
    }

    fn put_artifact(
        &self,
        bytes: &[u8],
        kind: ArtifactKind,
        produced_by: &str,
        advisory: bool,
    ) -> Result<ArtifactRef> {
        let sha256 = hash_bytes(bytes);
        let path = self.artifact_path(&sha256);
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, bytes)
                .with_context(|| format!("failed to write artifact {}", path.display()))?;
        }
        let uri = format!("artifacts/{}/{sha256}", &sha256[..2]);
        Ok(ArtifactRef {
            uri,
            kind,
            sha256,
            size_bytes: bytes.len() as u64,
            produced_by: produced_by.to_string(),
            advisory,
        })
    }

    fn read_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let path = self.artifact_path(&artifact.sha256);
        fs::read(&path).with_context(|| format!("artifact missing: {}", path.display()))
    }

    fn verify_artifact(&self, artifact: &ArtifactRef) -> Result<bool> {
        let path = self.artifact_path(&artifact.sha256);
        if !path.exists() {
            return Ok(false);
        }
        let bytes = fs::read(&path)?;
        Ok(hash_bytes(&bytes) == artifact.sha256)
    }

    fn failure_hotspots(
        &self,
        start: DateTimeUtc,
        end: DateTimeUtc,
    ) -> Result<Vec<FailureCluster>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT strategy_id, error_kind, COUNT(*) AS n FROM attempts
             WHERE error_kind IS NOT NULL AND started_at >= ?1 AND started_at < ?2
             GROUP BY strategy_id, error_kind
             ORDER BY n DESC, strategy_id ASC",
        )?;
        let rows = stmt.query_map(params![rfc3339(start)?, rfc3339(end)?], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (strategy_id, error_kind, count) = row?;
            let Some(kind) = agent_os_domain::ErrorKind::parse(&error_kind) else {
                continue;
            };
            out.push(FailureCluster {
                strategy_id,
                error_kind: kind,
                count: usize::try_from(count).unwrap_or(usize::MAX),
            });
        }
        Ok(out)
    }

    fn strategy_window_stats(
        &self,
        start: DateTimeUtc,
        end: DateTimeUtc,
    ) -> Result<Vec<StrategyWindowStats>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT a.payload_json, p.task_kind FROM attempts a
             LEFT JOIN plans p ON p.run_id = a.run_id
             WHERE a.started_at >= ?1 AND a.started_at < ?2
             ORDER BY a.started_at ASC",
        )?;
        let rows = stmt.query_map(params![rfc3339(start)?, rfc3339(end)?], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
            ))
        })?;
        let mut grouped: BTreeMap<(String, TaskKind), StrategyWindowStats> = BTreeMap::new();
        for row in rows {
            let (raw, kind_raw) = row?;
            let attempt: ExecutionAttempt = payload_from_row(&raw)?;
            let task_kind = kind_raw
                .as_deref()
                .and_then(TaskKind::parse)
                .unwrap_or(TaskKind::Other);
            let entry = grouped
                .entry((attempt.strategy_id.clone(), task_kind))
                .or_insert_with(|| StrategyWindowStats {
                    strategy_id: attempt.strategy_id.clone(),
                    task_kind,
                    attempts: 0,
                    succeeded: 0,
                    failed: 0,
                    skipped: 0,
                    fallback_attempts: 0,
                    latencies_ms: Vec::new(),
                });
            entry.attempts += 1;
            match attempt.status {
                AttemptStatus::Succeeded => entry.succeeded += 1,
                AttemptStatus::Failed | AttemptStatus::Aborted => entry.failed += 1,
                AttemptStatus::Skipped => entry.skipped += 1,
            }
            if attempt.rank > 0 {
                entry.fallback_attempts += 1;
            }
            entry.latencies_ms.push(attempt.telemetry.latency_ms);
        }
        Ok(grouped.into_values().collect())
    }
}

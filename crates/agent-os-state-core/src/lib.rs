#![forbid(unsafe_code)]

//! The `StateStore` contract: durable, append-mostly persistence of runs,
//! attempts, artifacts, overrides, breaker state, feedback, and telemetry.
//! Components hold read-only views or append-only handles; nothing rewrites
//! a prior event in place.

use agent_os_domain::{
    ArtifactKind, ArtifactRef, BreakerRecord, DateTimeUtc, DeliveryBundle, ErrorKind,
    EvaluationRecord, ExecutionAttempt, ExecutionPlan, FeedbackRecord, OverrideSnapshot,
    ReplayRecord, RunId, RunSummary, TaskId, TaskKind, TaskSpec, TelemetryEvent,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One cluster in the failure-hotspot report: attempts in the window that
/// share a strategy and error kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureCluster {
    pub strategy_id: String,
    pub error_kind: ErrorKind,
    pub count: usize,
}

/// Raw per-strategy aggregate over a time window, the tuner's input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyWindowStats {
    pub strategy_id: String,
    pub task_kind: TaskKind,
    pub attempts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub fallback_attempts: usize,
    pub latencies_ms: Vec<u64>,
}

/// Integrity manifest written with every backup and verified on restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupManifest {
    pub schema_version: i64,
    pub created_at: DateTimeUtc,
    pub files: Vec<BackupFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct BackupFileEntry {
    pub relative_path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

pub trait StateStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_task(&self, task: &TaskSpec) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_task(&self, task_id: TaskId) -> Result<Option<TaskSpec>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_plan(&self, plan: &ExecutionPlan) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_plan(&self, run_id: RunId) -> Result<Option<ExecutionPlan>>;

    /// Attempts are persisted strictly in plan order, before the next
    /// candidate starts.
    #[allow(clippy::missing_errors_doc)]
    fn append_attempt(&self, attempt: &ExecutionAttempt) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_attempts(&self, run_id: RunId) -> Result<Vec<ExecutionAttempt>>;

    #[allow(clippy::missing_errors_doc)]
    fn attempts_in_window(
        &self,
        start: DateTimeUtc,
        end: DateTimeUtc,
    ) -> Result<Vec<ExecutionAttempt>>;

    /// Seals the terminal record and the delivery bundle for a run in one
    /// step. Artifact references are re-verified by the implementation
    /// before the summary lands.
    #[allow(clippy::missing_errors_doc)]
    fn seal_run(&self, summary: &RunSummary, bundle: &DeliveryBundle) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run_summary(&self, run_id: RunId) -> Result<Option<RunSummary>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_delivery_bundle(&self, run_id: RunId) -> Result<Option<DeliveryBundle>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_run_summaries(&self, limit: usize) -> Result<Vec<RunSummary>>;

    #[allow(clippy::missing_errors_doc)]
    fn latest_run_for_kind(&self, task_kind: TaskKind) -> Result<Option<RunSummary>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_feedback(&self, record: &FeedbackRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn unprocessed_feedback(&self) -> Result<Vec<FeedbackRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn mark_feedback_processed(&self, feedback_id: &str) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_evaluation(&self, record: &EvaluationRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn evaluations_for(
        &self,
        strategy_id: &str,
        since: DateTimeUtc,
    ) -> Result<Vec<EvaluationRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_evaluations(&self, since: DateTimeUtc) -> Result<Vec<EvaluationRecord>>;

    /// Override snapshots form an ordered, append-only log; the latest
    /// snapshot's set is the active set.
    #[allow(clippy::missing_errors_doc)]
    fn append_override_snapshot(&self, snapshot: &OverrideSnapshot) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_override_snapshots(&self) -> Result<Vec<OverrideSnapshot>>;

    #[allow(clippy::missing_errors_doc)]
    fn upsert_breaker(&self, record: &BreakerRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_breaker(&self, key: &str) -> Result<Option<BreakerRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_breakers(&self) -> Result<Vec<BreakerRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_telemetry(&self, event: &TelemetryEvent) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn telemetry_in_window(
        &self,
        start: DateTimeUtc,
        end: DateTimeUtc,
    ) -> Result<Vec<TelemetryEvent>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_replay(&self, record: &ReplayRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_replay(&self, run_id: RunId) -> Result<Vec<ReplayRecord>>;

    /// Store bytes in the content-addressed artifact area and return an
    /// immutable reference.
    #[allow(clippy::missing_errors_doc)]
    fn put_artifact(
        &self,
        bytes: &[u8],
        kind: ArtifactKind,
        produced_by: &str,
        advisory: bool,
    ) -> Result<ArtifactRef>;

    #[allow(clippy::missing_errors_doc)]
    fn read_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>>;

    /// True when the stored content still hash-matches the reference.
    #[allow(clippy::missing_errors_doc)]
    fn verify_artifact(&self, artifact: &ArtifactRef) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn failure_hotspots(
        &self,
        start: DateTimeUtc,
        end: DateTimeUtc,
    ) -> Result<Vec<FailureCluster>>;

    #[allow(clippy::missing_errors_doc)]
    fn strategy_window_stats(
        &self,
        start: DateTimeUtc,
        end: DateTimeUtc,
    ) -> Result<Vec<StrategyWindowStats>>;
}

#![forbid(unsafe_code)]

//! Core semantic types shared by every Agent OS crate: identifiers, task and
//! run envelopes, attempt records, delivery bundles, policy overrides, and the
//! hashing/time helpers the evidence chain is built on.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub Ulid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AttemptId(pub Ulid);

impl AttemptId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AttemptId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SnapshotId(pub Ulid);

impl SnapshotId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Presentation,
    Research,
    DataQuery,
    Image,
    Automation,
    Other,
}

impl TaskKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Presentation => "presentation",
            Self::Research => "research",
            Self::DataQuery => "data-query",
            Self::Image => "image",
            Self::Automation => "automation",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "presentation" => Some(Self::Presentation),
            "research" => Some(Self::Research),
            "data-query" => Some(Self::DataQuery),
            "image" => Some(Self::Image),
            "automation" => Some(Self::Automation),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Cli,
    Studio,
    Scheduler,
}

impl Origin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Studio => "studio",
            Self::Scheduler => "scheduler",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cli" => Some(Self::Cli),
            "studio" => Some(Self::Studio),
            "scheduler" => Some(Self::Scheduler),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Strict,
    Adaptive,
    Auto,
}

impl Profile {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Adaptive => "adaptive",
            Self::Auto => "auto",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "strict" => Some(Self::Strict),
            "adaptive" => Some(Self::Adaptive),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Risk tiers order low < medium < high so governance caps compare directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Maturity tiers order experimental < beta < stable; ranking prefers stable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Maturity {
    Experimental,
    Beta,
    Stable,
}

impl Maturity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Experimental => "experimental",
            Self::Beta => "beta",
            Self::Stable => "stable",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "experimental" => Some(Self::Experimental),
            "beta" => Some(Self::Beta),
            "stable" => Some(Self::Stable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Advisor,
    Operator,
}

impl ExecutionMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Advisor => "advisor",
            Self::Operator => "operator",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "advisor" => Some(Self::Advisor),
            "operator" => Some(Self::Operator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

impl AttemptStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// Run outcomes form a closed sum; clarification is a first-class outcome
/// rather than an error path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Degraded,
    Failed,
    Aborted,
    ClarificationNeeded,
}

impl RunOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::ClarificationNeeded => "clarification_needed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "degraded" => Some(Self::Degraded),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            "clarification_needed" => Some(Self::ClarificationNeeded),
            _ => None,
        }
    }
}

/// Stable error taxonomy. Values and their retry/fallback semantics are part
/// of the public contract and must not change between releases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingInput,
    GovernanceBlock,
    ApprovalRequired,
    PolicyViolation,
    ServiceUnavailable,
    ToolTimeout,
    ContractViolation,
    Backpressure,
    InternalError,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingInput => "missing_input",
            Self::GovernanceBlock => "governance_block",
            Self::ApprovalRequired => "approval_required",
            Self::PolicyViolation => "policy_violation",
            Self::ServiceUnavailable => "service_unavailable",
            Self::ToolTimeout => "tool_timeout",
            Self::ContractViolation => "contract_violation",
            Self::Backpressure => "backpressure",
            Self::InternalError => "internal_error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "missing_input" => Some(Self::MissingInput),
            "governance_block" => Some(Self::GovernanceBlock),
            "approval_required" => Some(Self::ApprovalRequired),
            "policy_violation" => Some(Self::PolicyViolation),
            "service_unavailable" => Some(Self::ServiceUnavailable),
            "tool_timeout" => Some(Self::ToolTimeout),
            "contract_violation" => Some(Self::ContractViolation),
            "backpressure" => Some(Self::Backpressure),
            "internal_error" => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Transient kinds are retried in place before the fallback pointer moves.
    #[must_use]
    pub fn retryable(self) -> bool {
        matches!(self, Self::ServiceUnavailable | Self::ToolTimeout)
    }

    /// Fatal kinds halt the run instead of advancing to the next candidate.
    #[must_use]
    pub fn fatal(self) -> bool {
        matches!(self, Self::PolicyViolation)
    }

    /// Kinds that mark an attempt skipped (eligibility, not failure).
    #[must_use]
    pub fn skips_attempt(self) -> bool {
        matches!(
            self,
            Self::MissingInput | Self::GovernanceBlock | Self::ApprovalRequired
        )
    }

    /// Stable process exit code for the operator surface.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::GovernanceBlock => 10,
            Self::MissingInput => 11,
            Self::ServiceUnavailable
            | Self::ToolTimeout
            | Self::ContractViolation
            | Self::InternalError => 12,
            Self::ApprovalRequired => 13,
            Self::PolicyViolation => 14,
            Self::Backpressure => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Json,
    Md,
    Html,
    Binary,
}

impl ArtifactKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Md => "md",
            Self::Html => "html",
            Self::Binary => "binary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(Self::Json),
            "md" => Some(Self::Md),
            "html" => Some(Self::Html),
            "binary" => Some(Self::Binary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Promote,
    Demote,
    CollectMoreData,
}

impl Recommendation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Demote => "demote",
            Self::CollectMoreData => "collect-more-data",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "promote" => Some(Self::Promote),
            "demote" => Some(Self::Demote),
            "collect-more-data" => Some(Self::CollectMoreData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum OverrideScope {
    Profile,
    Strategy,
    TaskKind,
}

impl OverrideScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Strategy => "strategy",
            Self::TaskKind => "task_kind",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "profile" => Some(Self::Profile),
            "strategy" => Some(Self::Strategy),
            "task_kind" => Some(Self::TaskKind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RetryOption {
    Strict,
    Adaptive,
    AllowHighRiskOnce,
}

impl RetryOption {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Adaptive => "adaptive",
            Self::AllowHighRiskOnce => "allow_high_risk_once",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

/// Immutable description of one user request. Created on ingress, never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub text: String,
    pub task_kind: TaskKind,
    pub language: String,
    pub intent: String,
    pub entered_at: DateTimeUtc,
    pub origin: Origin,
    pub explicit_params: BTreeMap<String, Value>,
}

impl TaskSpec {
    /// Validates ingress fields before the task enters the kernel.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] when the text is empty or the
    /// entry timestamp is not UTC.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.text.trim().is_empty() {
            return Err(DomainError::Validation(
                "task text MUST be non-empty".to_string(),
            ));
        }
        if self.entered_at.offset() != UtcOffset::UTC {
            return Err(DomainError::Validation(
                "entered_at MUST be UTC (offset Z)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Profile-bound execution envelope, immutable for the lifetime of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunContext {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub profile: Profile,
    pub resolved_profile: Profile,
    pub profile_source: String,
    pub allowed_layers: Vec<String>,
    pub blocked_maturity: Vec<Maturity>,
    pub max_risk_level: RiskLevel,
    pub allowed_strategies: Vec<String>,
    pub blocked_strategies: Vec<String>,
    pub deterministic: bool,
    pub learning_enabled: bool,
    pub max_fallback_steps: usize,
    pub trace_id: String,
}

impl RunContext {
    /// # Errors
    /// Returns [`DomainError::Validation`] when the fallback budget is zero
    /// or the resolved profile is still `auto`.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.max_fallback_steps == 0 {
            return Err(DomainError::Validation(
                "max_fallback_steps MUST be >= 1".to_string(),
            ));
        }
        if self.resolved_profile == Profile::Auto {
            return Err(DomainError::Validation(
                "resolved_profile MUST be strict or adaptive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ServiceBinding {
    pub service_name: String,
    pub version: String,
}

/// One way to satisfy the task, with its governance surface and scores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyCandidate {
    pub strategy_id: String,
    pub service_binding: ServiceBinding,
    pub base_score: f64,
    pub memory_score: f64,
    pub composite_score: f64,
    pub risk_level: RiskLevel,
    pub maturity: Maturity,
    pub required_layer: String,
    pub required_inputs: Vec<String>,
    pub score_detail: BTreeMap<String, Value>,
}

/// Ordered candidate list for one run. Carries no timestamps so that, given
/// identical overrides and history, serialization is byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub run_id: RunId,
    pub task_kind: TaskKind,
    pub profile: Profile,
    pub candidates: Vec<StrategyCandidate>,
    pub ambiguous: bool,
    pub score_gap: f64,
}

/// Structured plan/execute/verify/improve closure appended with every
/// attempt, enabling post-hoc loop analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopClosure {
    pub status: String,
    pub reason: String,
    pub evidence: Value,
    pub next_actions: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttemptTelemetry {
    pub latency_ms: u64,
    pub retries: u32,
    pub fallbacks_used: u32,
}

/// Content-addressed artifact reference. `advisory` marks partial output that
/// degrades (rather than fails) a run when nothing better lands.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArtifactRef {
    pub uri: String,
    pub kind: ArtifactKind,
    pub sha256: String,
    pub size_bytes: u64,
    pub produced_by: String,
    #[serde(default)]
    pub advisory: bool,
}

/// Record of one candidate invocation within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionAttempt {
    pub attempt_id: AttemptId,
    pub run_id: RunId,
    pub strategy_id: String,
    pub rank: usize,
    pub started_at: DateTimeUtc,
    pub ended_at: DateTimeUtc,
    pub status: AttemptStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub artifacts: Vec<ArtifactRef>,
    pub telemetry: AttemptTelemetry,
    pub loop_closure: LoopClosure,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WhyFailed {
    pub error_kind: ErrorKind,
    pub summary: String,
}

/// User-facing payload sealed with the run summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryBundle {
    pub run_id: RunId,
    pub headline: String,
    pub why_failed: Option<WhyFailed>,
    pub clarification_questions: Vec<String>,
    pub assumptions: Vec<String>,
    pub primary_artifact: Option<ArtifactRef>,
    pub supporting_artifacts: Vec<ArtifactRef>,
    pub retry_options: Vec<RetryOption>,
}

impl DeliveryBundle {
    /// # Errors
    /// Returns [`DomainError::Validation`] when the bundle exceeds the
    /// clarification or retry-preset budgets.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.headline.trim().is_empty() {
            return Err(DomainError::Validation(
                "headline MUST be non-empty".to_string(),
            ));
        }
        if self.clarification_questions.len() > 2 {
            return Err(DomainError::Validation(
                "a delivery bundle carries at most 2 clarification questions".to_string(),
            ));
        }
        if self.retry_options.len() > 3 {
            return Err(DomainError::Validation(
                "a delivery bundle carries at most 3 retry options".to_string(),
            ));
        }
        Ok(())
    }
}

/// Terminal record for a run. `chosen_strategy` is set only when a succeeded
/// attempt exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub outcome: RunOutcome,
    pub chosen_strategy: Option<String>,
    pub attempts_count: usize,
    pub total_latency_ms: u64,
    pub delivery_bundle_ref: String,
    pub sealed_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackRecord {
    pub feedback_id: String,
    pub run_id: RunId,
    pub rating: i8,
    pub note: String,
    pub profile: Profile,
    pub task_kind: TaskKind,
    pub strategy_id: String,
    pub submitted_at: DateTimeUtc,
    pub processed: bool,
}

impl FeedbackRecord {
    /// # Errors
    /// Returns [`DomainError::Validation`] for ratings outside {+1, -1}.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.rating != 1 && self.rating != -1 {
            return Err(DomainError::Validation(
                "rating MUST be +1 or -1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Periodic strategy-level score over one tuner window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationRecord {
    pub strategy_id: String,
    pub task_kind: TaskKind,
    pub window_start: DateTimeUtc,
    pub window_end: DateTimeUtc,
    pub samples: usize,
    pub success_rate: f64,
    pub p95_latency_ms: u64,
    pub fallback_rate: f64,
    pub health_score: f64,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyOverride {
    pub scope: OverrideScope,
    pub key: String,
    pub value: Value,
}

/// Immutable, addressable point in the override log. Apply and rollback both
/// append a snapshot; the latest snapshot's set is the active set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverrideSnapshot {
    pub snapshot_id: SnapshotId,
    pub applied_at: DateTimeUtc,
    pub approved_by: String,
    pub note: String,
    pub overrides: Vec<PolicyOverride>,
}

/// Persisted per-tool breaker record so restarts do not forget tripped tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerRecord {
    pub key: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTimeUtc>,
    pub last_error: String,
    pub updated_at: DateTimeUtc,
}

impl BreakerRecord {
    #[must_use]
    pub fn closed(key: &str, now: DateTimeUtc) -> Self {
        Self {
            key: key.to_string(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_error: String::new(),
            updated_at: now,
        }
    }
}

/// Replayable record of one tool-call step, keyed by `run_id.step_id`.
/// Carries enough to re-execute the call with or without `dry_run`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayRecord {
    pub run_id: RunId,
    pub step_id: u32,
    pub server: String,
    pub tool: String,
    pub params: Value,
    pub status: String,
    pub error: Option<String>,
    pub recorded_at: DateTimeUtc,
}

/// Unified telemetry event emitted for every significant action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub ts: DateTimeUtc,
    pub module: String,
    pub action: String,
    pub status: String,
    pub trace_id: String,
    pub run_id: Option<RunId>,
    pub latency_ms: Option<u64>,
    pub error_code: Option<String>,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DomainError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<DateTimeUtc, DomainError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;
    if parsed.offset() != UtcOffset::UTC {
        return Err(DomainError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }
    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DomainError::Validation`] when formatting fails.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String, DomainError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("failed to format RFC3339: {err}")))
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn days_since(earlier: DateTimeUtc, later: DateTimeUtc) -> f64 {
    if later <= earlier {
        return 0.0;
    }
    let elapsed = later - earlier;
    elapsed.whole_seconds() as f64 / Duration::DAY.whole_seconds() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn error_kind_exit_codes_are_stable() {
        assert_eq!(ErrorKind::GovernanceBlock.exit_code(), 10);
        assert_eq!(ErrorKind::MissingInput.exit_code(), 11);
        assert_eq!(ErrorKind::ToolTimeout.exit_code(), 12);
        assert_eq!(ErrorKind::ApprovalRequired.exit_code(), 13);
        assert_eq!(ErrorKind::PolicyViolation.exit_code(), 14);
        assert_eq!(ErrorKind::Backpressure.exit_code(), 15);
    }

    #[test]
    fn transient_kinds_are_retryable_and_not_fatal() {
        assert!(ErrorKind::ToolTimeout.retryable());
        assert!(ErrorKind::ServiceUnavailable.retryable());
        assert!(!ErrorKind::ContractViolation.retryable());
        assert!(ErrorKind::PolicyViolation.fatal());
        assert!(!ErrorKind::ToolTimeout.fatal());
    }

    #[test]
    fn risk_and_maturity_order_as_governance_expects() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(Maturity::Experimental < Maturity::Stable);
    }

    #[test]
    fn delivery_bundle_rejects_more_than_two_questions() {
        let bundle = DeliveryBundle {
            run_id: RunId::new(),
            headline: "done".to_string(),
            why_failed: None,
            clarification_questions: vec!["a".into(), "b".into(), "c".into()],
            assumptions: Vec::new(),
            primary_artifact: None,
            supporting_artifacts: Vec::new(),
            retry_options: Vec::new(),
        };
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn feedback_rating_must_be_unit() {
        let mut record = FeedbackRecord {
            feedback_id: "fb-1".to_string(),
            run_id: RunId::new(),
            rating: 1,
            note: String::new(),
            profile: Profile::Strict,
            task_kind: TaskKind::Other,
            strategy_id: "generalist".to_string(),
            submitted_at: now_utc(),
            processed: false,
        };
        assert!(record.validate().is_ok());
        record.rating = 0;
        assert!(record.validate().is_err());
    }

    #[test]
    fn hash_json_is_stable_for_equal_values() {
        let left = must_ok(hash_json(&json!({"a": 1, "b": [true, null]})));
        let right = must_ok(hash_json(&json!({"a": 1, "b": [true, null]})));
        assert_eq!(left, right);
    }

    #[test]
    fn rfc3339_parser_requires_utc() {
        assert!(parse_rfc3339_utc("2026-08-01T10:00:00Z").is_ok());
        assert!(parse_rfc3339_utc("2026-08-01T10:00:00+08:00").is_err());
    }

    #[test]
    fn task_kind_strings_round_trip() {
        for kind in [
            TaskKind::Presentation,
            TaskKind::Research,
            TaskKind::DataQuery,
            TaskKind::Image,
            TaskKind::Automation,
            TaskKind::Other,
        ] {
            assert_eq!(TaskKind::parse(kind.as_str()), Some(kind));
        }
    }
}

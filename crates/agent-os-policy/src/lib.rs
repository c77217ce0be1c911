#![forbid(unsafe_code)]

//! Layered risk and approval discipline. Governance checks run at plan time
//! and are re-verified at execution time; approvals are signed files with a
//! monotonic counter; the override log is an ordered, reversible sequence of
//! snapshots where apply and rollback are both appends.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use agent_os_config::AgentOsConfig;
use agent_os_domain::{
    DateTimeUtc, Maturity, OverrideScope, OverrideSnapshot, PolicyOverride, Profile, RiskLevel,
    SnapshotId, TaskKind,
};
use agent_os_state_core::StateStore;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Override values with runtime meaning for strategy-scoped overrides.
pub const OVERRIDE_BLOCKED: &str = "blocked";
pub const OVERRIDE_ADVISOR: &str = "advisor";
/// Profile-scoped override key consumed by `profile=auto` resolution.
pub const KEY_DEFAULT_PROFILE: &str = "default_profile";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval file missing for '{0}'")]
    Missing(String),
    #[error("approval for '{service}' is stale: {reason}")]
    Stale { service: String, reason: String },
    #[error("approval for '{service}' is invalid: {reason}")]
    Invalid { service: String, reason: String },
}

/// The governance surface bound to one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GovernanceControls {
    pub allowed_layers: BTreeSet<String>,
    pub blocked_maturity: BTreeSet<Maturity>,
    pub max_risk_level: RiskLevel,
    pub allowed_strategies: BTreeSet<String>,
    pub blocked_strategies: BTreeSet<String>,
    pub demoted_strategies: BTreeSet<String>,
    pub require_approval_for_publish: bool,
}

/// Verdict for one strategy against the controls, with machine-readable
/// block reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Allowed,
    Blocked(Vec<String>),
}

impl GateOutcome {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Build run-scoped controls from configuration plus the active override set.
#[must_use]
pub fn bind_controls(
    config: &AgentOsConfig,
    profile: Profile,
    active_overrides: &[PolicyOverride],
) -> GovernanceControls {
    let governance = config.governance_for(profile);
    let mut blocked_strategies = BTreeSet::new();
    let mut demoted_strategies = BTreeSet::new();
    for entry in active_overrides {
        if entry.scope != OverrideScope::Strategy {
            continue;
        }
        match entry.value.as_str() {
            Some(OVERRIDE_BLOCKED) => {
                blocked_strategies.insert(entry.key.clone());
            }
            Some(OVERRIDE_ADVISOR) => {
                demoted_strategies.insert(entry.key.clone());
            }
            _ => {}
        }
    }
    GovernanceControls {
        allowed_layers: governance.allowed_layers.into_iter().collect(),
        blocked_maturity: governance.blocked_maturity.into_iter().collect(),
        max_risk_level: governance.max_risk_level,
        allowed_strategies: BTreeSet::new(),
        blocked_strategies,
        demoted_strategies,
        require_approval_for_publish: config.governance.require_approval_for_publish,
    }
}

/// Evaluate one strategy against the controls. Reasons follow the
/// `<check>_blocked:<value>` convention so they cluster in reports.
#[must_use]
pub fn evaluate_strategy(
    strategy_id: &str,
    layer: &str,
    maturity: Maturity,
    risk_level: RiskLevel,
    controls: &GovernanceControls,
) -> GateOutcome {
    let mut reasons = Vec::new();
    let wildcard = controls.allowed_layers.contains("*");
    if !wildcard && !controls.allowed_layers.contains(layer) {
        reasons.push(format!("layer_blocked:{layer}"));
    }
    if controls.blocked_maturity.contains(&maturity) {
        reasons.push(format!("maturity_blocked:{}", maturity.as_str()));
    }
    if risk_level > controls.max_risk_level {
        reasons.push(format!(
            "risk_blocked:{}>{}",
            risk_level.as_str(),
            controls.max_risk_level.as_str()
        ));
    }
    if controls.blocked_strategies.contains(strategy_id) {
        reasons.push("override_blocked".to_string());
    }
    if !controls.allowed_strategies.is_empty() && !controls.allowed_strategies.contains(strategy_id)
    {
        reasons.push("allow_list_blocked".to_string());
    }
    if reasons.is_empty() {
        GateOutcome::Allowed
    } else {
        GateOutcome::Blocked(reasons)
    }
}

/// Scan outgoing parameters for configured sensitive patterns. Returns the
/// first hit as `param:pattern`.
#[must_use]
pub fn scan_for_secrets(
    params: &BTreeMap<String, Value>,
    patterns: &[String],
) -> Option<String> {
    for (name, value) in params {
        let rendered = match value {
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        for pattern in patterns {
            if pattern.is_empty() {
                continue;
            }
            if rendered.contains(pattern.as_str()) {
                return Some(format!("{name}:{pattern}"));
            }
        }
    }
    None
}

/// Signed operator approval for a publish-capable step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ApprovalFile {
    pub token: String,
    pub approver: String,
    pub counter: u64,
    pub issued_at: DateTimeUtc,
}

/// Approval files live under `approvals/<service>.json`; consumed counters
/// are journaled so a replayed approval cannot authorize twice.
pub struct ApprovalVerifier {
    approvals_dir: PathBuf,
    max_age_seconds: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConsumedCounters {
    #[serde(default)]
    last_counter: BTreeMap<String, u64>,
}

impl ApprovalVerifier {
    #[must_use]
    pub fn new(approvals_dir: &Path, max_age_seconds: i64) -> Self {
        Self {
            approvals_dir: approvals_dir.to_path_buf(),
            max_age_seconds,
        }
    }

    fn ledger_path(&self) -> PathBuf {
        self.approvals_dir.join("consumed.json")
    }

    fn load_ledger(&self) -> ConsumedCounters {
        let path = self.ledger_path();
        if !path.exists() {
            return ConsumedCounters::default();
        }
        fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_ledger(&self, ledger: &ConsumedCounters) -> Result<()> {
        fs::create_dir_all(&self.approvals_dir)?;
        fs::write(self.ledger_path(), serde_json::to_string_pretty(ledger)?)
            .context("failed to persist approval ledger")?;
        Ok(())
    }

    /// Verify and consume the approval for a service. The counter must be
    /// strictly greater than the last consumed counter, and the approval
    /// must be fresh.
    ///
    /// # Errors
    /// Returns [`ApprovalError`] describing why the approval is unusable.
    pub fn verify_and_consume(
        &self,
        service: &str,
        now: DateTimeUtc,
    ) -> Result<ApprovalFile, ApprovalError> {
        let path = self.approvals_dir.join(format!("{service}.json"));
        if !path.exists() {
            return Err(ApprovalError::Missing(service.to_string()));
        }
        let raw = fs::read_to_string(&path).map_err(|err| ApprovalError::Invalid {
            service: service.to_string(),
            reason: err.to_string(),
        })?;
        let approval: ApprovalFile =
            serde_json::from_str(&raw).map_err(|err| ApprovalError::Invalid {
                service: service.to_string(),
                reason: err.to_string(),
            })?;
        if approval.token.trim().is_empty() || approval.approver.trim().is_empty() {
            return Err(ApprovalError::Invalid {
                service: service.to_string(),
                reason: "token and approver MUST be non-empty".to_string(),
            });
        }
        let age = now - approval.issued_at;
        if age.whole_seconds() > self.max_age_seconds {
            return Err(ApprovalError::Stale {
                service: service.to_string(),
                reason: format!(
                    "issued {}s ago, max age {}s",
                    age.whole_seconds(),
                    self.max_age_seconds
                ),
            });
        }
        let mut ledger = self.load_ledger();
        let last = ledger.last_counter.get(service).copied().unwrap_or(0);
        if approval.counter <= last {
            return Err(ApprovalError::Stale {
                service: service.to_string(),
                reason: format!(
                    "counter {} already consumed (last {last})",
                    approval.counter
                ),
            });
        }
        ledger
            .last_counter
            .insert(service.to_string(), approval.counter);
        self.save_ledger(&ledger).map_err(|err| ApprovalError::Invalid {
            service: service.to_string(),
            reason: err.to_string(),
        })?;
        Ok(approval)
    }
}

/// Diff produced by apply/rollback for operator review.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OverrideDiff {
    pub added: Vec<PolicyOverride>,
    pub removed: Vec<PolicyOverride>,
}

/// The active override set: the latest snapshot's set, or empty.
///
/// # Errors
/// Propagates store read failures.
pub fn active_overrides(store: &dyn StateStore) -> Result<Vec<PolicyOverride>> {
    Ok(store
        .list_override_snapshots()?
        .last()
        .map(|snapshot| snapshot.overrides.clone())
        .unwrap_or_default())
}

fn override_key(entry: &PolicyOverride) -> (OverrideScope, String) {
    (entry.scope, entry.key.clone())
}

fn diff_sets(before: &[PolicyOverride], after: &[PolicyOverride]) -> OverrideDiff {
    let before_map: BTreeMap<(OverrideScope, String), &PolicyOverride> =
        before.iter().map(|entry| (override_key(entry), entry)).collect();
    let after_map: BTreeMap<(OverrideScope, String), &PolicyOverride> =
        after.iter().map(|entry| (override_key(entry), entry)).collect();
    let mut diff = OverrideDiff::default();
    for (key, entry) in &after_map {
        match before_map.get(key) {
            None => diff.added.push((*entry).clone()),
            Some(previous) if previous.value != entry.value => {
                diff.removed.push((*previous).clone());
                diff.added.push((*entry).clone());
            }
            Some(_) => {}
        }
    }
    for (key, entry) in &before_map {
        if !after_map.contains_key(key) {
            diff.removed.push((*entry).clone());
        }
    }
    diff
}

/// Apply overrides: merge into the active set (replacement by scope+key) and
/// append a new snapshot. Never mutates prior snapshots.
///
/// # Errors
/// Propagates store failures.
pub fn apply_overrides(
    store: &dyn StateStore,
    new_entries: &[PolicyOverride],
    approved_by: &str,
    note: &str,
    now: DateTimeUtc,
) -> Result<(OverrideSnapshot, OverrideDiff)> {
    let current = active_overrides(store)?;
    let mut merged: BTreeMap<(OverrideScope, String), PolicyOverride> = current
        .iter()
        .map(|entry| (override_key(entry), entry.clone()))
        .collect();
    for entry in new_entries {
        merged.insert(override_key(entry), entry.clone());
    }
    let next: Vec<PolicyOverride> = merged.into_values().collect();
    let snapshot = OverrideSnapshot {
        snapshot_id: SnapshotId::new(),
        applied_at: now,
        approved_by: approved_by.to_string(),
        note: note.to_string(),
        overrides: next.clone(),
    };
    store.append_override_snapshot(&snapshot)?;
    let diff = diff_sets(&current, &next);
    tracing::info!(
        snapshot_id = %snapshot.snapshot_id,
        added = diff.added.len(),
        removed = diff.removed.len(),
        "applied override snapshot"
    );
    Ok((snapshot, diff))
}

/// Roll back to the state immediately before `target`: the restored set is
/// appended as a fresh snapshot, keeping the log strictly ordered.
///
/// # Errors
/// Returns an error when the snapshot id is unknown.
pub fn rollback_to(
    store: &dyn StateStore,
    target: SnapshotId,
    approved_by: &str,
    now: DateTimeUtc,
) -> Result<(OverrideSnapshot, OverrideDiff)> {
    let snapshots = store.list_override_snapshots()?;
    let position = snapshots
        .iter()
        .position(|snapshot| snapshot.snapshot_id == target)
        .ok_or_else(|| anyhow!("unknown snapshot_id {target}"))?;
    let restored: Vec<PolicyOverride> = if position == 0 {
        Vec::new()
    } else {
        snapshots[position - 1].overrides.clone()
    };
    let current = active_overrides(store)?;
    let snapshot = OverrideSnapshot {
        snapshot_id: SnapshotId::new(),
        applied_at: now,
        approved_by: approved_by.to_string(),
        note: format!("rollback:{target}"),
        overrides: restored.clone(),
    };
    store.append_override_snapshot(&snapshot)?;
    Ok((snapshot, diff_sets(&current, &restored)))
}

/// Profile resolution inputs derived from the active override set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileOverrides {
    pub default_profile: Option<Profile>,
    pub task_kind_profiles: BTreeMap<TaskKind, Profile>,
}

#[must_use]
pub fn profile_overrides_from(active: &[PolicyOverride]) -> ProfileOverrides {
    let mut out = ProfileOverrides::default();
    for entry in active {
        match entry.scope {
            OverrideScope::Profile => {
                if entry.key == KEY_DEFAULT_PROFILE {
                    out.default_profile = entry.value.as_str().and_then(Profile::parse);
                }
            }
            OverrideScope::TaskKind => {
                if let (Some(kind), Some(profile)) = (
                    TaskKind::parse(&entry.key),
                    entry.value.as_str().and_then(Profile::parse),
                ) {
                    out.task_kind_profiles.insert(kind, profile);
                }
            }
            OverrideScope::Strategy => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_os_domain::now_utc;
    use agent_os_state_sqlite::SqliteStateStore;
    use serde_json::json;
    use time::Duration;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> SqliteStateStore {
        let store = must_ok(SqliteStateStore::open(dir.path()));
        must_ok(store.migrate());
        store
    }

    fn strict_controls() -> GovernanceControls {
        let config = AgentOsConfig::bootstrap();
        bind_controls(&config, Profile::Strict, &[])
    }

    #[test]
    fn strict_blocks_experimental_and_high_risk() {
        let controls = strict_controls();
        let outcome = evaluate_strategy(
            "image-creator",
            "creative",
            Maturity::Experimental,
            RiskLevel::Medium,
            &controls,
        );
        match outcome {
            GateOutcome::Blocked(reasons) => {
                assert!(reasons.iter().any(|r| r.starts_with("layer_blocked:")));
                assert!(reasons.contains(&"maturity_blocked:experimental".to_string()));
            }
            GateOutcome::Allowed => panic!("expected block"),
        }
        let risky = evaluate_strategy(
            "report-publisher",
            "analysis",
            Maturity::Beta,
            RiskLevel::High,
            &controls,
        );
        assert!(!risky.is_allowed());
    }

    #[test]
    fn wildcard_layer_admits_everything_enabled() {
        let config = AgentOsConfig::bootstrap();
        let controls = bind_controls(&config, Profile::Adaptive, &[]);
        let outcome = evaluate_strategy(
            "image-creator",
            "creative",
            Maturity::Experimental,
            RiskLevel::High,
            &controls,
        );
        assert!(outcome.is_allowed());
    }

    #[test]
    fn strategy_override_values_split_into_blocked_and_demoted() {
        let config = AgentOsConfig::bootstrap();
        let overrides = vec![
            PolicyOverride {
                scope: OverrideScope::Strategy,
                key: "data-query".to_string(),
                value: json!(OVERRIDE_BLOCKED),
            },
            PolicyOverride {
                scope: OverrideScope::Strategy,
                key: "daily-digest".to_string(),
                value: json!(OVERRIDE_ADVISOR),
            },
        ];
        let controls = bind_controls(&config, Profile::Adaptive, &overrides);
        assert!(controls.blocked_strategies.contains("data-query"));
        assert!(controls.demoted_strategies.contains("daily-digest"));
        let outcome = evaluate_strategy(
            "data-query",
            "analysis",
            Maturity::Beta,
            RiskLevel::Medium,
            &controls,
        );
        assert_eq!(
            outcome,
            GateOutcome::Blocked(vec!["override_blocked".to_string()])
        );
    }

    #[test]
    fn secret_scan_finds_nested_pattern() {
        let mut params = BTreeMap::new();
        params.insert("note".to_string(), json!("harmless"));
        params.insert(
            "auth".to_string(),
            json!({"header": "Bearer sk-live-12345"}),
        );
        let patterns = vec!["sk-".to_string()];
        let hit = scan_for_secrets(&params, &patterns);
        assert_eq!(hit, Some("auth:sk-".to_string()));
    }

    #[test]
    fn approval_counter_is_monotonic() {
        let dir = must_ok(tempfile::tempdir());
        let verifier = ApprovalVerifier::new(dir.path(), 3600);
        let approval = ApprovalFile {
            token: "tok-1".to_string(),
            approver: "operator".to_string(),
            counter: 1,
            issued_at: now_utc(),
        };
        must_ok(fs::write(
            dir.path().join("report-publisher.json"),
            must_ok(serde_json::to_string(&approval)),
        ));
        assert!(verifier
            .verify_and_consume("report-publisher", now_utc())
            .is_ok());
        // Same counter again: replay is refused.
        let replayed = verifier.verify_and_consume("report-publisher", now_utc());
        assert!(matches!(replayed, Err(ApprovalError::Stale { .. })));
    }

    #[test]
    fn stale_approval_is_rejected() {
        let dir = must_ok(tempfile::tempdir());
        let verifier = ApprovalVerifier::new(dir.path(), 60);
        let approval = ApprovalFile {
            token: "tok-1".to_string(),
            approver: "operator".to_string(),
            counter: 7,
            issued_at: now_utc() - Duration::hours(2),
        };
        must_ok(fs::write(
            dir.path().join("report-publisher.json"),
            must_ok(serde_json::to_string(&approval)),
        ));
        let result = verifier.verify_and_consume("report-publisher", now_utc());
        assert!(matches!(result, Err(ApprovalError::Stale { .. })));
    }

    #[test]
    fn missing_approval_is_distinct_from_invalid() {
        let dir = must_ok(tempfile::tempdir());
        let verifier = ApprovalVerifier::new(dir.path(), 60);
        assert!(matches!(
            verifier.verify_and_consume("report-publisher", now_utc()),
            Err(ApprovalError::Missing(_))
        ));
    }

    #[test]
    fn apply_then_rollback_restores_prior_set() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        let first = vec![PolicyOverride {
            scope: OverrideScope::TaskKind,
            key: "research".to_string(),
            value: json!("adaptive"),
        }];
        let (snapshot_one, _) =
            must_ok(apply_overrides(&store, &first, "operator", "initial", now_utc()));
        let second = vec![PolicyOverride {
            scope: OverrideScope::Strategy,
            key: "data-query".to_string(),
            value: json!(OVERRIDE_BLOCKED),
        }];
        let (snapshot_two, diff_two) =
            must_ok(apply_overrides(&store, &second, "operator", "block", now_utc()));
        assert_eq!(diff_two.added.len(), 1);
        assert_eq!(must_ok(active_overrides(&store)).len(), 2);

        let (_, diff) = must_ok(rollback_to(
            &store,
            snapshot_two.snapshot_id,
            "operator",
            now_utc(),
        ));
        let active = must_ok(active_overrides(&store));
        assert_eq!(active, snapshot_one.overrides);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].key, "data-query");
    }

    #[test]
    fn rollback_to_first_snapshot_clears_the_set() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        let (snapshot, _) = must_ok(apply_overrides(
            &store,
            &[PolicyOverride {
                scope: OverrideScope::Profile,
                key: KEY_DEFAULT_PROFILE.to_string(),
                value: json!("adaptive"),
            }],
            "operator",
            "initial",
            now_utc(),
        ));
        must_ok(rollback_to(&store, snapshot.snapshot_id, "operator", now_utc()));
        assert!(must_ok(active_overrides(&store)).is_empty());
    }

    #[test]
    fn profile_overrides_parse_from_active_set() {
        let active = vec![
            PolicyOverride {
                scope: OverrideScope::Profile,
                key: KEY_DEFAULT_PROFILE.to_string(),
                value: json!("adaptive"),
            },
            PolicyOverride {
                scope: OverrideScope::TaskKind,
                key: "presentation".to_string(),
                value: json!("strict"),
            },
        ];
        let parsed = profile_overrides_from(&active);
        assert_eq!(parsed.default_profile, Some(Profile::Adaptive));
        assert_eq!(
            parsed.task_kind_profiles.get(&TaskKind::Presentation),
            Some(&Profile::Strict)
        );
    }
}

#![forbid(unsafe_code)]

//! The learning loop: aggregate recent attempts into evaluation windows,
//! score strategy health, propose promote/demote actions bounded by budget,
//! and (when asked) apply them as a reversible override snapshot. Feedback
//! ratings feed learned `task_kind -> profile` preferences consumed by
//! `profile=auto` resolution.

use std::collections::BTreeMap;

use agent_os_config::TunerSettings;
use agent_os_domain::{
    DateTimeUtc, ErrorKind, EvaluationRecord, OverrideScope, OverrideSnapshot, PolicyOverride,
    Profile, Recommendation, TaskKind,
};
use agent_os_policy::{apply_overrides, OVERRIDE_ADVISOR};
use agent_os_state_core::{StateStore, StrategyWindowStats};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::Duration;

/// Smoothing mass applied to windowed success ratios before they feed the
/// ranker, so a handful of lucky runs cannot dominate.
const MEMORY_SMOOTHING: f64 = 5.0;
const MEMORY_PRIOR: f64 = 0.5;

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn p95(latencies: &[u64]) -> u64 {
    if latencies.is_empty() {
        return 0;
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();
    let index = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[index.saturating_sub(1).min(sorted.len() - 1)]
}

/// Memory scores for the ranker: smoothed success ratios from evaluation
/// records inside the configured window only. Strategies without history are
/// absent; the ranker substitutes its configured prior.
///
/// # Errors
/// Propagates store failures.
pub fn memory_scores(
    store: &dyn StateStore,
    settings: &TunerSettings,
    now: DateTimeUtc,
) -> Result<BTreeMap<String, f64>> {
    let since = now - Duration::days(i64::from(settings.window_days));
    let mut grouped: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for record in store.list_evaluations(since)? {
        let entry = grouped.entry(record.strategy_id.clone()).or_insert((0.0, 0.0));
        entry.0 += record.success_rate * record.samples as f64;
        entry.1 += record.samples as f64;
    }
    let mut out = BTreeMap::new();
    for (strategy_id, (weighted, samples)) in grouped {
        if samples <= 0.0 {
            continue;
        }
        let smoothed =
            (weighted + MEMORY_PRIOR * MEMORY_SMOOTHING) / (samples + MEMORY_SMOOTHING);
        out.insert(strategy_id, round4(smoothed));
    }
    Ok(out)
}

fn health_score(
    settings: &TunerSettings,
    success_rate: f64,
    p95_latency_ms: u64,
    fallback_rate: f64,
) -> f64 {
    let latency_factor =
        1.0 - (p95_latency_ms.min(settings.slo_p95_target_ms) as f64
            / settings.slo_p95_target_ms.max(1) as f64);
    round4(
        settings.health_success_weight * success_rate
            + settings.health_latency_weight * latency_factor
            + settings.health_fallback_weight * (1.0 - fallback_rate.clamp(0.0, 1.0)),
    )
}

fn consecutive_low_windows(
    store: &dyn StateStore,
    strategy_id: &str,
    settings: &TunerSettings,
    now: DateTimeUtc,
) -> Result<u32> {
    let horizon = now
        - Duration::days(i64::from(settings.window_days) * i64::from(settings.demote_windows + 1));
    let mut history = store.evaluations_for(strategy_id, horizon)?;
    history.sort_by_key(|record| record.window_end);
    let mut streak = 0;
    for record in history.iter().rev() {
        if record.success_rate <= settings.low_watermark && record.samples > 0 {
            streak += 1;
        } else {
            break;
        }
    }
    Ok(streak)
}

/// Evaluate the current window per (strategy, task kind) and append the
/// resulting records. Classification:
/// `promote` at or above the high watermark, `demote` when the success rate
/// has sat at or below the low watermark for M consecutive windows (or a
/// P1/P2 failure pattern appeared), `collect-more-data` otherwise.
///
/// # Errors
/// Propagates store failures.
pub fn evaluate_and_record(
    store: &dyn StateStore,
    settings: &TunerSettings,
    now: DateTimeUtc,
) -> Result<Vec<EvaluationRecord>> {
    let window_start = now - Duration::days(i64::from(settings.window_days));
    let stats = store.strategy_window_stats(window_start, now)?;
    let breaches = p1_p2_breaches(store, window_start, now)?;
    let mut records = Vec::new();

    for entry in stats {
        let StrategyWindowStats {
            strategy_id,
            task_kind,
            attempts,
            succeeded,
            failed,
            fallback_attempts,
            latencies_ms,
            ..
        } = entry;
        let decided = succeeded + failed;
        if attempts == 0 {
            continue;
        }
        let success_rate = if decided == 0 {
            0.0
        } else {
            round4(succeeded as f64 / decided as f64)
        };
        let p95_latency_ms = p95(&latencies_ms);
        let fallback_rate = round4(fallback_attempts as f64 / attempts as f64);
        let health = health_score(settings, success_rate, p95_latency_ms, fallback_rate);

        let breached = breaches.contains_key(&strategy_id);
        let recommendation = if breached {
            Recommendation::Demote
        } else if decided < settings.min_samples {
            Recommendation::CollectMoreData
        } else if health >= settings.high_watermark {
            Recommendation::Promote
        } else if success_rate <= settings.low_watermark {
            let prior_streak = consecutive_low_windows(store, &strategy_id, settings, now)?;
            if prior_streak + 1 >= settings.demote_windows {
                Recommendation::Demote
            } else {
                Recommendation::CollectMoreData
            }
        } else {
            Recommendation::CollectMoreData
        };

        let record = EvaluationRecord {
            strategy_id,
            task_kind,
            window_start,
            window_end: now,
            samples: decided,
            success_rate,
            p95_latency_ms,
            fallback_rate,
            health_score: health,
            recommendation,
        };
        store.append_evaluation(&record)?;
        records.push(record);
    }
    Ok(records)
}

fn p1_p2_breaches(
    store: &dyn StateStore,
    start: DateTimeUtc,
    end: DateTimeUtc,
) -> Result<BTreeMap<String, ErrorKind>> {
    let mut out = BTreeMap::new();
    for cluster in store.failure_hotspots(start, end)? {
        if matches!(
            cluster.error_kind,
            ErrorKind::PolicyViolation | ErrorKind::ContractViolation
        ) {
            out.entry(cluster.strategy_id).or_insert(cluster.error_kind);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunerProposal {
    pub strategy_id: String,
    pub task_kind: TaskKind,
    pub action: Recommendation,
    pub priority_score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunerReport {
    pub window_days: u32,
    pub evaluations: Vec<EvaluationRecord>,
    pub proposals: Vec<TunerProposal>,
    pub applied_snapshot: Option<OverrideSnapshot>,
}

/// Run one tuner pass: evaluate, build a bounded proposal set, and apply it
/// as an override snapshot when `apply` is set. A strategy that breached
/// P1/P2 failure patterns is demoted to advisor regardless of score.
///
/// # Errors
/// Propagates store failures.
pub fn run_tuner(
    store: &dyn StateStore,
    settings: &TunerSettings,
    now: DateTimeUtc,
    apply: bool,
    approved_by: &str,
) -> Result<TunerReport> {
    let evaluations = evaluate_and_record(store, settings, now)?;
    let window_start = now - Duration::days(i64::from(settings.window_days));
    let breaches = p1_p2_breaches(store, window_start, now)?;

    let mut proposals = Vec::new();
    for record in &evaluations {
        let (priority, reason) = match record.recommendation {
            Recommendation::Demote => {
                if let Some(kind) = breaches.get(&record.strategy_id) {
                    (
                        1.0,
                        format!("p1_p2_breach:{}", kind.as_str()),
                    )
                } else {
                    (
                        round4((settings.low_watermark - record.success_rate).max(0.0) + 0.2),
                        format!(
                            "success_rate {} below low watermark for {}+ windows",
                            record.success_rate, settings.demote_windows
                        ),
                    )
                }
            }
            Recommendation::Promote => (
                round4((record.health_score - settings.high_watermark).max(0.0) + 0.2),
                format!("health_score {} at or above high watermark", record.health_score),
            ),
            Recommendation::CollectMoreData => continue,
        };
        if priority < settings.min_priority_score {
            continue;
        }
        proposals.push(TunerProposal {
            strategy_id: record.strategy_id.clone(),
            task_kind: record.task_kind,
            action: record.recommendation,
            priority_score: priority,
            reason,
        });
    }
    proposals.sort_by(|left, right| {
        right
            .priority_score
            .total_cmp(&left.priority_score)
            .then_with(|| left.strategy_id.cmp(&right.strategy_id))
    });
    proposals.truncate(settings.max_actions);

    let applied_snapshot = if apply && !proposals.is_empty() {
        let overrides: Vec<PolicyOverride> = proposals
            .iter()
            .map(|proposal| PolicyOverride {
                scope: OverrideScope::Strategy,
                key: proposal.strategy_id.clone(),
                value: match proposal.action {
                    Recommendation::Demote => json!(OVERRIDE_ADVISOR),
                    _ => json!("active"),
                },
            })
            .collect();
        let (snapshot, _) = apply_overrides(
            store,
            &overrides,
            approved_by,
            "tuner proposal set",
            now,
        )?;
        Some(snapshot)
    } else {
        None
    };

    tracing::info!(
        evaluations = evaluations.len(),
        proposals = proposals.len(),
        applied = applied_snapshot.is_some(),
        "tuner pass complete"
    );
    Ok(TunerReport {
        window_days: settings.window_days,
        evaluations,
        proposals,
        applied_snapshot,
    })
}

/// Learn `task_kind -> profile` preferences from sealed runs and operator
/// feedback. A profile needs at least `min_runs` observations before it is
/// trusted; negative feedback counts its run as a failure even when the run
/// itself succeeded. Newly ingested feedback is marked processed.
///
/// # Errors
/// Propagates store failures.
pub fn learn_preferences(
    store: &dyn StateStore,
    min_runs: usize,
) -> Result<BTreeMap<TaskKind, Profile>> {
    let summaries = store.list_run_summaries(500)?;
    let mut downvoted: BTreeMap<String, bool> = BTreeMap::new();
    for feedback in store.unprocessed_feedback()? {
        downvoted.insert(feedback.run_id.to_string(), feedback.rating < 0);
        store.mark_feedback_processed(&feedback.feedback_id)?;
    }

    let mut stats: BTreeMap<(TaskKind, Profile), (usize, usize)> = BTreeMap::new();
    for summary in summaries {
        let Some(plan) = store.get_plan(summary.run_id)? else {
            continue;
        };
        let succeeded = matches!(
            summary.outcome,
            agent_os_domain::RunOutcome::Succeeded | agent_os_domain::RunOutcome::Degraded
        ) && !downvoted
            .get(&summary.run_id.to_string())
            .copied()
            .unwrap_or(false);
        let entry = stats.entry((plan.task_kind, plan.profile)).or_insert((0, 0));
        entry.0 += 1;
        if succeeded {
            entry.1 += 1;
        }
    }

    let mut best: BTreeMap<TaskKind, (Profile, f64, usize)> = BTreeMap::new();
    for ((kind, profile), (runs, ok)) in stats {
        if runs < min_runs {
            continue;
        }
        let rate = ok as f64 / runs as f64;
        match best.get(&kind) {
            Some((_, current_rate, current_runs))
                if *current_rate > rate || (*current_rate == rate && *current_runs >= runs) => {}
            _ => {
                best.insert(kind, (profile, rate, runs));
            }
        }
    }
    Ok(best
        .into_iter()
        .map(|(kind, (profile, _, _))| (kind, profile))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_os_domain::{
        now_utc, AttemptId, AttemptStatus, AttemptTelemetry, ExecutionAttempt, ExecutionPlan,
        LoopClosure, RunId,
    };
    use agent_os_policy::active_overrides;
    use agent_os_state_sqlite::SqliteStateStore;

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

    fn settings() -> TunerSettings {
        let mut settings = TunerSettings::default();
        settings.min_samples = 2;
        settings.demote_windows = 3;
        settings
    }

    fn seed_attempts(
        store: &SqliteStateStore,
        strategy_id: &str,
        ok: usize,
        failed: usize,
        kind: TaskKind,
    ) {
        // One run per attempt, as the engine produces when the first
        // candidate settles the run.
        for index in 0..(ok + failed) {
            let run_id = RunId::new();
            must_ok(store.append_plan(&ExecutionPlan {
                run_id,
                task_kind: kind,
                profile: Profile::Adaptive,
                candidates: Vec::new(),
                ambiguous: false,
                score_gap: 1.0,
            }));
            let status = if index < ok {
                AttemptStatus::Succeeded
            } else {
                AttemptStatus::Failed
            };
            must_ok(store.append_attempt(&ExecutionAttempt {
                attempt_id: AttemptId::new(),
                run_id,
                strategy_id: strategy_id.to_string(),
                rank: 0,
                started_at: now_utc() - Duration::hours(1),
                ended_at: now_utc() - Duration::hours(1) + Duration::milliseconds(40),
                status,
                error_kind: (status == AttemptStatus::Failed)
                    .then_some(ErrorKind::ServiceUnavailable),
                error_message: None,
                artifacts: Vec::new(),
                telemetry: AttemptTelemetry {
                    latency_ms: 40,
                    retries: 0,
                    fallbacks_used: 0,
                },
                loop_closure: LoopClosure {
                    status: "completed".to_string(),
                    reason: String::new(),
                    evidence: json!({}),
                    next_actions: Vec::new(),
                },
            }));
        }
    }

    fn seed_evaluation(
        store: &SqliteStateStore,
        strategy_id: &str,
        success_rate: f64,
        window_end: DateTimeUtc,
    ) {
        must_ok(store.append_evaluation(&EvaluationRecord {
            strategy_id: strategy_id.to_string(),
            task_kind: TaskKind::Automation,
            window_start: window_end - Duration::days(7),
            window_end,
            samples: 10,
            success_rate,
            p95_latency_ms: 100,
            fallback_rate: 0.1,
            health_score: success_rate,
            recommendation: Recommendation::CollectMoreData,
        }));
    }

    #[test]
    fn healthy_strategy_is_promoted() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        seed_attempts(&store, "mckinsey-ppt", 8, 0, TaskKind::Presentation);
        let records = must_ok(evaluate_and_record(&store, &settings(), now_utc()));
        let record = records
            .iter()
            .find(|r| r.strategy_id == "mckinsey-ppt")
            .unwrap_or_else(|| panic!("missing evaluation"));
        assert_eq!(record.recommendation, Recommendation::Promote);
        assert!(record.success_rate > 0.99);
    }

    #[test]
    fn demotion_requires_consecutive_low_windows() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        let now = now_utc();
        // Only one prior low window: not enough for a demote yet.
        seed_evaluation(&store, "mcp-generalist", 0.2, now - Duration::days(14));
        seed_attempts(&store, "mcp-generalist", 1, 7, TaskKind::Automation);
        let first = must_ok(evaluate_and_record(&store, &settings(), now - Duration::seconds(10)));
        assert_eq!(first[0].recommendation, Recommendation::CollectMoreData);

        // Now the streak (two stored lows + current) reaches three windows.
        let second = must_ok(evaluate_and_record(&store, &settings(), now));
        assert_eq!(second[0].recommendation, Recommendation::Demote);
    }

    #[test]
    fn p1_breach_demotes_regardless_of_score() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        let run_id = RunId::new();
        must_ok(store.append_plan(&ExecutionPlan {
            run_id,
            task_kind: TaskKind::Automation,
            profile: Profile::Adaptive,
            candidates: Vec::new(),
            ambiguous: false,
            score_gap: 1.0,
        }));
        must_ok(store.append_attempt(&ExecutionAttempt {
            attempt_id: AttemptId::new(),
            run_id,
            strategy_id: "report-publisher".to_string(),
            rank: 0,
            started_at: now_utc() - Duration::hours(1),
            ended_at: now_utc() - Duration::hours(1),
            status: AttemptStatus::Aborted,
            error_kind: Some(ErrorKind::PolicyViolation),
            error_message: Some("sensitive pattern".to_string()),
            artifacts: Vec::new(),
            telemetry: AttemptTelemetry::default(),
            loop_closure: LoopClosure {
                status: "aborted".to_string(),
                reason: "policy_violation".to_string(),
                evidence: json!({}),
                next_actions: Vec::new(),
            },
        }));
        let report = must_ok(run_tuner(&store, &settings(), now_utc(), false, "tuner"));
        let proposal = report
            .proposals
            .iter()
            .find(|p| p.strategy_id == "report-publisher")
            .unwrap_or_else(|| panic!("missing breach proposal"));
        assert_eq!(proposal.action, Recommendation::Demote);
        assert!(proposal.reason.starts_with("p1_p2_breach:"));
        assert!((proposal.priority_score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn apply_writes_reversible_snapshot() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        seed_evaluation(&store, "mcp-generalist", 0.1, now_utc() - Duration::days(14));
        seed_evaluation(&store, "mcp-generalist", 0.1, now_utc() - Duration::days(7));
        seed_attempts(&store, "mcp-generalist", 0, 8, TaskKind::Automation);
        let report = must_ok(run_tuner(&store, &settings(), now_utc(), true, "tuner"));
        let snapshot = report
            .applied_snapshot
            .unwrap_or_else(|| panic!("expected applied snapshot"));
        assert!(!snapshot.overrides.is_empty());
        let active = must_ok(active_overrides(&store));
        assert!(active
            .iter()
            .any(|o| o.key == "mcp-generalist" && o.value == json!(OVERRIDE_ADVISOR)));
    }

    #[test]
    fn proposal_set_is_bounded_by_max_actions() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        let mut settings = settings();
        settings.max_actions = 1;
        for name in ["s-a", "s-b", "s-c"] {
            seed_attempts(&store, name, 8, 0, TaskKind::Research);
        }
        let report = must_ok(run_tuner(&store, &settings, now_utc(), false, "tuner"));
        assert!(report.proposals.len() <= 1);
    }

    #[test]
    fn memory_scores_come_from_windowed_evaluations_only() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        // Inside the window.
        seed_evaluation(&store, "research-hub", 0.9, now_utc() - Duration::days(1));
        // Outside the window: must not influence the runtime ranking.
        seed_evaluation(&store, "stale-strategy", 0.9, now_utc() - Duration::days(30));
        let scores = must_ok(memory_scores(&store, &settings(), now_utc()));
        assert!(scores.contains_key("research-hub"));
        assert!(!scores.contains_key("stale-strategy"));
        let score = scores["research-hub"];
        assert!(score > 0.5 && score < 0.9, "smoothing pulls toward prior: {score}");
    }

    #[test]
    fn preferences_require_minimum_runs() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        let learned = must_ok(learn_preferences(&store, 2));
        assert!(learned.is_empty());
    }

    #[test]
    fn p95_picks_the_tail() {
        let latencies: Vec<u64> = (1..=100).collect();
        assert_eq!(p95(&latencies), 95);
        assert_eq!(p95(&[]), 0);
        assert_eq!(p95(&[7]), 7);
    }
}

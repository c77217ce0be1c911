#![forbid(unsafe_code)]

//! Unified observability over the telemetry log: per-action aggregates,
//! failure TopN, SLO adherence, breaker dashboards, and the diagnostics
//! walker (env, config, services, breaker state, recent runs) returning a
//! severity-ranked report.

use std::path::Path;

use agent_os_config::AgentOsConfig;
use agent_os_domain::{BreakerState, DateTimeUtc, RunOutcome};
use agent_os_services::{lint_contract, ServiceDescriptor};
use agent_os_state_core::{FailureCluster, StateStore};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStats {
    pub module: String,
    pub action: String,
    pub total: usize,
    pub ok: usize,
    pub success_rate: f64,
    pub p95_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureEntry {
    pub error_code: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SloReport {
    pub runs: usize,
    pub run_success_rate: f64,
    pub success_target: f64,
    pub success_met: bool,
    pub p95_run_latency_ms: u64,
    pub p95_target_ms: u64,
    pub latency_met: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityReport {
    pub window_days: u32,
    pub actions: Vec<ActionStats>,
    pub failure_top: Vec<FailureEntry>,
    pub hotspots: Vec<FailureCluster>,
    pub slo: SloReport,
    pub open_breakers: Vec<String>,
}

fn p95(latencies: &mut Vec<u64>) -> u64 {
    if latencies.is_empty() {
        return 0;
    }
    latencies.sort_unstable();
    let index = ((latencies.len() as f64) * 0.95).ceil() as usize;
    latencies[index.saturating_sub(1).min(latencies.len() - 1)]
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Aggregate telemetry, run outcomes, failure clusters, and breaker state
/// over the trailing window.
///
/// # Errors
/// Propagates store failures.
pub fn aggregate(
    store: &dyn StateStore,
    config: &AgentOsConfig,
    window_days: u32,
    now: DateTimeUtc,
) -> Result<ObservabilityReport> {
    let start = now - Duration::days(i64::from(window_days));
    let events = store.telemetry_in_window(start, now)?;

    let mut grouped: BTreeMap<(String, String), (usize, usize, Vec<u64>)> = BTreeMap::new();
    let mut failures: BTreeMap<String, usize> = BTreeMap::new();
    for event in &events {
        let entry = grouped
            .entry((event.module.clone(), event.action.clone()))
            .or_insert((0, 0, Vec::new()));
        entry.0 += 1;
        if event.status == "ok" || event.status == "succeeded" {
            entry.1 += 1;
        }
        if let Some(latency) = event.latency_ms {
            entry.2.push(latency);
        }
        if let Some(code) = &event.error_code {
            *failures.entry(code.clone()).or_insert(0) += 1;
        }
    }
    let mut actions: Vec<ActionStats> = grouped
        .into_iter()
        .map(|((module, action), (total, ok, mut latencies))| ActionStats {
            module,
            action,
            total,
            ok,
            success_rate: round4(ok as f64 / total.max(1) as f64),
            p95_latency_ms: p95(&mut latencies),
        })
        .collect();
    actions.sort_by(|left, right| {
        right
            .total
            .cmp(&left.total)
            .then_with(|| left.action.cmp(&right.action))
    });

    let mut failure_top: Vec<FailureEntry> = failures
        .into_iter()
        .map(|(error_code, count)| FailureEntry { error_code, count })
        .collect();
    failure_top.sort_by(|left, right| {
        right
            .count
            .cmp(&left.count)
            .then_with(|| left.error_code.cmp(&right.error_code))
    });
    failure_top.truncate(10);

    let summaries = store.list_run_summaries(500)?;
    let windowed: Vec<_> = summaries
        .iter()
        .filter(|summary| summary.sealed_at >= start)
        .collect();
    let run_total = windowed.len();
    let run_ok = windowed
        .iter()
        .filter(|summary| {
            matches!(summary.outcome, RunOutcome::Succeeded | RunOutcome::Degraded)
        })
        .count();
    let mut run_latencies: Vec<u64> = windowed
        .iter()
        .map(|summary| summary.total_latency_ms)
        .collect();
    let run_success_rate = if run_total == 0 {
        1.0
    } else {
        round4(run_ok as f64 / run_total as f64)
    };
    let p95_run_latency_ms = p95(&mut run_latencies);
    let slo = SloReport {
        runs: run_total,
        run_success_rate,
        success_target: config.tuner.slo_success_target,
        success_met: run_success_rate >= config.tuner.slo_success_target,
        p95_run_latency_ms,
        p95_target_ms: config.tuner.slo_p95_target_ms,
        latency_met: p95_run_latency_ms <= config.tuner.slo_p95_target_ms,
    };

    let open_breakers = store
        .list_breakers()?
        .into_iter()
        .filter(|record| record.state != BreakerState::Closed)
        .map(|record| record.key)
        .collect();

    Ok(ObservabilityReport {
        window_days,
        actions,
        failure_top,
        hotspots: store.failure_hotspots(start, now)?,
        slo,
        open_breakers,
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticCheck {
    pub name: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticReport {
    pub ok: bool,
    pub checks: Vec<DiagnosticCheck>,
}

/// Walk the dependency graph (env, config, registered services, breaker
/// state, last N runs) and return a severity-ranked report.
///
/// # Errors
/// Propagates store failures; individual check failures become entries.
pub fn diagnose(
    store: &dyn StateStore,
    config: &AgentOsConfig,
    services: &[&ServiceDescriptor],
    data_dir: &Path,
    last_runs: usize,
) -> Result<DiagnosticReport> {
    let mut checks = Vec::new();

    if data_dir.is_dir() {
        let probe = data_dir.join(".doctor_write_probe");
        match std::fs::write(&probe, "ok\n") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                checks.push(DiagnosticCheck {
                    name: "env:data_dir".to_string(),
                    severity: Severity::Info,
                    message: format!("writable at {}", data_dir.display()),
                });
            }
            Err(err) => checks.push(DiagnosticCheck {
                name: "env:data_dir".to_string(),
                severity: Severity::Error,
                message: format!("not writable: {err}"),
            }),
        }
    } else {
        checks.push(DiagnosticCheck {
            name: "env:data_dir".to_string(),
            severity: Severity::Error,
            message: format!("missing directory {}", data_dir.display()),
        });
    }

    match config.validate() {
        Ok(()) => checks.push(DiagnosticCheck {
            name: "config".to_string(),
            severity: Severity::Info,
            message: "configuration validates".to_string(),
        }),
        Err(err) => checks.push(DiagnosticCheck {
            name: "config".to_string(),
            severity: Severity::Error,
            message: err.to_string(),
        }),
    }

    for descriptor in services {
        let issues = lint_contract(descriptor);
        if issues.is_empty() {
            continue;
        }
        checks.push(DiagnosticCheck {
            name: format!("service:{}", descriptor.name),
            severity: Severity::Warning,
            message: issues.join("; "),
        });
    }
    checks.push(DiagnosticCheck {
        name: "services".to_string(),
        severity: Severity::Info,
        message: format!("{} services registered", services.len()),
    });

    for record in store.list_breakers()? {
        if record.state != BreakerState::Closed {
            checks.push(DiagnosticCheck {
                name: format!("breaker:{}", record.key),
                severity: Severity::Warning,
                message: format!(
                    "state={} failures={} last_error={}",
                    record.state.as_str(),
                    record.consecutive_failures,
                    record.last_error
                ),
            });
        }
    }

    let summaries = store.list_run_summaries(last_runs)?;
    if summaries.is_empty() {
        checks.push(DiagnosticCheck {
            name: "runs".to_string(),
            severity: Severity::Info,
            message: "no sealed runs yet".to_string(),
        });
    } else {
        let failed = summaries
            .iter()
            .filter(|summary| {
                matches!(summary.outcome, RunOutcome::Failed | RunOutcome::Aborted)
            })
            .count();
        checks.push(DiagnosticCheck {
            name: "runs".to_string(),
            severity: if failed * 2 > summaries.len() {
                Severity::Warning
            } else {
                Severity::Info
            },
            message: format!("{failed}/{} recent runs failed or aborted", summaries.len()),
        });
    }

    checks.sort_by(|left, right| {
        left.severity
            .cmp(&right.severity)
            .then_with(|| left.name.cmp(&right.name))
    });
    let ok = !checks
        .iter()
        .any(|check| check.severity == Severity::Error);
    Ok(DiagnosticReport { ok, checks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_os_domain::{now_utc, BreakerRecord, RunId, TelemetryEvent};
    use agent_os_services::builtin_services;
    use agent_os_state_core::StateStore;
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

    fn seed_event(store: &SqliteStateStore, action: &str, status: &str, latency: u64, code: Option<&str>) {
        must_ok(store.append_telemetry(&TelemetryEvent {
            ts: now_utc() - Duration::hours(1),
            module: "mcp".to_string(),
            action: action.to_string(),
            status: status.to_string(),
            trace_id: "trace".to_string(),
            run_id: Some(RunId::new()),
            latency_ms: Some(latency),
            error_code: code.map(str::to_string),
        }));
    }

    #[test]
    fn aggregate_counts_success_and_failure_top() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        for _ in 0..8 {
            seed_event(&store, "call:fetch/get", "ok", 120, None);
        }
        for _ in 0..2 {
            seed_event(&store, "call:fetch/get", "error", 5_000, Some("TIMEOUT"));
        }
        seed_event(&store, "call:sqlite/query", "error", 50, Some("POLICY_FORBIDDEN"));

        let report = must_ok(aggregate(&store, &AgentOsConfig::bootstrap(), 7, now_utc()));
        let fetch = report
            .actions
            .iter()
            .find(|stats| stats.action == "call:fetch/get")
            .unwrap_or_else(|| panic!("fetch stats missing"));
        assert_eq!(fetch.total, 10);
        assert!((fetch.success_rate - 0.8).abs() < 1e-9);
        assert_eq!(report.failure_top[0].error_code, "TIMEOUT");
        assert_eq!(report.failure_top[0].count, 2);
    }

    #[test]
    fn slo_reports_target_adherence_with_no_runs() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        let report = must_ok(aggregate(&store, &AgentOsConfig::bootstrap(), 7, now_utc()));
        assert_eq!(report.slo.runs, 0);
        assert!(report.slo.success_met);
        assert!(report.slo.latency_met);
    }

    #[test]
    fn diagnostics_rank_errors_before_warnings() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        must_ok(store.upsert_breaker(&BreakerRecord {
            key: "fetch/get".to_string(),
            state: agent_os_domain::BreakerState::Open,
            consecutive_failures: 3,
            opened_at: Some(now_utc()),
            last_error: "timeout".to_string(),
            updated_at: now_utc(),
        }));
        let services = builtin_services();
        let refs: Vec<&ServiceDescriptor> = services.iter().collect();
        let missing_dir = dir.path().join("absent");
        let report = must_ok(diagnose(
            &store,
            &AgentOsConfig::bootstrap(),
            &refs,
            &missing_dir,
            10,
        ));
        assert!(!report.ok);
        assert_eq!(report.checks[0].severity, Severity::Error);
        assert!(report
            .checks
            .iter()
            .any(|check| check.name == "breaker:fetch/get" && check.severity == Severity::Warning));
        let first_warning = report
            .checks
            .iter()
            .position(|check| check.severity == Severity::Warning);
        let first_info = report
            .checks
            .iter()
            .position(|check| check.severity == Severity::Info);
        if let (Some(warning), Some(info)) = (first_warning, first_info) {
            assert!(warning < info);
        }
    }

    #[test]
    fn healthy_environment_diagnoses_ok() {
        let dir = must_ok(tempfile::tempdir());
        let store = open_store(&dir);
        let services = builtin_services();
        let refs: Vec<&ServiceDescriptor> = services.iter().collect();
        let report = must_ok(diagnose(
            &store,
            &AgentOsConfig::bootstrap(),
            &refs,
            dir.path(),
            10,
        ));
        assert!(report.ok);
    }
}

//! The resilient run loop over ranked tool candidates: bounded transient
//! retries with exponential backoff, fallback to the next candidate, breaker
//! bookkeeping, replay records, and unified telemetry per call.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use agent_os_config::{BreakerSettings, McpSettings};
use agent_os_domain::{now_utc, ErrorKind, ReplayRecord, RunId, TelemetryEvent};
use agent_os_state_core::StateStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::Duration;

use crate::adapters::{
    FetchAdapter, FilesystemAdapter, PolicyEngine, SqliteAdapter, ThinkAdapter, ToolAdapter,
    ToolInfo,
};
use crate::breaker::{Admission, CircuitBreaker};
use crate::registry::ToolRegistry;
use crate::router::Router;
use crate::{McpError, McpErrorCode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedTool {
    pub rule: String,
    pub server: String,
    pub tool: String,
    pub score: f64,
    pub intent_match: f64,
    pub reliability: f64,
    pub latency_factor: f64,
    pub cost_penalty: f64,
    pub hits: Vec<String>,
    pub default_params: Map<String, Value>,
}

impl RankedTool {
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.server, self.tool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolAttempt {
    pub server: String,
    pub tool: String,
    pub status: String,
    pub attempt: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRunOutcome {
    pub ok: bool,
    pub run_id: RunId,
    pub selected: Option<RankedTool>,
    pub attempts: Vec<ToolAttempt>,
    pub result: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retries_used: u32,
    pub fallbacks_used: u32,
}

struct CallMetrics {
    success_rate: f64,
    p95_ms: f64,
    total: f64,
}

pub struct McpRuntime {
    registry: ToolRegistry,
    router: Router,
    breaker: CircuitBreaker,
    breaker_settings: BreakerSettings,
    store: Arc<dyn StateStore>,
    settings: McpSettings,
    workspace_root: PathBuf,
}

impl McpRuntime {
    #[must_use]
    pub fn new(
        registry: ToolRegistry,
        router: Router,
        store: Arc<dyn StateStore>,
        settings: McpSettings,
        breaker_settings: BreakerSettings,
        workspace_root: PathBuf,
    ) -> Self {
        let breaker = CircuitBreaker::new(Arc::clone(&store), breaker_settings.clone());
        Self {
            registry,
            router,
            breaker,
            breaker_settings,
            store,
            settings,
            workspace_root,
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn policy(&self) -> PolicyEngine {
        PolicyEngine::new(vec![self.workspace_root.clone()])
    }

    fn adapter_for(&self, server: &str) -> Result<Box<dyn ToolAdapter>, McpError> {
        let config = self.registry.get_server(server, true)?;
        let timeout_ms = self.registry.timeout_ms();
        match server {
            "filesystem" => Ok(Box::new(FilesystemAdapter::new(self.policy()))),
            "fetch" => Ok(Box::new(FetchAdapter::new(
                self.policy(),
                config.clone(),
                timeout_ms,
            ))),
            "sqlite" => Ok(Box::new(SqliteAdapter::new(self.policy(), config)?)),
            "sequential-thinking" => Ok(Box::new(ThinkAdapter)),
            other => Err(McpError::new(
                McpErrorCode::NotFound,
                format!("no adapter for server: {other}"),
            )),
        }
    }

    /// Tools per enabled server, for `services list` and diagnostics.
    #[must_use]
    pub fn list_tools(&self) -> Vec<(String, Vec<ToolInfo>)> {
        let mut out = Vec::new();
        for (name, _) in self.registry.list_servers(true) {
            match self.adapter_for(name) {
                Ok(adapter) => out.push((name.to_string(), adapter.list_tools())),
                Err(err) => {
                    tracing::warn!(server = name, %err, "adapter unavailable");
                }
            }
        }
        out
    }

    fn metrics_for(&self, key: &str) -> CallMetrics {
        let end = now_utc();
        let start = end - Duration::days(i64::from(self.settings.metrics_days));
        let action = format!("call:{key}");
        let events: Vec<TelemetryEvent> = self
            .store
            .telemetry_in_window(start, end)
            .unwrap_or_default()
            .into_iter()
            .filter(|event| event.module == "mcp" && event.action == action)
            .collect();
        if events.is_empty() {
            return CallMetrics {
                success_rate: 0.5,
                p95_ms: 1_800.0,
                total: 0.0,
            };
        }
        let total = events.len() as f64;
        let ok = events.iter().filter(|event| event.status == "ok").count() as f64;
        let mut latencies: Vec<u64> = events
            .iter()
            .filter_map(|event| event.latency_ms)
            .collect();
        latencies.sort_unstable();
        let p95_ms = if latencies.is_empty() {
            1_800.0
        } else {
            let index = ((latencies.len() as f64) * 0.95).ceil() as usize;
            latencies[index.saturating_sub(1).min(latencies.len() - 1)] as f64
        };
        CallMetrics {
            success_rate: ok / total,
            p95_ms,
            total,
        }
    }

    /// Rank tool candidates by intent match, smoothed historical success,
    /// inverse latency, and cost, filtered by breaker state.
    ///
    /// # Errors
    /// Propagates store failures while reading breaker state.
    pub fn rank(&self, text: &str) -> Result<Vec<RankedTool>> {
        let now = now_utc();
        let mut ranked = Vec::new();
        for candidate in self.router.candidates(text) {
            let Ok(server) = self.registry.get_server(&candidate.server, true) else {
                continue;
            };
            let key = format!("{}/{}", candidate.server, candidate.tool);
            if let Some(record) = self.store.get_breaker(&key)? {
                if record.state == agent_os_domain::BreakerState::Open {
                    let opened_at = record.opened_at.unwrap_or(record.updated_at);
                    let cooled = now - opened_at
                        >= Duration::seconds(self.breaker_settings.cooldown_seconds);
                    if !cooled {
                        continue;
                    }
                }
            }
            let metrics = self.metrics_for(&key);
            let prior = self.settings.success_prior_weight;
            let reliability =
                (metrics.success_rate * metrics.total + 0.5 * prior) / (metrics.total + prior);
            let latency_factor = (1.0 - (metrics.p95_ms.min(5_000.0) / 5_000.0)).max(0.0);
            let cost_penalty = (1.0 - server.cost).clamp(0.0, 1.0);
            let hit_bonus = (0.08 * candidate.hits.len() as f64).min(0.16);
            let score = self.settings.intent_weight * candidate.confidence
                + self.settings.success_weight * reliability
                + self.settings.latency_weight * latency_factor
                - self.settings.cost_weight * cost_penalty
                + hit_bonus;
            ranked.push(RankedTool {
                rule: candidate.rule,
                server: candidate.server,
                tool: candidate.tool,
                score: (score * 10_000.0).round() / 10_000.0,
                intent_match: candidate.confidence,
                reliability: (reliability * 10_000.0).round() / 10_000.0,
                latency_factor: (latency_factor * 10_000.0).round() / 10_000.0,
                cost_penalty,
                hits: candidate.hits,
                default_params: candidate.default_params,
            });
        }
        ranked.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.key().cmp(&right.key()))
        });
        ranked.truncate(self.settings.top_k.max(1));
        Ok(ranked)
    }

    fn backoff_delay(&self, key: &str, attempt: u32) -> std::time::Duration {
        let base = self.settings.backoff_base_ms as f64;
        let raw = base * self.settings.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let jitter_span = raw * self.settings.jitter_pct;
        // Deterministic jitter: stable FNV-1a over key+attempt avoids
        // platform-randomized hashers while still spreading retries.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in key.as_bytes().iter().chain(&attempt.to_le_bytes()) {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = (hash as f64 / u64::MAX as f64) * 2.0 - 1.0;
        let delay = (raw + fraction * jitter_span).max(0.0);
        std::time::Duration::from_millis(delay as u64)
    }

    fn record_call_telemetry(
        &self,
        run_id: RunId,
        key: &str,
        status: &str,
        latency_ms: u64,
        error_code: Option<String>,
    ) {
        let event = TelemetryEvent {
            ts: now_utc(),
            module: "mcp".to_string(),
            action: format!("call:{key}"),
            status: status.to_string(),
            trace_id: run_id.to_string(),
            run_id: Some(run_id),
            latency_ms: Some(latency_ms),
            error_code,
        };
        if let Err(err) = self.store.append_telemetry(&event) {
            tracing::warn!(%err, "telemetry append failed");
        }
    }

    fn record_replay(
        &self,
        run_id: RunId,
        step_id: u32,
        server: &str,
        tool: &str,
        params: &Map<String, Value>,
        status: &str,
        error: Option<String>,
    ) {
        let record = ReplayRecord {
            run_id,
            step_id,
            server: server.to_string(),
            tool: tool.to_string(),
            params: Value::Object(params.clone()),
            status: status.to_string(),
            error,
            recorded_at: now_utc(),
        };
        if let Err(err) = self.store.append_replay(&record) {
            tracing::warn!(%err, "replay append failed");
        }
    }

    /// One direct tool call with breaker, telemetry, and replay bookkeeping.
    ///
    /// # Errors
    /// Returns the typed tool error; breaker state is already updated.
    pub fn call(
        &self,
        run_id: RunId,
        step_id: u32,
        server: &str,
        tool: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, McpError> {
        let key = format!("{server}/{tool}");
        let adapter = self.adapter_for(server)?;
        let started = Instant::now();
        let outcome = adapter.call_tool(tool, params);
        let latency_ms = started.elapsed().as_millis() as u64;
        let now = now_utc();
        match &outcome {
            Ok(_) => {
                let _ = self.breaker.record_success(&key, now);
                self.record_call_telemetry(run_id, &key, "ok", latency_ms, None);
                self.record_replay(run_id, step_id, server, tool, params, "ok", None);
            }
            Err(err) => {
                let _ = self.breaker.record_failure(&key, &err.to_string(), now);
                self.record_call_telemetry(
                    run_id,
                    &key,
                    "error",
                    latency_ms,
                    Some(err.code.to_string()),
                );
                self.record_replay(
                    run_id,
                    step_id,
                    server,
                    tool,
                    params,
                    "error",
                    Some(err.to_string()),
                );
            }
        }
        outcome
    }

    /// Execute the full retry/fallback chain for one request.
    ///
    /// # Errors
    /// Propagates store failures; tool failures are folded into the outcome.
    #[allow(clippy::too_many_lines)]
    pub fn run(
        &self,
        run_id: RunId,
        text: &str,
        override_params: &Map<String, Value>,
        dry_run: bool,
        budget_ms: Option<u64>,
    ) -> Result<ToolRunOutcome> {
        let started = Instant::now();
        let ranked = self.rank(text)?;
        let budget = budget_ms.unwrap_or(self.settings.chain_budget_ms);

        if dry_run {
            let selected = ranked.first().cloned();
            let preview = selected.as_ref().map(|candidate| {
                let mut params = candidate.default_params.clone();
                for (key, value) in override_params {
                    params.insert(key.clone(), value.clone());
                }
                json!({"server": candidate.server, "tool": candidate.tool, "params": params})
            });
            return Ok(ToolRunOutcome {
                ok: selected.is_some(),
                run_id,
                selected,
                attempts: Vec::new(),
                result: preview,
                error_kind: None,
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
                retries_used: 0,
                fallbacks_used: 0,
            });
        }

        let mut attempts = Vec::new();
        let mut step_id: u32 = 0;
        let mut retries_used: u32 = 0;
        let mut fallbacks_used: u32 = 0;
        let mut last_error: Option<McpError> = None;

        for (position, candidate) in ranked.iter().enumerate() {
            if position > 0 {
                fallbacks_used += 1;
            }
            let key = candidate.key();
            match self.breaker.admit(&key, now_utc())? {
                Admission::Blocked => {
                    attempts.push(ToolAttempt {
                        server: candidate.server.clone(),
                        tool: candidate.tool.clone(),
                        status: "skipped".to_string(),
                        attempt: 0,
                        duration_ms: 0,
                        error: Some("circuit_open".to_string()),
                    });
                    continue;
                }
                Admission::Allowed | Admission::Probe => {}
            }

            let mut params = candidate.default_params.clone();
            for (param_key, value) in override_params {
                params.insert(param_key.clone(), value.clone());
            }
            if candidate.tool == "get" && !params.contains_key("url") {
                if let Some(url) = extract_url(text) {
                    params.insert("url".to_string(), json!(url));
                }
            }

            let max_attempts = self.settings.max_retries + 1;
            for attempt in 1..=max_attempts {
                if started.elapsed().as_millis() as u64 >= budget {
                    let error = "chain budget exceeded".to_string();
                    return Ok(ToolRunOutcome {
                        ok: false,
                        run_id,
                        selected: None,
                        attempts,
                        result: None,
                        error_kind: Some(ErrorKind::ToolTimeout),
                        error: Some(error),
                        duration_ms: started.elapsed().as_millis() as u64,
                        retries_used,
                        fallbacks_used,
                    });
                }
                let call_started = Instant::now();
                step_id += 1;
                let outcome = self.call(run_id, step_id, &candidate.server, &candidate.tool, &params);
                let duration_ms = call_started.elapsed().as_millis() as u64;
                match outcome {
                    Ok(result) => {
                        attempts.push(ToolAttempt {
                            server: candidate.server.clone(),
                            tool: candidate.tool.clone(),
                            status: "ok".to_string(),
                            attempt,
                            duration_ms,
                            error: None,
                        });
                        return Ok(ToolRunOutcome {
                            ok: true,
                            run_id,
                            selected: Some(candidate.clone()),
                            attempts,
                            result: Some(result),
                            error_kind: None,
                            error: None,
                            duration_ms: started.elapsed().as_millis() as u64,
                            retries_used,
                            fallbacks_used,
                        });
                    }
                    Err(err) => {
                        attempts.push(ToolAttempt {
                            server: candidate.server.clone(),
                            tool: candidate.tool.clone(),
                            status: "error".to_string(),
                            attempt,
                            duration_ms,
                            error: Some(err.to_string()),
                        });
                        let retryable = err.retryable();
                        last_error = Some(err);
                        if !retryable || attempt == max_attempts {
                            break;
                        }
                        retries_used += 1;
                        std::thread::sleep(self.backoff_delay(&key, attempt));
                    }
                }
            }
        }

        let (error_kind, error) = match last_error {
            Some(err) => (Some(err.error_kind()), Some(err.to_string())),
            None => (
                Some(ErrorKind::ServiceUnavailable),
                Some("no eligible tool candidates".to_string()),
            ),
        };
        Ok(ToolRunOutcome {
            ok: false,
            run_id,
            selected: None,
            attempts,
            result: None,
            error_kind,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            retries_used,
            fallbacks_used,
        })
    }

    /// Re-execute a recorded call chain. `dry_run` previews steps without
    /// side effects; otherwise every step is re-invoked under a fresh run id.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn replay(
        &self,
        source_run_id: RunId,
        dry_run: bool,
        include_failures: bool,
    ) -> Result<Value> {
        let mut steps = self.store.list_replay(source_run_id)?;
        if !include_failures {
            steps.retain(|step| step.status == "ok");
        }
        let replay_id = RunId::new();
        if dry_run {
            return Ok(json!({
                "ok": true,
                "mode": "dry-run",
                "replay_id": replay_id.to_string(),
                "source_run_id": source_run_id.to_string(),
                "step_count": steps.len(),
                "steps": steps,
            }));
        }
        let mut results = Vec::new();
        let mut all_ok = true;
        for (index, step) in steps.iter().enumerate() {
            let params = step
                .params
                .as_object()
                .cloned()
                .unwrap_or_default();
            let outcome = self.call(
                replay_id,
                u32::try_from(index + 1).unwrap_or(u32::MAX),
                &step.server,
                &step.tool,
                &params,
            );
            match outcome {
                Ok(result) => results.push(json!({
                    "step": index + 1,
                    "server": step.server,
                    "tool": step.tool,
                    "status": "ok",
                    "result": result,
                })),
                Err(err) => {
                    all_ok = false;
                    results.push(json!({
                        "step": index + 1,
                        "server": step.server,
                        "tool": step.tool,
                        "status": "error",
                        "error": err.to_string(),
                    }));
                }
            }
        }
        Ok(json!({
            "ok": all_ok,
            "mode": "replay",
            "replay_id": replay_id.to_string(),
            "source_run_id": source_run_id.to_string(),
            "step_count": results.len(),
            "steps": results,
        }))
    }
}

fn extract_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(|token| token.trim_end_matches(['，', '。', ',', '.']).to_string())
}

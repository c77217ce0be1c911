#![forbid(unsafe_code)]

//! The autonomy engine and kernel facade. Within one run, candidates execute
//! strictly in plan order under a failure/fallback discipline; every attempt
//! is persisted before the next begins. Across runs, a bounded worker pool
//! dispatches submissions from an in-process FIFO queue; overflow surfaces
//! as backpressure.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use agent_os_config::AgentOsConfig;
use agent_os_domain::{
    now_utc, ArtifactRef, AttemptId, AttemptStatus, AttemptTelemetry, DeliveryBundle, ErrorKind,
    ExecutionAttempt, ExecutionPlan, LoopClosure, Origin, Profile, RetryOption, RunContext,
    RunId, RunOutcome, RunSummary, TaskSpec, TelemetryEvent, WhyFailed,
};
use agent_os_mcp::McpRuntime;
use agent_os_planner::{
    bind_governor, build_question_set, build_run_context, build_task_spec, plan, resolve_profile,
    BlockedCandidate, ClarificationSet, PlanReport, GENERALIST_STRATEGY,
};
use agent_os_policy::{
    active_overrides, bind_controls, evaluate_strategy, scan_for_secrets, ApprovalVerifier,
    GateOutcome,
};
use agent_os_services::{
    bind_inputs, error_kind_of, evaluate_gates, ArtifactOutput, ErrorKindMarker,
    ServiceDescriptor, ServiceRegistry, ServiceRequest, ServiceResult,
};
use agent_os_state_core::StateStore;
use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use time::Duration;

/// Build the generalist strategy descriptor whose handler delegates to the
/// MCP runtime. Wired here (not in the service pack) because the handler
/// closes over the runtime.
#[must_use]
pub fn generalist_descriptor(mcp: Arc<McpRuntime>) -> ServiceDescriptor {
    use agent_os_domain::{ArtifactKind, ExecutionMode, Maturity, RiskLevel, TaskKind};
    use agent_os_services::{AcceptanceCheck, ServiceContract, ServiceHandler};

    let handler: ServiceHandler = Arc::new(move |request| {
        let mut params = Map::new();
        for (key, value) in &request.params {
            params.insert(key.clone(), value.clone());
        }
        let outcome = mcp.run(
            request.run_id,
            &request.text,
            &params,
            request.dry_run,
            Some(request.deadline_ms),
        )?;
        if !outcome.ok {
            let kind = outcome.error_kind.unwrap_or(ErrorKind::ServiceUnavailable);
            let message = outcome
                .error
                .unwrap_or_else(|| "tool chain exhausted".to_string());
            return Err(anyhow!(message).context(ErrorKindMarker(kind)));
        }
        let payload = json!({
            "summary": "tool chain completed",
            "selected": outcome.selected,
            "attempt_count": outcome.attempts.len(),
            "retries_used": outcome.retries_used,
            "fallbacks_used": outcome.fallbacks_used,
            "result": outcome.result,
        });
        Ok(agent_os_services::ServiceResponse {
            artifacts: vec![ArtifactOutput {
                bytes: serde_json::to_vec_pretty(&payload)?,
                kind: ArtifactKind::Json,
                advisory: false,
            }],
            payload,
        })
    });

    ServiceDescriptor {
        name: GENERALIST_STRATEGY.to_string(),
        version: "1.0.0".to_string(),
        description: "Routes the task to external tools with retries, fallback, and breaker isolation"
            .to_string(),
        layer: "core-generalist".to_string(),
        maturity: Maturity::Stable,
        risk_level: RiskLevel::Low,
        task_kinds: vec![
            TaskKind::Presentation,
            TaskKind::Research,
            TaskKind::DataQuery,
            TaskKind::Image,
            TaskKind::Automation,
            TaskKind::Other,
        ],
        keywords: vec![
            "抓取".to_string(),
            "fetch".to_string(),
            "http".to_string(),
            "搜索".to_string(),
            "工具".to_string(),
        ],
        contract: ServiceContract {
            inputs: Vec::new(),
            decision_gates: Vec::new(),
            execution_mode: ExecutionMode::Advisor,
            side_effects: Vec::new(),
            fallback: None,
            outputs: vec![ArtifactKind::Json],
            acceptance: vec![AcceptanceCheck::PayloadFieldPresent("summary".to_string())],
        },
        handler,
    }
}

/// Run status for the operator surface: a run is pending until its summary
/// is sealed.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelRunStatus {
    Pending,
    Sealed(RunSummary),
    Unknown,
}

struct PendingRun {
    cancel: Arc<AtomicBool>,
}

/// Everything one run needs; shared by the sync path and the worker pool.
pub struct EngineCore {
    config: AgentOsConfig,
    store: Arc<dyn StateStore>,
    registry: Arc<ServiceRegistry>,
    approvals: ApprovalVerifier,
    pending: Mutex<BTreeMap<RunId, PendingRun>>,
}

impl EngineCore {
    #[must_use]
    pub fn new(
        config: AgentOsConfig,
        store: Arc<dyn StateStore>,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        let approvals_dir = config.defaults.data_dir.join("approvals");
        let approvals = ApprovalVerifier::new(
            &approvals_dir,
            config.governance.approval_max_age_seconds,
        );
        Self {
            config,
            store,
            registry,
            approvals,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &AgentOsConfig {
        &self.config
    }

    fn catalog(&self) -> Vec<&ServiceDescriptor> {
        self.registry.descriptors()
    }

    fn emit(&self, event: TelemetryEvent) {
        if let Err(err) = self.store.append_telemetry(&event) {
            tracing::warn!(%err, "telemetry append failed");
        }
    }

    fn cancel_flag(&self, run_id: RunId) -> Arc<AtomicBool> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        pending
            .entry(run_id)
            .or_insert_with(|| PendingRun {
                cancel: Arc::new(AtomicBool::new(false)),
            })
            .cancel
            .clone()
    }

    fn finish_run(&self, run_id: RunId) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.remove(&run_id);
    }

    /// Request cooperative cancellation; checked before each attempt.
    pub fn cancel(&self, run_id: RunId) -> bool {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match pending.get(&run_id) {
            Some(run) => {
                run.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Current status of a run id.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn status(&self, run_id: RunId) -> Result<KernelRunStatus> {
        if let Some(summary) = self.store.get_run_summary(run_id)? {
            return Ok(KernelRunStatus::Sealed(summary));
        }
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if pending.contains_key(&run_id) {
            return Ok(KernelRunStatus::Pending);
        }
        Ok(KernelRunStatus::Unknown)
    }

    /// Build task spec, context, and plan without executing anything.
    ///
    /// # Errors
    /// Returns configuration or store failures.
    pub fn prepare(
        &self,
        run_id: RunId,
        text: &str,
        requested: Profile,
        origin: Origin,
        explicit_params: BTreeMap<String, Value>,
    ) -> Result<(TaskSpec, RunContext, PlanReport)> {
        let catalog = self.catalog();
        let task = build_task_spec(text, origin, explicit_params, &catalog, now_utc())?;
        let active = active_overrides(self.store.as_ref())?;
        let profile_overrides = agent_os_policy::profile_overrides_from(&active);
        let learned = if requested == Profile::Auto {
            agent_os_tuner::learn_preferences(self.store.as_ref(), 2)?
        } else {
            BTreeMap::new()
        };
        let resolved = resolve_profile(
            &self.config,
            requested,
            task.task_kind,
            &profile_overrides,
            &learned,
        );
        let settings = self
            .config
            .profile_settings(resolved.profile)
            .map_err(|err| anyhow!("{err}"))?
            .clone();
        let governor = bind_governor(&settings, resolved.profile);
        let controls = bind_controls(&self.config, resolved.profile, &active);
        let ctx = build_run_context(run_id, &task, requested, &resolved, governor, &controls);
        ctx.validate().map_err(|err| anyhow!("{err}"))?;

        let memory = agent_os_tuner::memory_scores(self.store.as_ref(), &self.config.tuner, now_utc())?;
        let report = plan(
            &ctx,
            &task,
            &catalog,
            &controls,
            &memory,
            &settings,
            self.config.ranker.memory_prior,
            self.config.ranker.min_candidate_score,
            self.config.ranker.ambiguity_gap_threshold,
        );
        Ok((task, ctx, report))
    }

    /// Execute one submission end to end under a known run id.
    ///
    /// # Errors
    /// Returns store/configuration failures; run-level failures seal a
    /// summary instead of erroring.
    pub fn execute(
        &self,
        run_id: RunId,
        text: &str,
        requested: Profile,
        origin: Origin,
        explicit_params: BTreeMap<String, Value>,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let result = self.execute_inner(run_id, text, requested, origin, explicit_params, started);
        self.finish_run(run_id);
        result
    }

    fn execute_inner(
        &self,
        run_id: RunId,
        text: &str,
        requested: Profile,
        origin: Origin,
        explicit_params: BTreeMap<String, Value>,
        started: Instant,
    ) -> Result<RunSummary> {
        let (task, ctx, report) = self.prepare(run_id, text, requested, origin, explicit_params)?;
        self.store.insert_task(&task)?;
        self.store.append_plan(&report.plan)?;
        self.emit(TelemetryEvent {
            ts: now_utc(),
            module: "kernel".to_string(),
            action: "plan_built".to_string(),
            status: "ok".to_string(),
            trace_id: ctx.trace_id.clone(),
            run_id: Some(run_id),
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error_code: None,
        });

        let clarification = self.clarification_for(&task, &report.plan);
        if clarification.needed {
            return self.seal_clarification(&task, &ctx, &clarification);
        }

        self.run_planned(&task, &ctx, &report.plan, &report.blocked)
    }

    fn clarification_for(&self, task: &TaskSpec, plan: &ExecutionPlan) -> ClarificationSet {
        let top = plan
            .candidates
            .first()
            .and_then(|candidate| self.registry.get(&candidate.strategy_id));
        build_question_set(task, top)
    }

    fn seal_clarification(
        &self,
        task: &TaskSpec,
        ctx: &RunContext,
        clarification: &ClarificationSet,
    ) -> Result<RunSummary> {
        let bundle = DeliveryBundle {
            run_id: ctx.run_id,
            headline: "More input needed before this task can run.".to_string(),
            why_failed: None,
            clarification_questions: clarification.questions.iter().take(2).cloned().collect(),
            assumptions: clarification.assumptions.clone(),
            primary_artifact: None,
            supporting_artifacts: Vec::new(),
            retry_options: vec![RetryOption::Strict, RetryOption::Adaptive],
        };
        let summary = RunSummary {
            run_id: ctx.run_id,
            task_id: task.task_id,
            outcome: RunOutcome::ClarificationNeeded,
            chosen_strategy: None,
            attempts_count: 0,
            total_latency_ms: 0,
            delivery_bundle_ref: format!("bundle:{}", ctx.run_id),
            sealed_at: now_utc(),
        };
        self.store.seal_run(&summary, &bundle)?;
        Ok(summary)
    }

    /// Execute an already-built plan. Public so exec-time governance
    /// re-checks can be exercised after policies change.
    ///
    /// # Errors
    /// Returns store failures; candidate failures advance the fallback
    /// pointer instead of erroring.
    #[allow(clippy::too_many_lines)]
    pub fn run_planned(
        &self,
        task: &TaskSpec,
        ctx: &RunContext,
        plan: &ExecutionPlan,
        blocked: &[BlockedCandidate],
    ) -> Result<RunSummary> {
        let cancel = self.cancel_flag(ctx.run_id);
        let mut attempts: Vec<ExecutionAttempt> = Vec::new();
        let mut last_error: Option<(ErrorKind, String)> = None;
        let mut aborted = false;

        for (rank, candidate) in plan.candidates.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                aborted = true;
                last_error = Some((ErrorKind::InternalError, "operator cancellation".to_string()));
                break;
            }

            // Governance is re-verified per attempt: policies may have
            // changed since the plan was built.
            let active = active_overrides(self.store.as_ref())?;
            let controls = bind_controls(&self.config, ctx.resolved_profile, &active);
            if let GateOutcome::Blocked(reasons) = evaluate_strategy(
                &candidate.strategy_id,
                &candidate.required_layer,
                candidate.maturity,
                candidate.risk_level,
                &controls,
            ) {
                let reason = reasons.join(", ");
                attempts.push(self.record_attempt(
                    ctx,
                    candidate.strategy_id.clone(),
                    rank,
                    AttemptStatus::Skipped,
                    Some(ErrorKind::GovernanceBlock),
                    Some(reason.clone()),
                    Vec::new(),
                    AttemptTelemetry::default(),
                    "skipped",
                    &reason,
                )?);
                last_error = Some((ErrorKind::GovernanceBlock, reason));
                continue;
            }

            if let Some(hit) =
                scan_for_secrets(&task.explicit_params, &self.config.governance.sensitive_patterns)
            {
                let message = format!("sensitive pattern detected in outgoing params ({hit})");
                attempts.push(self.record_attempt(
                    ctx,
                    candidate.strategy_id.clone(),
                    rank,
                    AttemptStatus::Aborted,
                    Some(ErrorKind::PolicyViolation),
                    Some(message.clone()),
                    Vec::new(),
                    AttemptTelemetry::default(),
                    "aborted",
                    &message,
                )?);
                last_error = Some((ErrorKind::PolicyViolation, message));
                aborted = true;
                break;
            }

            let Some(descriptor) = self.registry.get(&candidate.strategy_id) else {
                let message = format!("strategy '{}' has no registered service", candidate.strategy_id);
                attempts.push(self.record_attempt(
                    ctx,
                    candidate.strategy_id.clone(),
                    rank,
                    AttemptStatus::Failed,
                    Some(ErrorKind::InternalError),
                    Some(message.clone()),
                    Vec::new(),
                    AttemptTelemetry::default(),
                    "failed",
                    &message,
                )?);
                last_error = Some((ErrorKind::InternalError, message));
                continue;
            };

            if let Some(reason) = self.approval_gate(descriptor, task, &controls) {
                attempts.push(self.record_attempt(
                    ctx,
                    candidate.strategy_id.clone(),
                    rank,
                    AttemptStatus::Skipped,
                    Some(ErrorKind::ApprovalRequired),
                    Some(reason.clone()),
                    Vec::new(),
                    AttemptTelemetry::default(),
                    "skipped",
                    &reason,
                )?);
                last_error = Some((ErrorKind::ApprovalRequired, reason));
                continue;
            }

            let request = ServiceRequest {
                run_id: ctx.run_id,
                strategy_id: candidate.strategy_id.clone(),
                text: task.text.clone(),
                params: task.explicit_params.clone(),
                deadline_ms: self.config.defaults.attempt_deadline_ms,
                dry_run: false,
            };
            let attempt_started = Instant::now();
            let outcome = invoke_with_deadline(
                Arc::clone(&self.registry),
                candidate.strategy_id.clone(),
                request,
                self.config.defaults.attempt_deadline_ms,
            );
            let latency_ms = attempt_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(ServiceResult::Completed(response)) => {
                    let artifacts =
                        self.persist_artifacts(&candidate.strategy_id, &response.artifacts)?;
                    let telemetry = AttemptTelemetry {
                        latency_ms,
                        retries: payload_u32(&response.payload, "retries_used"),
                        fallbacks_used: rank as u32
                            + payload_u32(&response.payload, "fallbacks_used"),
                    };
                    let attempt = self.record_attempt(
                        ctx,
                        candidate.strategy_id.clone(),
                        rank,
                        AttemptStatus::Succeeded,
                        None,
                        None,
                        artifacts,
                        telemetry,
                        "completed",
                        "",
                    )?;
                    attempts.push(attempt);
                    return self.seal_success(task, ctx, plan, &attempts);
                }
                Ok(ServiceResult::Partial { response, violation }) => {
                    let mut advisory_outputs = response.artifacts.clone();
                    for output in &mut advisory_outputs {
                        output.advisory = true;
                    }
                    let artifacts =
                        self.persist_artifacts(&candidate.strategy_id, &advisory_outputs)?;
                    attempts.push(self.record_attempt(
                        ctx,
                        candidate.strategy_id.clone(),
                        rank,
                        AttemptStatus::Failed,
                        Some(ErrorKind::ContractViolation),
                        Some(violation.clone()),
                        artifacts,
                        AttemptTelemetry {
                            latency_ms,
                            retries: 0,
                            fallbacks_used: rank as u32,
                        },
                        "failed",
                        &violation,
                    )?);
                    last_error = Some((ErrorKind::ContractViolation, violation));
                }
                Ok(ServiceResult::Skipped { error_kind, reason }) => {
                    attempts.push(self.record_attempt(
                        ctx,
                        candidate.strategy_id.clone(),
                        rank,
                        AttemptStatus::Skipped,
                        Some(error_kind),
                        Some(reason.clone()),
                        Vec::new(),
                        AttemptTelemetry {
                            latency_ms,
                            retries: 0,
                            fallbacks_used: rank as u32,
                        },
                        "skipped",
                        &reason,
                    )?);
                    last_error = Some((error_kind, reason));
                }
                Err(err) => {
                    let kind = error_kind_of(&err);
                    let message = format!("{err:#}");
                    let status = if kind.fatal() {
                        AttemptStatus::Aborted
                    } else {
                        AttemptStatus::Failed
                    };
                    attempts.push(self.record_attempt(
                        ctx,
                        candidate.strategy_id.clone(),
                        rank,
                        status,
                        Some(kind),
                        Some(message.clone()),
                        Vec::new(),
                        AttemptTelemetry {
                            latency_ms,
                            retries: 0,
                            fallbacks_used: rank as u32,
                        },
                        if kind.fatal() { "aborted" } else { "failed" },
                        &message,
                    )?);
                    last_error = Some((kind, message));
                    if kind.fatal() {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        // All candidates exhausted (or the run was aborted).
        let outcome = if aborted {
            RunOutcome::Aborted
        } else if attempts
            .iter()
            .any(|attempt| attempt.artifacts.iter().any(|artifact| artifact.advisory))
        {
            RunOutcome::Degraded
        } else {
            RunOutcome::Failed
        };
        self.seal_failure(task, ctx, &attempts, outcome, last_error, blocked)
    }

    fn approval_gate(
        &self,
        descriptor: &ServiceDescriptor,
        task: &TaskSpec,
        controls: &agent_os_policy::GovernanceControls,
    ) -> Option<String> {
        use agent_os_domain::ExecutionMode;
        let publishes = descriptor.contract.execution_mode == ExecutionMode::Operator
            && descriptor
                .contract
                .side_effects
                .iter()
                .any(|effect| effect == "publish");
        let escalated = match bind_inputs(&descriptor.contract, &task.explicit_params) {
            Ok(bound) => evaluate_gates(&descriptor.contract, &bound).needs_escalation,
            Err(_) => false,
        };
        if !(publishes && controls.require_approval_for_publish) && !escalated {
            return None;
        }
        match self.approvals.verify_and_consume(&descriptor.name, now_utc()) {
            Ok(approval) => {
                tracing::info!(
                    service = %descriptor.name,
                    approver = %approval.approver,
                    counter = approval.counter,
                    "approval consumed"
                );
                None
            }
            Err(err) => Some(err.to_string()),
        }
    }

    fn persist_artifacts(
        &self,
        produced_by: &str,
        outputs: &[ArtifactOutput],
    ) -> Result<Vec<ArtifactRef>> {
        let mut out = Vec::with_capacity(outputs.len());
        for output in outputs {
            out.push(self.store.put_artifact(
                &output.bytes,
                output.kind,
                produced_by,
                output.advisory,
            )?);
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_attempt(
        &self,
        ctx: &RunContext,
        strategy_id: String,
        rank: usize,
        status: AttemptStatus,
        error_kind: Option<ErrorKind>,
        error_message: Option<String>,
        artifacts: Vec<ArtifactRef>,
        telemetry: AttemptTelemetry,
        closure_status: &str,
        closure_reason: &str,
    ) -> Result<ExecutionAttempt> {
        let now = now_utc();
        let attempt = ExecutionAttempt {
            attempt_id: AttemptId::new(),
            run_id: ctx.run_id,
            strategy_id: strategy_id.clone(),
            rank,
            started_at: now - Duration::milliseconds(i64::try_from(telemetry.latency_ms).unwrap_or(0)),
            ended_at: now,
            status,
            error_kind,
            error_message,
            artifacts,
            telemetry,
            loop_closure: LoopClosure {
                status: closure_status.to_string(),
                reason: closure_reason.to_string(),
                evidence: json!({
                    "strategy": strategy_id,
                    "rank": rank,
                    "profile": ctx.resolved_profile.as_str(),
                }),
                next_actions: match status {
                    AttemptStatus::Succeeded => vec![
                        "Collect operator feedback for this run".to_string(),
                    ],
                    _ => vec![
                        "Review the failed strategy path".to_string(),
                        "Tune profile or governance if the block was intended".to_string(),
                    ],
                },
            },
        };
        self.store.append_attempt(&attempt)?;
        self.emit(TelemetryEvent {
            ts: now,
            module: "engine".to_string(),
            action: format!("attempt:{strategy_id}"),
            status: status.as_str().to_string(),
            trace_id: ctx.trace_id.clone(),
            run_id: Some(ctx.run_id),
            latency_ms: Some(attempt.telemetry.latency_ms),
            error_code: error_kind.map(|kind| kind.as_str().to_string()),
        });
        Ok(attempt)
    }

    fn seal_success(
        &self,
        task: &TaskSpec,
        ctx: &RunContext,
        plan: &ExecutionPlan,
        attempts: &[ExecutionAttempt],
    ) -> Result<RunSummary> {
        let winner = attempts
            .last()
            .ok_or_else(|| anyhow!("success seal requires at least one attempt"))?;
        let mut artifacts = winner.artifacts.clone();
        let primary = if artifacts.is_empty() {
            None
        } else {
            Some(artifacts.remove(0))
        };
        let headline = match &primary {
            Some(artifact) => format!(
                "{} task completed by {}; primary artifact {}",
                task.task_kind.as_str(),
                winner.strategy_id,
                artifact.uri
            ),
            None => format!(
                "{} task completed by {}",
                task.task_kind.as_str(),
                winner.strategy_id
            ),
        };
        let bundle = DeliveryBundle {
            run_id: ctx.run_id,
            headline,
            why_failed: None,
            clarification_questions: Vec::new(),
            assumptions: Vec::new(),
            primary_artifact: primary,
            supporting_artifacts: artifacts,
            retry_options: Vec::new(),
        };
        let summary = RunSummary {
            run_id: ctx.run_id,
            task_id: task.task_id,
            outcome: RunOutcome::Succeeded,
            chosen_strategy: Some(winner.strategy_id.clone()),
            attempts_count: attempts.len(),
            total_latency_ms: attempts.iter().map(|a| a.telemetry.latency_ms).sum(),
            delivery_bundle_ref: format!("bundle:{}", ctx.run_id),
            sealed_at: now_utc(),
        };
        self.store.seal_run(&summary, &bundle)?;
        tracing::info!(
            run_id = %ctx.run_id,
            strategy = %winner.strategy_id,
            attempts = attempts.len(),
            ambiguous = plan.ambiguous,
            "run succeeded"
        );
        Ok(summary)
    }

    fn seal_failure(
        &self,
        task: &TaskSpec,
        ctx: &RunContext,
        attempts: &[ExecutionAttempt],
        outcome: RunOutcome,
        last_error: Option<(ErrorKind, String)>,
        blocked: &[BlockedCandidate],
    ) -> Result<RunSummary> {
        let why_failed = last_error.map(|(error_kind, summary)| WhyFailed {
            error_kind,
            summary,
        });
        let mut retry_options = vec![RetryOption::Strict, RetryOption::Adaptive];
        let risk_blocked = blocked.iter().any(|candidate| {
            candidate
                .reasons
                .iter()
                .any(|reason| reason.starts_with("risk_blocked:"))
        });
        if risk_blocked {
            retry_options.push(RetryOption::AllowHighRiskOnce);
        }
        let advisory: Vec<ArtifactRef> = attempts
            .iter()
            .flat_map(|attempt| attempt.artifacts.iter().cloned())
            .collect();
        let headline = match outcome {
            RunOutcome::Aborted => format!("{} run aborted", task.task_kind.as_str()),
            RunOutcome::Degraded => format!(
                "{} run degraded; advisory output only",
                task.task_kind.as_str()
            ),
            _ => format!("{} run failed after {} attempts", task.task_kind.as_str(), attempts.len()),
        };
        let bundle = DeliveryBundle {
            run_id: ctx.run_id,
            headline,
            why_failed,
            clarification_questions: Vec::new(),
            assumptions: Vec::new(),
            primary_artifact: None,
            supporting_artifacts: advisory,
            retry_options,
        };
        let summary = RunSummary {
            run_id: ctx.run_id,
            task_id: task.task_id,
            outcome,
            chosen_strategy: None,
            attempts_count: attempts.len(),
            total_latency_ms: attempts.iter().map(|a| a.telemetry.latency_ms).sum(),
            delivery_bundle_ref: format!("bundle:{}", ctx.run_id),
            sealed_at: now_utc(),
        };
        self.store.seal_run(&summary, &bundle)?;
        Ok(summary)
    }
}

fn payload_u32(payload: &Value, field: &str) -> u32 {
    payload
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(0)
}

fn invoke_with_deadline(
    registry: Arc<ServiceRegistry>,
    name: String,
    request: ServiceRequest,
    deadline_ms: u64,
) -> Result<ServiceResult> {
    let (sender, receiver) = mpsc::channel();
    std::thread::spawn(move || {
        let result = registry.call(&name, &request);
        let _ = sender.send(result);
    });
    match receiver.recv_timeout(std::time::Duration::from_millis(deadline_ms)) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(anyhow!(
            "attempt deadline of {deadline_ms}ms exceeded"
        )
        .context(ErrorKindMarker(ErrorKind::ToolTimeout))),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("service worker disappeared")
            .context(ErrorKindMarker(ErrorKind::InternalError))),
    }
}

enum Job {
    Run {
        run_id: RunId,
        text: String,
        profile: Profile,
        origin: Origin,
        params: BTreeMap<String, Value>,
    },
}

/// The kernel facade: synchronous execution plus a bounded FIFO worker pool
/// for queued submissions.
pub struct Kernel {
    core: Arc<EngineCore>,
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Kernel {
    #[must_use]
    pub fn new(core: Arc<EngineCore>) -> Self {
        let worker_count = core.config.resolved_worker_count();
        let capacity = core.config.defaults.queue_capacity;
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let receiver = Arc::clone(&receiver);
            let core = Arc::clone(&core);
            workers.push(std::thread::spawn(move || loop {
                let job = {
                    let guard = receiver.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    guard.recv()
                };
                match job {
                    Ok(Job::Run {
                        run_id,
                        text,
                        profile,
                        origin,
                        params,
                    }) => {
                        if let Err(err) = core.execute(run_id, &text, profile, origin, params) {
                            tracing::error!(worker = index, %run_id, %err, "queued run failed");
                        }
                    }
                    Err(_) => break,
                }
            }));
        }
        Self {
            core,
            sender: Some(sender),
            workers,
        }
    }

    #[must_use]
    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// Enqueue a run. A full admission queue is rejected with backpressure;
    /// nothing is retried internally.
    ///
    /// # Errors
    /// Returns a `backpressure`-classified error when the queue is full.
    pub fn submit(
        &self,
        text: &str,
        profile: Profile,
        origin: Origin,
        params: BTreeMap<String, Value>,
    ) -> Result<RunId> {
        let run_id = RunId::new();
        // Register the pending entry before enqueueing so status() sees it.
        let _ = self.core.cancel_flag(run_id);
        let job = Job::Run {
            run_id,
            text: text.to_string(),
            profile,
            origin,
            params,
        };
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("kernel is shut down"))?;
        match sender.try_send(job) {
            Ok(()) => Ok(run_id),
            Err(TrySendError::Full(_)) => {
                self.core.finish_run(run_id);
                Err(anyhow!("admission queue is full")
                    .context(ErrorKindMarker(ErrorKind::Backpressure)))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.core.finish_run(run_id);
                Err(anyhow!("worker pool stopped"))
            }
        }
    }

    /// Execute a submission synchronously on the caller's thread.
    ///
    /// # Errors
    /// See [`EngineCore::execute`].
    pub fn execute_blocking(
        &self,
        text: &str,
        profile: Profile,
        origin: Origin,
        params: BTreeMap<String, Value>,
    ) -> Result<RunSummary> {
        let run_id = RunId::new();
        let _ = self.core.cancel_flag(run_id);
        self.core.execute(run_id, text, profile, origin, params)
    }

    /// Drain the queue and stop the workers.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_os_config::{BreakerSettings, McpSettings};
    use agent_os_domain::{ArtifactKind, Maturity, RiskLevel, TaskKind};
    use agent_os_mcp::{Router, ToolRegistry};
    use agent_os_policy::{apply_overrides, ApprovalFile, OVERRIDE_BLOCKED};
    use agent_os_services::{builtin_services, AcceptanceCheck, ServiceContract, ServiceHandler};
    use agent_os_state_sqlite::SqliteStateStore;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn build_core(dir: &tempfile::TempDir) -> Arc<EngineCore> {
        build_core_with(dir, |_| {})
    }

    fn build_core_with(
        dir: &tempfile::TempDir,
        tweak: impl FnOnce(&mut AgentOsConfig),
    ) -> Arc<EngineCore> {
        let mut config = AgentOsConfig::bootstrap();
        config.defaults.data_dir = dir.path().to_path_buf();
        config.defaults.worker_count = 1;
        tweak(&mut config);
        let store: Arc<dyn StateStore> = {
            let store = must_ok(SqliteStateStore::open(dir.path()));
            must_ok(store.migrate());
            Arc::new(store)
        };
        let mcp = Arc::new(McpRuntime::new(
            ToolRegistry::builtin(),
            Router::builtin(),
            Arc::clone(&store),
            {
                let mut settings = McpSettings::default();
                settings.backoff_base_ms = 1;
                settings
            },
            BreakerSettings::default(),
            dir.path().to_path_buf(),
        ));
        let mut registry = ServiceRegistry::new(false);
        for descriptor in builtin_services() {
            must_ok(registry.register(descriptor));
        }
        must_ok(registry.register(generalist_descriptor(mcp)));
        must_ok(registry.finalize());
        Arc::new(EngineCore::new(config, store, Arc::new(registry)))
    }

    #[test]
    fn happy_path_presentation_run() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);
        let summary = must_ok(core.execute(
            RunId::new(),
            "请生成本季度增长复盘框架",
            Profile::Auto,
            Origin::Cli,
            BTreeMap::new(),
        ));
        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert_eq!(summary.chosen_strategy.as_deref(), Some("mckinsey-ppt"));
        assert_eq!(summary.attempts_count, 1);

        let bundle = must_ok(core.store().get_delivery_bundle(summary.run_id))
            .unwrap_or_else(|| panic!("bundle missing"));
        let primary = bundle
            .primary_artifact
            .unwrap_or_else(|| panic!("primary artifact missing"));
        assert!(bundle.headline.contains(&primary.uri));
        assert_eq!(primary.kind, ArtifactKind::Json);
        assert!(must_ok(core.store().verify_artifact(&primary)));
    }

    #[test]
    fn attempts_form_strict_prefix_of_plan() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);
        let run_id = RunId::new();
        let (task, ctx, report) = must_ok(core.prepare(
            run_id,
            "请生成本季度增长复盘框架",
            Profile::Adaptive,
            Origin::Cli,
            BTreeMap::new(),
        ));
        must_ok(core.store().insert_task(&task));
        must_ok(core.store().append_plan(&report.plan));
        let summary = must_ok(core.run_planned(&task, &ctx, &report.plan, &report.blocked));
        let attempts = must_ok(core.store().list_attempts(summary.run_id));
        assert_eq!(attempts.len(), summary.attempts_count);
        for (index, attempt) in attempts.iter().enumerate() {
            assert_eq!(attempt.rank, index);
            assert_eq!(
                attempt.strategy_id,
                report.plan.candidates[index].strategy_id
            );
        }
        let last = attempts.last().unwrap_or_else(|| panic!("no attempts"));
        assert_eq!(last.status, AttemptStatus::Succeeded);
    }

    #[test]
    fn exec_time_governance_recheck_skips_blocked_strategy() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);
        let run_id = RunId::new();
        let (task, ctx, report) = must_ok(core.prepare(
            run_id,
            "请生成本季度增长复盘框架",
            Profile::Adaptive,
            Origin::Cli,
            BTreeMap::new(),
        ));
        must_ok(core.store().insert_task(&task));
        must_ok(core.store().append_plan(&report.plan));
        assert_eq!(report.plan.candidates[0].strategy_id, "mckinsey-ppt");

        // Policy changes between plan time and execution time.
        must_ok(apply_overrides(
            core.store().as_ref(),
            &[agent_os_domain::PolicyOverride {
                scope: agent_os_domain::OverrideScope::Strategy,
                key: "mckinsey-ppt".to_string(),
                value: json!(OVERRIDE_BLOCKED),
            }],
            "operator",
            "block ppt",
            now_utc(),
        ));

        let summary = must_ok(core.run_planned(&task, &ctx, &report.plan, &report.blocked));
        let attempts = must_ok(core.store().list_attempts(summary.run_id));
        assert_eq!(attempts[0].status, AttemptStatus::Skipped);
        assert_eq!(attempts[0].error_kind, Some(ErrorKind::GovernanceBlock));
        assert!(attempts.len() > 1, "engine proceeds to the next candidate");
    }

    #[test]
    fn publish_without_approval_is_skipped_with_approval_required() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);
        let run_id = RunId::new();
        let (task, ctx, mut report) = must_ok(core.prepare(
            run_id,
            "发布 本周经营报告",
            Profile::Adaptive,
            Origin::Cli,
            BTreeMap::new(),
        ));
        report
            .plan
            .candidates
            .retain(|candidate| candidate.strategy_id == "report-publisher");
        assert_eq!(report.plan.candidates.len(), 1, "publisher must be planned");
        must_ok(core.store().insert_task(&task));
        must_ok(core.store().append_plan(&report.plan));

        let summary = must_ok(core.run_planned(&task, &ctx, &report.plan, &report.blocked));
        assert_eq!(summary.outcome, RunOutcome::Failed);
        let attempts = must_ok(core.store().list_attempts(summary.run_id));
        assert_eq!(attempts[0].status, AttemptStatus::Skipped);
        assert_eq!(attempts[0].error_kind, Some(ErrorKind::ApprovalRequired));
        let bundle = must_ok(core.store().get_delivery_bundle(summary.run_id))
            .unwrap_or_else(|| panic!("bundle missing"));
        assert_eq!(
            bundle.why_failed.map(|w| w.error_kind),
            Some(ErrorKind::ApprovalRequired)
        );
    }

    #[test]
    fn publish_with_valid_approval_succeeds() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);
        let approvals_dir = dir.path().join("approvals");
        must_ok(std::fs::create_dir_all(&approvals_dir));
        let approval = ApprovalFile {
            token: "tok-99".to_string(),
            approver: "operator".to_string(),
            counter: 1,
            issued_at: now_utc(),
        };
        must_ok(std::fs::write(
            approvals_dir.join("report-publisher.json"),
            must_ok(serde_json::to_string(&approval)),
        ));

        let run_id = RunId::new();
        let (task, ctx, mut report) = must_ok(core.prepare(
            run_id,
            "发布 本周经营报告",
            Profile::Adaptive,
            Origin::Cli,
            BTreeMap::new(),
        ));
        report
            .plan
            .candidates
            .retain(|candidate| candidate.strategy_id == "report-publisher");
        must_ok(core.store().insert_task(&task));
        must_ok(core.store().append_plan(&report.plan));
        let summary = must_ok(core.run_planned(&task, &ctx, &report.plan, &report.blocked));
        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert_eq!(summary.chosen_strategy.as_deref(), Some("report-publisher"));
    }

    #[test]
    fn secret_in_params_aborts_with_policy_violation() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);
        let mut params = BTreeMap::new();
        params.insert("api".to_string(), json!("sk-live-secret-token"));
        let summary = must_ok(core.execute(
            RunId::new(),
            "请生成本季度增长复盘框架",
            Profile::Adaptive,
            Origin::Cli,
            params,
        ));
        assert_eq!(summary.outcome, RunOutcome::Aborted);
        let attempts = must_ok(core.store().list_attempts(summary.run_id));
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error_kind, Some(ErrorKind::PolicyViolation));
        assert_eq!(attempts[0].status, AttemptStatus::Aborted);
    }

    #[test]
    fn missing_required_input_short_circuits_with_clarification() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);
        let summary = must_ok(core.execute(
            RunId::new(),
            "data: 查询上季度销售数据",
            Profile::Adaptive,
            Origin::Cli,
            BTreeMap::new(),
        ));
        assert_eq!(summary.outcome, RunOutcome::ClarificationNeeded);
        assert_eq!(summary.attempts_count, 0);
        let bundle = must_ok(core.store().get_delivery_bundle(summary.run_id))
            .unwrap_or_else(|| panic!("bundle missing"));
        assert!(!bundle.clarification_questions.is_empty());
        assert!(bundle.clarification_questions.len() <= 2);
    }

    #[test]
    fn cancelled_run_seals_aborted_before_first_attempt() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);
        let run_id = RunId::new();
        let (task, ctx, report) = must_ok(core.prepare(
            run_id,
            "请生成本季度增长复盘框架",
            Profile::Adaptive,
            Origin::Cli,
            BTreeMap::new(),
        ));
        must_ok(core.store().insert_task(&task));
        must_ok(core.store().append_plan(&report.plan));
        core.cancel_flag(run_id).store(true, Ordering::SeqCst);
        assert!(core.cancel(run_id));
        let summary = must_ok(core.run_planned(&task, &ctx, &report.plan, &report.blocked));
        assert_eq!(summary.outcome, RunOutcome::Aborted);
        assert_eq!(summary.attempts_count, 0);
    }

    #[test]
    fn slow_service_times_out_as_tool_timeout() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core_with(&dir, |config| {
            config.defaults.attempt_deadline_ms = 50;
        });

        // Register a deliberately slow service and force it into the plan.
        let slow: ServiceHandler = Arc::new(|_| {
            std::thread::sleep(std::time::Duration::from_millis(400));
            Ok(agent_os_services::ServiceResponse {
                payload: json!({"summary": "late"}),
                artifacts: vec![ArtifactOutput {
                    bytes: b"late".to_vec(),
                    kind: ArtifactKind::Md,
                    advisory: false,
                }],
            })
        });
        let mut registry = ServiceRegistry::new(false);
        must_ok(registry.register(ServiceDescriptor {
            name: "slow-service".to_string(),
            version: "1.0.0".to_string(),
            description: "sleeps past the deadline".to_string(),
            layer: "core-generalist".to_string(),
            maturity: Maturity::Stable,
            risk_level: RiskLevel::Low,
            task_kinds: vec![TaskKind::Other],
            keywords: Vec::new(),
            contract: ServiceContract {
                inputs: Vec::new(),
                decision_gates: Vec::new(),
                execution_mode: agent_os_domain::ExecutionMode::Advisor,
                side_effects: Vec::new(),
                fallback: None,
                outputs: vec![ArtifactKind::Md],
                acceptance: vec![AcceptanceCheck::ArtifactsNonEmpty],
            },
            handler: slow,
        }));
        let slow_core = Arc::new(EngineCore::new(
            core.config().clone(),
            Arc::clone(core.store()),
            Arc::new(registry),
        ));

        let run_id = RunId::new();
        let (task, ctx, mut report) = must_ok(slow_core.prepare(
            run_id,
            "just do something slow",
            Profile::Adaptive,
            Origin::Cli,
            BTreeMap::new(),
        ));
        report.plan.candidates.retain(|c| c.strategy_id == "slow-service");
        assert_eq!(report.plan.candidates.len(), 1);
        must_ok(slow_core.store().insert_task(&task));
        must_ok(slow_core.store().append_plan(&report.plan));
        let summary = must_ok(slow_core.run_planned(&task, &ctx, &report.plan, &report.blocked));
        assert_eq!(summary.outcome, RunOutcome::Failed);
        let attempts = must_ok(slow_core.store().list_attempts(summary.run_id));
        assert_eq!(attempts[0].error_kind, Some(ErrorKind::ToolTimeout));
    }

    #[test]
    fn full_queue_rejects_with_backpressure() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core_with(&dir, |config| {
            config.defaults.queue_capacity = 1;
            config.defaults.worker_count = 1;
        });
        let kernel = Kernel::new(core);
        let mut backpressure_seen = false;
        for _ in 0..40 {
            match kernel.submit(
                "请生成本季度增长复盘框架",
                Profile::Adaptive,
                Origin::Scheduler,
                BTreeMap::new(),
            ) {
                Ok(_) => {}
                Err(err) => {
                    assert_eq!(error_kind_of(&err), ErrorKind::Backpressure);
                    backpressure_seen = true;
                    break;
                }
            }
        }
        assert!(backpressure_seen, "a 1-slot queue must overflow");
    }

    #[test]
    fn queued_run_becomes_visible_through_status() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);
        let kernel = Kernel::new(Arc::clone(&core));
        let run_id = must_ok(kernel.submit(
            "请生成本季度增长复盘框架",
            Profile::Adaptive,
            Origin::Cli,
            BTreeMap::new(),
        ));
        let deadline = Instant::now() + std::time::Duration::from_secs(30);
        loop {
            match must_ok(core.status(run_id)) {
                KernelRunStatus::Sealed(summary) => {
                    assert_eq!(summary.outcome, RunOutcome::Succeeded);
                    break;
                }
                KernelRunStatus::Pending | KernelRunStatus::Unknown => {
                    assert!(Instant::now() < deadline, "queued run never sealed");
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
            }
        }
    }

    #[test]
    fn degraded_outcome_when_only_advisory_output_lands() {
        let dir = must_ok(tempfile::tempdir());
        let core = build_core(&dir);

        // A service whose response violates acceptance but carries an
        // advisory artifact.
        let partial: ServiceHandler = Arc::new(|_| {
            Ok(agent_os_services::ServiceResponse {
                payload: json!({"summary": "partial"}),
                artifacts: vec![ArtifactOutput {
                    bytes: b"# partial notes".to_vec(),
                    kind: ArtifactKind::Md,
                    advisory: true,
                }],
            })
        });
        let mut registry = ServiceRegistry::new(false);
        must_ok(registry.register(ServiceDescriptor {
            name: "partial-service".to_string(),
            version: "1.0.0".to_string(),
            description: "always partial".to_string(),
            layer: "core-generalist".to_string(),
            maturity: Maturity::Stable,
            risk_level: RiskLevel::Low,
            task_kinds: vec![TaskKind::Other],
            keywords: vec!["generic".to_string()],
            contract: ServiceContract {
                inputs: Vec::new(),
                decision_gates: Vec::new(),
                execution_mode: agent_os_domain::ExecutionMode::Advisor,
                side_effects: Vec::new(),
                fallback: None,
                outputs: vec![ArtifactKind::Json],
                acceptance: vec![AcceptanceCheck::ArtifactKindPresent(ArtifactKind::Json)],
            },
            handler: partial,
        }));
        let partial_core = Arc::new(EngineCore::new(
            core.config().clone(),
            Arc::clone(core.store()),
            Arc::new(registry),
        ));

        let run_id = RunId::new();
        let (task, ctx, mut report) = must_ok(partial_core.prepare(
            run_id,
            "some generic request",
            Profile::Adaptive,
            Origin::Cli,
            BTreeMap::new(),
        ));
        report
            .plan
            .candidates
            .retain(|c| c.strategy_id == "partial-service");
        assert_eq!(report.plan.candidates.len(), 1);
        must_ok(partial_core.store().insert_task(&task));
        must_ok(partial_core.store().append_plan(&report.plan));
        let summary = must_ok(partial_core.run_planned(&task, &ctx, &report.plan, &report.blocked));
        assert_eq!(summary.outcome, RunOutcome::Degraded);
        let attempts = must_ok(partial_core.store().list_attempts(summary.run_id));
        assert_eq!(attempts[0].error_kind, Some(ErrorKind::ContractViolation));
        assert!(attempts[0].artifacts.iter().all(|a| a.advisory));
    }
}

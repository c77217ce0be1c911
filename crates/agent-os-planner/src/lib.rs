#![forbid(unsafe_code)]

//! Kernel planning: turn free text into a classified `TaskSpec`, resolve the
//! governance profile, detect structurally missing inputs, and rank strategy
//! candidates into a deterministic `ExecutionPlan`.

use std::collections::{BTreeMap, BTreeSet};

use agent_os_config::{AgentOsConfig, ProfileSettings};
use agent_os_domain::{
    ensure_non_empty, DateTimeUtc, ExecutionPlan, Origin, Profile, RunContext, RunId,
    ServiceBinding, StrategyCandidate, TaskId, TaskKind, TaskSpec,
};
use agent_os_policy::{evaluate_strategy, GateOutcome, GovernanceControls, ProfileOverrides};
use agent_os_services::ServiceDescriptor;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Strategy id of the generalist fallback; it never drops out of candidate
/// generation on base score alone.
pub const GENERALIST_STRATEGY: &str = "mcp-generalist";
const GENERALIST_FLOOR: f64 = 0.45;

/// Explicit verb prefixes checked before any keyword matching.
const PREFIXES: &[(&str, TaskKind)] = &[
    ("ppt:", TaskKind::Presentation),
    ("slides:", TaskKind::Presentation),
    ("research:", TaskKind::Research),
    ("data:", TaskKind::DataQuery),
    ("sql:", TaskKind::DataQuery),
    ("image:", TaskKind::Image),
    ("img:", TaskKind::Image),
    ("auto:", TaskKind::Automation),
    ("run:", TaskKind::Automation),
];

const PRESENTATION_WORDS: &[&str] = &["ppt", "slide", "deck", "汇报", "演示", "复盘"];
const IMAGE_WORDS: &[&str] = &["图像", "图片", "海报", "poster", "画一", "image"];
const RESEARCH_WORDS: &[&str] = &[
    "tam",
    "sam",
    "som",
    "prisma",
    "systematic review",
    "meta analysis",
    "文献搜索",
    "系统综述",
    "研究报告",
    "研报",
    "荟萃分析",
    "市场规模",
];
const DATA_WORDS: &[&str] = &["表格", "excel", "xlsx", "sql", "数据库", "查询"];
const AUTOMATION_WORDS: &[&str] = &["抓取", "crawl", "fetch", "http://", "https://", "定时", "schedule", "采集"];

/// Classify a task: explicit prefixes, then keyword families, then the
/// capability catalog. Unknown text is not an error; it routes to `other`.
#[must_use]
pub fn classify_task(text: &str, catalog: &[&ServiceDescriptor]) -> TaskKind {
    let low = text.to_lowercase();
    let trimmed = low.trim_start();
    for (prefix, kind) in PREFIXES {
        if trimmed.starts_with(prefix) {
            return *kind;
        }
    }
    for (words, kind) in [
        (PRESENTATION_WORDS, TaskKind::Presentation),
        (IMAGE_WORDS, TaskKind::Image),
        (RESEARCH_WORDS, TaskKind::Research),
        (DATA_WORDS, TaskKind::DataQuery),
        (AUTOMATION_WORDS, TaskKind::Automation),
    ] {
        if words.iter().any(|word| low.contains(word)) {
            return kind;
        }
    }
    let mut best: Option<(usize, TaskKind)> = None;
    for descriptor in catalog {
        let hits = descriptor
            .keywords
            .iter()
            .filter(|keyword| low.contains(keyword.to_lowercase().as_str()))
            .count();
        if hits == 0 {
            continue;
        }
        let kind = descriptor.task_kinds.first().copied().unwrap_or(TaskKind::Other);
        match best {
            Some((count, _)) if count >= hits => {}
            _ => best = Some((hits, kind)),
        }
    }
    best.map_or(TaskKind::Other, |(_, kind)| kind)
}

#[must_use]
pub fn detect_language(text: &str) -> String {
    if text.chars().any(|ch| ('\u{4e00}'..='\u{9fff}').contains(&ch)) {
        "zh".to_string()
    } else {
        "en".to_string()
    }
}

#[must_use]
pub fn task_intent(kind: TaskKind) -> String {
    match kind {
        TaskKind::Presentation => "prepare_decision_material",
        TaskKind::Research => "build_evidence_led_analysis",
        TaskKind::DataQuery => "query_or_transform_data",
        TaskKind::Image => "generate_creative_asset",
        TaskKind::Automation => "execute_tool_workflow",
        TaskKind::Other => "general_problem_solving",
    }
    .to_string()
}

/// Build the immutable ingress record for a request.
///
/// # Errors
/// Returns an error when the text is empty.
pub fn build_task_spec(
    text: &str,
    origin: Origin,
    explicit_params: BTreeMap<String, serde_json::Value>,
    catalog: &[&ServiceDescriptor],
    now: DateTimeUtc,
) -> Result<TaskSpec> {
    ensure_non_empty("text", text)?;
    let task_kind = classify_task(text, catalog);
    Ok(TaskSpec {
        task_id: TaskId::new(),
        text: text.to_string(),
        task_kind,
        language: detect_language(text),
        intent: task_intent(task_kind),
        entered_at: now,
        origin,
        explicit_params,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProfile {
    pub profile: Profile,
    pub source: String,
}

/// Resolve `auto` through overrides, then learned preferences, then the
/// configured default. A concrete request wins outright.
#[must_use]
pub fn resolve_profile(
    config: &AgentOsConfig,
    requested: Profile,
    task_kind: TaskKind,
    overrides: &ProfileOverrides,
    learned: &BTreeMap<TaskKind, Profile>,
) -> ResolvedProfile {
    if requested != Profile::Auto {
        return ResolvedProfile {
            profile: requested,
            source: "request".to_string(),
        };
    }
    if let Some(profile) = overrides.task_kind_profiles.get(&task_kind) {
        return ResolvedProfile {
            profile: *profile,
            source: "auto_override".to_string(),
        };
    }
    if let Some(profile) = learned.get(&task_kind) {
        return ResolvedProfile {
            profile: *profile,
            source: "learned_preference".to_string(),
        };
    }
    if let Some(profile) = overrides.default_profile {
        return ResolvedProfile {
            profile,
            source: "auto_override_default".to_string(),
        };
    }
    let fallback = match config.defaults.profile {
        Profile::Auto => Profile::Strict,
        concrete => concrete,
    };
    ResolvedProfile {
        profile: fallback,
        source: "auto_fallback_default".to_string(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Governor {
    pub deterministic: bool,
    pub learning_enabled: bool,
    pub max_fallback_steps: usize,
}

/// Derive the run governor from profile settings. Strict always disables
/// learning and caps fallback at one step, whatever the file says.
#[must_use]
pub fn bind_governor(settings: &ProfileSettings, profile: Profile) -> Governor {
    if profile == Profile::Strict {
        return Governor {
            deterministic: true,
            learning_enabled: false,
            max_fallback_steps: 1,
        };
    }
    Governor {
        deterministic: settings.deterministic,
        learning_enabled: settings.learning_enabled,
        max_fallback_steps: settings.max_fallback_steps.max(1),
    }
}

/// Assemble the profile-bound run envelope. The run id is allocated by the
/// caller so queued submissions can hand it out before execution starts.
#[must_use]
pub fn build_run_context(
    run_id: RunId,
    task: &TaskSpec,
    requested: Profile,
    resolved: &ResolvedProfile,
    governor: Governor,
    controls: &GovernanceControls,
) -> RunContext {
    RunContext {
        run_id,
        task_id: task.task_id,
        profile: requested,
        resolved_profile: resolved.profile,
        profile_source: resolved.source.clone(),
        allowed_layers: controls.allowed_layers.iter().cloned().collect(),
        blocked_maturity: controls.blocked_maturity.iter().copied().collect(),
        max_risk_level: controls.max_risk_level,
        allowed_strategies: controls.allowed_strategies.iter().cloned().collect(),
        blocked_strategies: controls.blocked_strategies.iter().cloned().collect(),
        deterministic: governor.deterministic,
        learning_enabled: governor.learning_enabled,
        max_fallback_steps: governor.max_fallback_steps,
        trace_id: run_id.to_string(),
    }
}

/// Structurally missing high-value inputs, enumerated by the capability
/// contract. At most two questions per run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClarificationSet {
    pub needed: bool,
    pub questions: Vec<String>,
    pub assumptions: Vec<String>,
}

#[must_use]
pub fn build_question_set(task: &TaskSpec, top: Option<&ServiceDescriptor>) -> ClarificationSet {
    let mut set = ClarificationSet::default();
    let Some(descriptor) = top else {
        return set;
    };
    for input in &descriptor.contract.inputs {
        if task.explicit_params.contains_key(&input.name) {
            continue;
        }
        match (&input.default, input.required) {
            (None, true) => {
                if set.questions.len() < 2 {
                    let domain = if input.allowed_values.is_empty() {
                        String::new()
                    } else {
                        format!(" (one of: {})", input.allowed_values.join(", "))
                    };
                    set.questions
                        .push(format!("Provide a value for `{}`{domain}.", input.name));
                }
                set.needed = true;
            }
            (Some(default), _) if input.high_value => {
                set.assumptions
                    .push(format!("assuming {} = {default}", input.name));
            }
            _ => {}
        }
    }
    set
}

fn tokenize(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch.to_ascii_lowercase());
        } else {
            if !current.is_empty() {
                tokens.insert(std::mem::take(&mut current));
            }
            if ('\u{4e00}'..='\u{9fff}').contains(&ch) {
                tokens.insert(ch.to_string());
            }
        }
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn base_score(text: &str, descriptor: &ServiceDescriptor) -> (f64, Vec<String>, usize) {
    let low = text.to_lowercase();
    let hits: Vec<String> = descriptor
        .keywords
        .iter()
        .filter(|keyword| low.contains(keyword.to_lowercase().as_str()))
        .cloned()
        .collect();
    let trigger_score = hits.len() as f64 * 0.4;

    let text_tokens = tokenize(text);
    let mut descriptor_text = format!("{} {}", descriptor.name, descriptor.description);
    for keyword in &descriptor.keywords {
        descriptor_text.push(' ');
        descriptor_text.push_str(keyword);
    }
    let descriptor_tokens = tokenize(&descriptor_text);
    let overlap = text_tokens.intersection(&descriptor_tokens).count();
    let overlap_score = if text_tokens.is_empty() {
        0.0
    } else {
        (overlap as f64 / text_tokens.len() as f64).min(1.0) * 0.8
    };

    let mut score = trigger_score + overlap_score;
    if descriptor.name == GENERALIST_STRATEGY {
        score = score.max(GENERALIST_FLOOR);
    }
    (round4(score.min(1.0)), hits, overlap)
}

/// A candidate the governance gate rejected at plan time, with reasons.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockedCandidate {
    pub strategy_id: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanReport {
    pub plan: ExecutionPlan,
    pub blocked: Vec<BlockedCandidate>,
}

/// Rank every eligible strategy into an `ExecutionPlan`. The ordering is a
/// total order (composite desc, risk asc, maturity desc, id lex) so that a
/// plan built from identical overrides and history is byte-identical.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn plan(
    ctx: &RunContext,
    task: &TaskSpec,
    catalog: &[&ServiceDescriptor],
    controls: &GovernanceControls,
    memory_scores: &BTreeMap<String, f64>,
    settings: &ProfileSettings,
    memory_prior: f64,
    min_candidate_score: f64,
    ambiguity_gap_threshold: f64,
) -> PlanReport {
    let mut candidates = Vec::new();
    let mut blocked = Vec::new();

    for descriptor in catalog {
        if !descriptor.task_kinds.contains(&task.task_kind)
            && !(task.task_kind == TaskKind::Other
                && descriptor.task_kinds.contains(&TaskKind::Other))
        {
            continue;
        }
        match evaluate_strategy(
            &descriptor.name,
            &descriptor.layer,
            descriptor.maturity,
            descriptor.risk_level,
            controls,
        ) {
            GateOutcome::Blocked(reasons) => {
                blocked.push(BlockedCandidate {
                    strategy_id: descriptor.name.clone(),
                    reasons,
                });
                continue;
            }
            GateOutcome::Allowed => {}
        }

        let (base, hits, overlap) = base_score(&task.text, descriptor);
        if base < min_candidate_score && descriptor.name != GENERALIST_STRATEGY {
            continue;
        }
        let memory = memory_scores
            .get(&descriptor.name)
            .copied()
            .unwrap_or(memory_prior);
        let mut composite =
            round4(settings.base_weight * base + settings.memory_weight * memory);
        let demoted = controls.demoted_strategies.contains(&descriptor.name);
        if demoted {
            composite = round4((composite - 0.5).max(0.0));
        }

        let mut score_detail = BTreeMap::new();
        score_detail.insert("skill_score".to_string(), json!(base));
        score_detail.insert("memory_rate".to_string(), json!(round4(memory)));
        score_detail.insert("trigger_hits".to_string(), json!(hits));
        score_detail.insert("token_overlap".to_string(), json!(overlap));
        if demoted {
            score_detail.insert("demoted".to_string(), json!(true));
        }

        candidates.push(StrategyCandidate {
            strategy_id: descriptor.name.clone(),
            service_binding: ServiceBinding {
                service_name: descriptor.name.clone(),
                version: descriptor.version.clone(),
            },
            base_score: base,
            memory_score: round4(memory),
            composite_score: composite,
            risk_level: descriptor.risk_level,
            maturity: descriptor.maturity,
            required_layer: descriptor.layer.clone(),
            required_inputs: descriptor
                .contract
                .inputs
                .iter()
                .filter(|input| input.required)
                .map(|input| input.name.clone())
                .collect(),
            score_detail,
        });
    }

    candidates.sort_by(|left, right| {
        right
            .composite_score
            .total_cmp(&left.composite_score)
            .then_with(|| left.risk_level.cmp(&right.risk_level))
            .then_with(|| right.maturity.cmp(&left.maturity))
            .then_with(|| left.strategy_id.cmp(&right.strategy_id))
    });

    let score_gap = if candidates.len() > 1 {
        round4(candidates[0].composite_score - candidates[1].composite_score)
    } else {
        1.0
    };
    let ambiguous = ctx.resolved_profile == Profile::Strict
        && candidates.len() > 1
        && score_gap < ambiguity_gap_threshold;

    // An ambiguous strict plan keeps both leading candidates even when the
    // fallback budget is one; execution stays sequential.
    let keep = if ambiguous {
        ctx.max_fallback_steps.max(2)
    } else {
        ctx.max_fallback_steps.max(1)
    };
    candidates.truncate(keep);

    tracing::debug!(
        run_id = %ctx.run_id,
        candidates = candidates.len(),
        blocked = blocked.len(),
        score_gap,
        "plan built"
    );

    PlanReport {
        plan: ExecutionPlan {
            run_id: ctx.run_id,
            task_kind: task.task_kind,
            profile: ctx.resolved_profile,
            candidates,
            ambiguous,
            score_gap,
        },
        blocked,
    }
}

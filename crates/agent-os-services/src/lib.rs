#![forbid(unsafe_code)]

//! Uniform invocation of leaf capabilities. Every registered service declares
//! a capability contract (inputs, decision gates, execution mode, fallback,
//! outputs, acceptance post-conditions); the registry lints the contract at
//! registration time and wraps every invocation so that eligibility failures
//! surface as skips, never as errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use agent_os_domain::{
    ArtifactKind, ErrorKind, ExecutionMode, Maturity, RiskLevel, RunId, TaskKind,
};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("contract lint failed for '{service}': {issues:?}")]
    Lint { service: String, issues: Vec<String> },
    #[error("unknown service '{0}'")]
    Unknown(String),
    #[error("duplicate service '{0}'")]
    Duplicate(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    pub description: String,
    /// Empty means any value is admissible.
    #[serde(default)]
    pub allowed_values: Vec<String>,
    #[serde(default)]
    pub default: Option<Value>,
    /// High-value inputs drive the clarification short-circuit when missing.
    #[serde(default)]
    pub high_value: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Trigger,
    Reject,
    Escalate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Equals,
    NotEquals,
    Contains,
    Present,
    Absent,
}

/// Pure predicate over bound inputs; no hidden context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatePredicate {
    pub param: String,
    pub op: PredicateOp,
    #[serde(default)]
    pub value: Option<Value>,
}

impl GatePredicate {
    #[must_use]
    pub fn evaluate(&self, params: &BTreeMap<String, Value>) -> bool {
        let found = params.get(&self.param);
        match self.op {
            PredicateOp::Present => found.is_some(),
            PredicateOp::Absent => found.is_none(),
            PredicateOp::Equals => match (found, &self.value) {
                (Some(actual), Some(expected)) => actual == expected,
                _ => false,
            },
            PredicateOp::NotEquals => match (found, &self.value) {
                (Some(actual), Some(expected)) => actual != expected,
                _ => true,
            },
            PredicateOp::Contains => match (found, &self.value) {
                (Some(Value::String(actual)), Some(Value::String(needle))) => {
                    actual.contains(needle.as_str())
                }
                (Some(Value::Array(items)), Some(expected)) => items.contains(expected),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionGate {
    pub name: String,
    pub action: GateAction,
    pub predicate: GatePredicate,
}

/// Machine-checkable post-conditions evaluated against a service response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "check", content = "arg")]
pub enum AcceptanceCheck {
    ArtifactsNonEmpty,
    ArtifactKindPresent(ArtifactKind),
    PayloadFieldPresent(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceContract {
    pub inputs: Vec<ParamSpec>,
    pub decision_gates: Vec<DecisionGate>,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub side_effects: Vec<String>,
    #[serde(default)]
    pub fallback: Option<String>,
    pub outputs: Vec<ArtifactKind>,
    pub acceptance: Vec<AcceptanceCheck>,
}

/// Raw artifact produced by a handler; the engine surrenders it to the state
/// store before the attempt is sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOutput {
    pub bytes: Vec<u8>,
    pub kind: ArtifactKind,
    pub advisory: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub payload: Value,
    pub artifacts: Vec<ArtifactOutput>,
}

#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub run_id: RunId,
    pub strategy_id: String,
    pub text: String,
    pub params: BTreeMap<String, Value>,
    pub deadline_ms: u64,
    pub dry_run: bool,
}

pub type ServiceHandler = Arc<dyn Fn(&ServiceRequest) -> Result<ServiceResponse> + Send + Sync>;

/// A registered capability: a data record whose behavior is injected as a
/// function value (no inheritance).
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    pub layer: String,
    pub maturity: Maturity,
    pub risk_level: RiskLevel,
    pub task_kinds: Vec<TaskKind>,
    pub keywords: Vec<String>,
    pub contract: ServiceContract,
    pub handler: ServiceHandler,
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("layer", &self.layer)
            .field("maturity", &self.maturity)
            .field("risk_level", &self.risk_level)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a descriptor for `services list` and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub layer: String,
    pub maturity: Maturity,
    pub risk_level: RiskLevel,
    pub execution_mode: ExecutionMode,
    pub task_kinds: Vec<TaskKind>,
    pub side_effects: Vec<String>,
    pub fallback: Option<String>,
    pub required_inputs: Vec<String>,
}

impl From<&ServiceDescriptor> for ServiceInfo {
    fn from(descriptor: &ServiceDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            description: descriptor.description.clone(),
            layer: descriptor.layer.clone(),
            maturity: descriptor.maturity,
            risk_level: descriptor.risk_level,
            execution_mode: descriptor.contract.execution_mode,
            task_kinds: descriptor.task_kinds.clone(),
            side_effects: descriptor.contract.side_effects.clone(),
            fallback: descriptor.contract.fallback.clone(),
            required_inputs: descriptor
                .contract
                .inputs
                .iter()
                .filter(|input| input.required)
                .map(|input| input.name.clone())
                .collect(),
        }
    }
}

/// Verdict for one invocation. Gates are part of eligibility, not error;
/// an acceptance failure surfaces the partial response so callers can keep
/// its artifacts as advisory evidence.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceResult {
    Completed(ServiceResponse),
    Partial {
        response: ServiceResponse,
        violation: String,
    },
    Skipped {
        error_kind: ErrorKind,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateEvaluation {
    pub eligible: bool,
    pub needs_escalation: bool,
    pub reasons: Vec<String>,
}

pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDescriptor>,
    strict_lint: bool,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(strict_lint: bool) -> Self {
        Self {
            services: BTreeMap::new(),
            strict_lint,
        }
    }

    /// Register a service, enforcing the capability contract lint. In strict
    /// mode any lint issue is fatal; otherwise issues are logged and the
    /// service is registered anyway.
    ///
    /// # Errors
    /// Returns [`RegistryError`] on duplicates or (strict mode) lint issues.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<(), RegistryError> {
        if self.services.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        let issues = lint_contract(&descriptor);
        if !issues.is_empty() {
            if self.strict_lint {
                return Err(RegistryError::Lint {
                    service: descriptor.name,
                    issues,
                });
            }
            tracing::warn!(service = %descriptor.name, ?issues, "contract lint issues");
        }
        self.services.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Cross-service check run after registration: fallback chains must
    /// reference known services.
    ///
    /// # Errors
    /// Returns [`RegistryError::Lint`] in strict mode when a fallback dangles.
    pub fn finalize(&self) -> Result<(), RegistryError> {
        for descriptor in self.services.values() {
            if let Some(fallback) = &descriptor.contract.fallback {
                if !self.services.contains_key(fallback) {
                    let issue = format!("fallback references unknown service '{fallback}'");
                    if self.strict_lint {
                        return Err(RegistryError::Lint {
                            service: descriptor.name.clone(),
                            issues: vec![issue],
                        });
                    }
                    tracing::warn!(service = %descriptor.name, issue, "dangling fallback");
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    #[must_use]
    pub fn list(&self) -> Vec<ServiceInfo> {
        self.services.values().map(ServiceInfo::from).collect()
    }

    #[must_use]
    pub fn descriptors(&self) -> Vec<&ServiceDescriptor> {
        self.services.values().collect()
    }

    /// Uniform invocation: bind inputs, evaluate decision gates, invoke the
    /// handler, then check acceptance post-conditions.
    ///
    /// # Errors
    /// Returns an error only for handler failures or acceptance violations;
    /// eligibility failures return [`ServiceResult::Skipped`].
    pub fn call(&self, name: &str, request: &ServiceRequest) -> Result<ServiceResult> {
        let descriptor = self
            .services
            .get(name)
            .ok_or_else(|| anyhow!(RegistryError::Unknown(name.to_string())))?;

        let bound = match bind_inputs(&descriptor.contract, &request.params) {
            Ok(bound) => bound,
            Err(missing) => {
                return Ok(ServiceResult::Skipped {
                    error_kind: ErrorKind::MissingInput,
                    reason: format!("missing required inputs: {}", missing.join(", ")),
                });
            }
        };

        let gates = evaluate_gates(&descriptor.contract, &bound);
        if !gates.eligible {
            return Ok(ServiceResult::Skipped {
                error_kind: ErrorKind::GovernanceBlock,
                reason: format!("decision gates rejected: {}", gates.reasons.join(", ")),
            });
        }

        let mut effective = request.clone();
        effective.params = bound;
        let response = (descriptor.handler)(&effective)?;

        match check_acceptance(&descriptor.contract, &response) {
            Ok(()) => Ok(ServiceResult::Completed(response)),
            Err(violation) => Ok(ServiceResult::Partial {
                response,
                violation,
            }),
        }
    }
}

/// Carried in error chains so callers can classify without string matching.
#[derive(Debug, Clone, Copy)]
pub struct ErrorKindMarker(pub ErrorKind);

impl std::fmt::Display for ErrorKindMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}

/// Classify an error chain back into the stable taxonomy. Downcasting digs
/// through attached context values.
#[must_use]
pub fn error_kind_of(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<ErrorKindMarker>()
        .map_or(ErrorKind::InternalError, |marker| marker.0)
}

/// Registration-time lint over a single contract.
#[must_use]
pub fn lint_contract(descriptor: &ServiceDescriptor) -> Vec<String> {
    let mut issues = Vec::new();
    if descriptor.name.trim().is_empty() {
        issues.push("service name MUST be non-empty".to_string());
    }
    if descriptor.version.trim().is_empty() {
        issues.push("service version MUST be non-empty".to_string());
    }
    if descriptor.layer.trim().is_empty() {
        issues.push("layer MUST be declared".to_string());
    }
    if descriptor.task_kinds.is_empty() {
        issues.push("task_kinds MUST be non-empty".to_string());
    }
    if descriptor.contract.outputs.is_empty() {
        issues.push("outputs MUST declare at least one artifact kind".to_string());
    }
    if descriptor.contract.acceptance.is_empty() {
        issues.push("acceptance MUST declare at least one post-condition".to_string());
    }
    let input_names: Vec<&str> = descriptor
        .contract
        .inputs
        .iter()
        .map(|input| input.name.as_str())
        .collect();
    for gate in &descriptor.contract.decision_gates {
        if !input_names.contains(&gate.predicate.param.as_str()) {
            issues.push(format!(
                "decision gate '{}' references undeclared input '{}'",
                gate.name, gate.predicate.param
            ));
        }
    }
    for input in &descriptor.contract.inputs {
        if input.required {
            if let (Some(default), false) = (&input.default, input.allowed_values.is_empty()) {
                if let Value::String(raw) = default {
                    if !input.allowed_values.contains(raw) {
                        issues.push(format!(
                            "input '{}' default is outside its value domain",
                            input.name
                        ));
                    }
                }
            }
        }
    }
    if descriptor.contract.execution_mode == ExecutionMode::Advisor
        && !descriptor.contract.side_effects.is_empty()
    {
        issues.push("advisor services MUST NOT declare side effects".to_string());
    }
    issues
}

/// Resolve required/optional parameters against the contract: apply defaults,
/// then report required inputs that remain unbound.
///
/// # Errors
/// Returns the sorted list of missing required input names.
pub fn bind_inputs(
    contract: &ServiceContract,
    explicit: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, Vec<String>> {
    let mut bound = explicit.clone();
    let mut missing = Vec::new();
    for input in &contract.inputs {
        if bound.contains_key(&input.name) {
            continue;
        }
        if let Some(default) = &input.default {
            bound.insert(input.name.clone(), default.clone());
        } else if input.required {
            missing.push(input.name.clone());
        }
    }
    if missing.is_empty() {
        Ok(bound)
    } else {
        missing.sort();
        Err(missing)
    }
}

/// Evaluate decision gates over bound inputs. Reject gates veto; when trigger
/// gates exist at least one must hold; escalate gates raise the approval
/// requirement without vetoing.
#[must_use]
pub fn evaluate_gates(
    contract: &ServiceContract,
    params: &BTreeMap<String, Value>,
) -> GateEvaluation {
    let mut evaluation = GateEvaluation {
        eligible: true,
        needs_escalation: false,
        reasons: Vec::new(),
    };
    let mut trigger_seen = false;
    let mut trigger_hit = false;
    for gate in &contract.decision_gates {
        let holds = gate.predicate.evaluate(params);
        match gate.action {
            GateAction::Reject => {
                if holds {
                    evaluation.eligible = false;
                    evaluation.reasons.push(format!("reject:{}", gate.name));
                }
            }
            GateAction::Trigger => {
                trigger_seen = true;
                if holds {
                    trigger_hit = true;
                }
            }
            GateAction::Escalate => {
                if holds {
                    evaluation.needs_escalation = true;
                    evaluation.reasons.push(format!("escalate:{}", gate.name));
                }
            }
        }
    }
    if trigger_seen && !trigger_hit {
        evaluation.eligible = false;
        evaluation.reasons.push("trigger:none_matched".to_string());
    }
    evaluation
}

fn check_acceptance(contract: &ServiceContract, response: &ServiceResponse) -> Result<(), String> {
    for check in &contract.acceptance {
        match check {
            AcceptanceCheck::ArtifactsNonEmpty => {
                if response.artifacts.is_empty() {
                    return Err("acceptance failed: no artifacts produced".to_string());
                }
            }
            AcceptanceCheck::ArtifactKindPresent(kind) => {
                if !response.artifacts.iter().any(|a| a.kind == *kind) {
                    return Err(format!(
                        "acceptance failed: missing {} artifact",
                        kind.as_str()
                    ));
                }
            }
            AcceptanceCheck::PayloadFieldPresent(field) => {
                if response.payload.get(field).is_none() {
                    return Err(format!("acceptance failed: payload field '{field}' absent"));
                }
            }
        }
    }
    Ok(())
}

fn deterministic_token(request: &ServiceRequest, salt: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(request.text.as_bytes());
    hasher.update(salt.as_bytes());
    for (key, value) in &request.params {
        hasher.update(key.as_bytes());
        hasher.update(value.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn advisor_contract(
    inputs: Vec<ParamSpec>,
    outputs: Vec<ArtifactKind>,
    acceptance: Vec<AcceptanceCheck>,
) -> ServiceContract {
    ServiceContract {
        inputs,
        decision_gates: Vec::new(),
        execution_mode: ExecutionMode::Advisor,
        side_effects: Vec::new(),
        fallback: None,
        outputs,
        acceptance,
    }
}

/// The builtin capability pack mirroring the single-operator catalog. Leaf
/// handlers are deterministic: artifact bytes derive from the request text,
/// so repeat invocations produce identical evidence.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn builtin_services() -> Vec<ServiceDescriptor> {
    let mut services = Vec::new();

    let ppt_handler: ServiceHandler = Arc::new(|request| {
        let token = deterministic_token(request, "mckinsey-ppt.v1");
        let framework = json!({
            "title": request.text,
            "sections": ["现状", "诊断", "方案", "路线图"],
            "token": token,
        });
        let md = format!(
            "# {}\n\n- 现状\n- 诊断\n- 方案\n- 路线图\n",
            request.text.trim()
        );
        let html = format!(
            "<html><body><h1>{}</h1><ol><li>现状</li><li>诊断</li><li>方案</li><li>路线图</li></ol></body></html>",
            request.text.trim()
        );
        Ok(ServiceResponse {
            payload: json!({"framework": framework, "summary": "slide framework generated"}),
            artifacts: vec![
                ArtifactOutput {
                    bytes: serde_json::to_vec_pretty(&framework)?,
                    kind: ArtifactKind::Json,
                    advisory: false,
                },
                ArtifactOutput {
                    bytes: md.into_bytes(),
                    kind: ArtifactKind::Md,
                    advisory: false,
                },
                ArtifactOutput {
                    bytes: html.into_bytes(),
                    kind: ArtifactKind::Html,
                    advisory: false,
                },
            ],
        })
    });
    services.push(ServiceDescriptor {
        name: "mckinsey-ppt".to_string(),
        version: "1.0.0".to_string(),
        description: "Structured slide framework generator".to_string(),
        layer: "core-generalist".to_string(),
        maturity: Maturity::Stable,
        risk_level: RiskLevel::Low,
        task_kinds: vec![TaskKind::Presentation],
        keywords: vec![
            "ppt".to_string(),
            "slide".to_string(),
            "deck".to_string(),
            "汇报".to_string(),
            "演示".to_string(),
            "复盘".to_string(),
            "框架".to_string(),
        ],
        contract: advisor_contract(
            vec![ParamSpec {
                name: "audience".to_string(),
                required: false,
                description: "Intended audience for the deck".to_string(),
                allowed_values: Vec::new(),
                default: Some(json!("management")),
                high_value: true,
            }],
            vec![ArtifactKind::Json, ArtifactKind::Md, ArtifactKind::Html],
            vec![
                AcceptanceCheck::ArtifactsNonEmpty,
                AcceptanceCheck::ArtifactKindPresent(ArtifactKind::Json),
            ],
        ),
        handler: ppt_handler,
    });

    let research_handler: ServiceHandler = Arc::new(|request| {
        let token = deterministic_token(request, "research-hub.v1");
        let report = format!(
            "# Research notes\n\n topic: {}\n\n- evidence ledger pending\n- token: {}\n",
            request.text.trim(),
            &token[..16]
        );
        Ok(ServiceResponse {
            payload: json!({"summary": "evidence-led outline generated", "token": token}),
            artifacts: vec![ArtifactOutput {
                bytes: report.into_bytes(),
                kind: ArtifactKind::Md,
                advisory: false,
            }],
        })
    });
    services.push(ServiceDescriptor {
        name: "research-hub".to_string(),
        version: "1.0.0".to_string(),
        description: "Evidence-led research outline builder".to_string(),
        layer: "analysis".to_string(),
        maturity: Maturity::Stable,
        risk_level: RiskLevel::Low,
        task_kinds: vec![TaskKind::Research],
        keywords: vec![
            "research".to_string(),
            "研报".to_string(),
            "研究报告".to_string(),
            "文献".to_string(),
            "systematic review".to_string(),
            "prisma".to_string(),
            "市场规模".to_string(),
        ],
        contract: advisor_contract(
            vec![ParamSpec {
                name: "scope".to_string(),
                required: false,
                description: "Research scope boundary".to_string(),
                allowed_values: Vec::new(),
                default: Some(json!("broad")),
                high_value: true,
            }],
            vec![ArtifactKind::Md],
            vec![AcceptanceCheck::ArtifactKindPresent(ArtifactKind::Md)],
        ),
        handler: research_handler,
    });

    let data_handler: ServiceHandler = Arc::new(|request| {
        let token = deterministic_token(request, "data-query.v1");
        let table = json!({
            "query": request.params.get("query").cloned().unwrap_or(Value::Null),
            "rows": [],
            "token": token,
        });
        Ok(ServiceResponse {
            payload: json!({"summary": "query plan prepared", "rowcount": 0}),
            artifacts: vec![ArtifactOutput {
                bytes: serde_json::to_vec_pretty(&table)?,
                kind: ArtifactKind::Json,
                advisory: false,
            }],
        })
    });
    services.push(ServiceDescriptor {
        name: "data-query".to_string(),
        version: "1.0.0".to_string(),
        description: "Read-only structured data query".to_string(),
        layer: "analysis".to_string(),
        maturity: Maturity::Beta,
        risk_level: RiskLevel::Medium,
        task_kinds: vec![TaskKind::DataQuery],
        keywords: vec![
            "sql".to_string(),
            "表格".to_string(),
            "excel".to_string(),
            "数据".to_string(),
            "query".to_string(),
        ],
        contract: ServiceContract {
            inputs: vec![ParamSpec {
                name: "query".to_string(),
                required: true,
                description: "Read-only query text".to_string(),
                allowed_values: Vec::new(),
                default: None,
                high_value: true,
            }],
            decision_gates: vec![DecisionGate {
                name: "reject_mutation".to_string(),
                action: GateAction::Reject,
                predicate: GatePredicate {
                    param: "query".to_string(),
                    op: PredicateOp::Contains,
                    value: Some(json!("drop ")),
                },
            }],
            execution_mode: ExecutionMode::Advisor,
            side_effects: Vec::new(),
            fallback: Some("mcp-generalist".to_string()),
            outputs: vec![ArtifactKind::Json],
            acceptance: vec![AcceptanceCheck::ArtifactKindPresent(ArtifactKind::Json)],
        },
        handler: data_handler,
    });

    let image_handler: ServiceHandler = Arc::new(|request| {
        let token = deterministic_token(request, "image-creator.v1");
        Ok(ServiceResponse {
            payload: json!({"summary": "prompt packet prepared", "token": token}),
            artifacts: vec![ArtifactOutput {
                bytes: token.into_bytes(),
                kind: ArtifactKind::Binary,
                advisory: false,
            }],
        })
    });
    services.push(ServiceDescriptor {
        name: "image-creator".to_string(),
        version: "0.3.0".to_string(),
        description: "Creative asset prompt packet builder".to_string(),
        layer: "creative".to_string(),
        maturity: Maturity::Experimental,
        risk_level: RiskLevel::Medium,
        task_kinds: vec![TaskKind::Image],
        keywords: vec![
            "图像".to_string(),
            "图片".to_string(),
            "海报".to_string(),
            "image".to_string(),
            "poster".to_string(),
        ],
        contract: advisor_contract(
            Vec::new(),
            vec![ArtifactKind::Binary],
            vec![AcceptanceCheck::ArtifactsNonEmpty],
        ),
        handler: image_handler,
    });

    let digest_handler: ServiceHandler = Arc::new(|request| {
        let token = deterministic_token(request, "daily-digest.v1");
        let digest = format!(
            "# Daily digest\n\nrequested: {}\n\n(partial: sources pending)\ntoken: {}\n",
            request.text.trim(),
            &token[..12]
        );
        Ok(ServiceResponse {
            payload: json!({"summary": "digest assembled from cached sources"}),
            artifacts: vec![ArtifactOutput {
                bytes: digest.into_bytes(),
                kind: ArtifactKind::Md,
                advisory: true,
            }],
        })
    });
    services.push(ServiceDescriptor {
        name: "daily-digest".to_string(),
        version: "1.1.0".to_string(),
        description: "Scheduled digest assembly over collected sources".to_string(),
        layer: "automation".to_string(),
        maturity: Maturity::Beta,
        risk_level: RiskLevel::Low,
        task_kinds: vec![TaskKind::Automation, TaskKind::Other],
        keywords: vec![
            "digest".to_string(),
            "摘要".to_string(),
            "采集".to_string(),
            "日报".to_string(),
        ],
        contract: advisor_contract(
            Vec::new(),
            vec![ArtifactKind::Md],
            vec![AcceptanceCheck::ArtifactsNonEmpty],
        ),
        handler: digest_handler,
    });

    let publish_handler: ServiceHandler = Arc::new(|request| {
        let token = deterministic_token(request, "report-publisher.v1");
        Ok(ServiceResponse {
            payload: json!({"summary": "report staged for publication", "token": token}),
            artifacts: vec![ArtifactOutput {
                bytes: format!("<html><body><p>{}</p></body></html>", request.text)
                    .into_bytes(),
                kind: ArtifactKind::Html,
                advisory: false,
            }],
        })
    });
    services.push(ServiceDescriptor {
        name: "report-publisher".to_string(),
        version: "0.9.0".to_string(),
        description: "Publishes a rendered report to the operator channel".to_string(),
        layer: "automation".to_string(),
        maturity: Maturity::Beta,
        risk_level: RiskLevel::High,
        task_kinds: vec![TaskKind::Automation],
        keywords: vec![
            "publish".to_string(),
            "发布".to_string(),
            "推送".to_string(),
        ],
        contract: ServiceContract {
            inputs: Vec::new(),
            decision_gates: Vec::new(),
            execution_mode: ExecutionMode::Operator,
            side_effects: vec!["publish".to_string()],
            fallback: None,
            outputs: vec![ArtifactKind::Html],
            acceptance: vec![AcceptanceCheck::ArtifactsNonEmpty],
        },
        handler: publish_handler,
    });

    services
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn request_with(params: &[(&str, Value)]) -> ServiceRequest {
        ServiceRequest {
            run_id: RunId::new(),
            strategy_id: "test".to_string(),
            text: "生成本季度增长复盘框架".to_string(),
            params: params
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            deadline_ms: 60_000,
            dry_run: false,
        }
    }

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new(true);
        for descriptor in builtin_services() {
            must_ok(registry.register(descriptor));
        }
        // mcp-generalist is wired by the engine; tolerate its dangling fallback here.
        registry
    }

    #[test]
    fn builtin_pack_passes_strict_lint() {
        let registry = registry();
        assert!(registry.list().len() >= 5);
    }

    #[test]
    fn lint_rejects_contract_without_acceptance() {
        let mut bad = builtin_services().remove(0);
        bad.name = "broken".to_string();
        bad.contract.acceptance.clear();
        let mut registry = ServiceRegistry::new(true);
        assert!(matches!(
            registry.register(bad),
            Err(RegistryError::Lint { .. })
        ));
    }

    #[test]
    fn missing_required_input_skips_instead_of_failing() {
        let registry = registry();
        let result = must_ok(registry.call("data-query", &request_with(&[])));
        match result {
            ServiceResult::Skipped { error_kind, reason } => {
                assert_eq!(error_kind, ErrorKind::MissingInput);
                assert!(reason.contains("query"));
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn reject_gate_skips_with_governance_kind() {
        let registry = registry();
        let result = must_ok(registry.call(
            "data-query",
            &request_with(&[("query", Value::String("drop table runs".to_string()))]),
        ));
        match result {
            ServiceResult::Skipped { error_kind, .. } => {
                assert_eq!(error_kind, ErrorKind::GovernanceBlock);
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn ppt_service_emits_json_md_html() {
        let registry = registry();
        let result = must_ok(registry.call("mckinsey-ppt", &request_with(&[])));
        match result {
            ServiceResult::Completed(response) => {
                let kinds: Vec<ArtifactKind> =
                    response.artifacts.iter().map(|a| a.kind).collect();
                assert_eq!(
                    kinds,
                    vec![ArtifactKind::Json, ArtifactKind::Md, ArtifactKind::Html]
                );
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn handlers_are_deterministic_per_request() {
        let registry = registry();
        let request = request_with(&[]);
        let first = must_ok(registry.call("research-hub", &request));
        let second = must_ok(registry.call("research-hub", &request));
        assert_eq!(first, second);
    }

    #[test]
    fn acceptance_violation_surfaces_partial_response() {
        let mut registry = ServiceRegistry::new(true);
        let handler: ServiceHandler = Arc::new(|_| {
            Ok(ServiceResponse {
                payload: json!({"summary": "incomplete"}),
                artifacts: Vec::new(),
            })
        });
        must_ok(registry.register(ServiceDescriptor {
            name: "hollow".to_string(),
            version: "1.0.0".to_string(),
            description: "never produces artifacts".to_string(),
            layer: "core-generalist".to_string(),
            maturity: Maturity::Stable,
            risk_level: RiskLevel::Low,
            task_kinds: vec![TaskKind::Other],
            keywords: Vec::new(),
            contract: advisor_contract(
                Vec::new(),
                vec![ArtifactKind::Md],
                vec![AcceptanceCheck::ArtifactsNonEmpty],
            ),
            handler,
        }));
        let result = must_ok(registry.call("hollow", &request_with(&[])));
        match result {
            ServiceResult::Partial { violation, .. } => {
                assert!(violation.contains("no artifacts"));
            }
            other => panic!("expected partial result, got {other:?}"),
        }
    }

    #[test]
    fn escalate_gate_sets_flag_without_veto() {
        let contract = ServiceContract {
            inputs: vec![ParamSpec {
                name: "target".to_string(),
                required: false,
                description: String::new(),
                allowed_values: Vec::new(),
                default: None,
                high_value: false,
            }],
            decision_gates: vec![DecisionGate {
                name: "external_target".to_string(),
                action: GateAction::Escalate,
                predicate: GatePredicate {
                    param: "target".to_string(),
                    op: PredicateOp::Present,
                    value: None,
                },
            }],
            execution_mode: ExecutionMode::Operator,
            side_effects: vec!["publish".to_string()],
            fallback: None,
            outputs: vec![ArtifactKind::Md],
            acceptance: vec![AcceptanceCheck::ArtifactsNonEmpty],
        };
        let mut params = BTreeMap::new();
        params.insert("target".to_string(), json!("prod"));
        let evaluation = evaluate_gates(&contract, &params);
        assert!(evaluation.eligible);
        assert!(evaluation.needs_escalation);
    }
}

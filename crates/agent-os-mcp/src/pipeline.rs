//! Declarative multi-step pipelines. A pipeline file (JSON, TOML, or YAML)
//! drives sequential tool calls; `on_error` controls whether a step failure
//! aborts the remainder.

use std::fs;
use std::path::Path;

use agent_os_domain::RunId;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::runtime::McpRuntime;
use crate::{McpError, McpErrorCode};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOnError {
    #[default]
    Abort,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineStep {
    #[serde(default)]
    pub id: Option<String>,
    /// Direct `server/tool` binding; when absent, `text` is routed.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub on_error: StepOnError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<PipelineStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineOutcome {
    pub ok: bool,
    pub pipeline_id: RunId,
    pub name: String,
    pub steps: Vec<Value>,
    pub aborted_at: Option<usize>,
}

/// Load and validate a pipeline file; the serialization is chosen by
/// extension (`.json`, `.toml`, `.yaml`/`.yml`).
///
/// # Errors
/// Returns a `CONFIG` error for unreadable, unparsable, or empty pipelines.
pub fn load_pipeline_spec(path: &Path) -> Result<PipelineSpec, McpError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        McpError::new(
            McpErrorCode::Config,
            format!("pipeline file not readable {}: {err}", path.display()),
        )
    })?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_lowercase();
    let spec: PipelineSpec = match extension.as_str() {
        "json" => serde_json::from_str(&raw).map_err(|err| {
            McpError::new(McpErrorCode::Config, format!("invalid JSON pipeline: {err}"))
        })?,
        "toml" => toml::from_str(&raw).map_err(|err| {
            McpError::new(McpErrorCode::Config, format!("invalid TOML pipeline: {err}"))
        })?,
        "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(|err| {
            McpError::new(McpErrorCode::Config, format!("invalid YAML pipeline: {err}"))
        })?,
        other => {
            return Err(McpError::new(
                McpErrorCode::Config,
                format!("pipeline supports .json/.toml/.yaml/.yml, got .{other}"),
            ));
        }
    };
    if spec.steps.is_empty() {
        return Err(McpError::new(
            McpErrorCode::Config,
            "pipeline steps MUST be a non-empty list",
        ));
    }
    for (index, step) in spec.steps.iter().enumerate() {
        if step.service.is_none() && step.text.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(McpError::new(
                McpErrorCode::Config,
                format!("step #{} needs either service or text", index + 1),
            ));
        }
        if let Some(binding) = &step.service {
            if binding.split('/').count() != 2 {
                return Err(McpError::new(
                    McpErrorCode::Config,
                    format!("step #{} service must be 'server/tool'", index + 1),
                ));
            }
        }
    }
    Ok(spec)
}

/// Run every step sequentially. Direct bindings call the named tool; routed
/// steps go through the full retry/fallback chain.
///
/// # Errors
/// Propagates store failures from the runtime.
pub fn run_pipeline(
    runtime: &McpRuntime,
    spec: &PipelineSpec,
    dry_run: bool,
) -> Result<PipelineOutcome> {
    let pipeline_id = RunId::new();
    let mut steps = Vec::new();
    let mut all_ok = true;
    let mut aborted_at = None;

    for (index, step) in spec.steps.iter().enumerate() {
        let step_label = step
            .id
            .clone()
            .unwrap_or_else(|| format!("step_{}", index + 1));
        let (ok, detail) = if let Some(binding) = &step.service {
            let mut parts = binding.splitn(2, '/');
            let server = parts.next().unwrap_or_default();
            let tool = parts.next().unwrap_or_default();
            if dry_run {
                (
                    true,
                    json!({"mode": "dry-run", "server": server, "tool": tool, "params": step.params}),
                )
            } else {
                match runtime.call(
                    pipeline_id,
                    u32::try_from(index + 1).unwrap_or(u32::MAX),
                    server,
                    tool,
                    &step.params,
                ) {
                    Ok(result) => (true, json!({"result": result})),
                    Err(err) => (false, json!({"error": err.to_string()})),
                }
            }
        } else {
            let text = step.text.clone().unwrap_or_default();
            let outcome = runtime.run(pipeline_id, &text, &step.params, dry_run, None)?;
            let ok = outcome.ok;
            (
                ok,
                json!({
                    "selected": outcome.selected,
                    "error": outcome.error,
                    "attempts": outcome.attempts.len(),
                }),
            )
        };
        steps.push(json!({
            "index": index + 1,
            "id": step_label,
            "ok": ok,
            "detail": detail,
        }));
        if !ok {
            all_ok = false;
            if step.on_error == StepOnError::Abort {
                aborted_at = Some(index + 1);
                break;
            }
        }
    }

    Ok(PipelineOutcome {
        ok: all_ok,
        pipeline_id,
        name: spec.name.clone().unwrap_or_else(|| "pipeline".to_string()),
        steps,
        aborted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_os_config::{BreakerSettings, McpSettings};
    use agent_os_state_core::StateStore;
    use agent_os_state_sqlite::SqliteStateStore;
    use std::sync::Arc;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn runtime(dir: &tempfile::TempDir) -> McpRuntime {
        let store = must_ok(SqliteStateStore::open(dir.path()));
        must_ok(store.migrate());
        let mut settings = McpSettings::default();
        settings.backoff_base_ms = 1;
        McpRuntime::new(
            crate::registry::ToolRegistry::builtin(),
            crate::router::Router::builtin(),
            Arc::new(store),
            settings,
            BreakerSettings::default(),
            dir.path().to_path_buf(),
        )
    }

    #[test]
    fn loads_yaml_and_rejects_empty_steps() {
        let dir = must_ok(tempfile::tempdir());
        let good = dir.path().join("pipe.yaml");
        must_ok(fs::write(
            &good,
            "name: demo\nsteps:\n  - text: think about it\n    on_error: continue\n",
        ));
        let spec = must_ok(load_pipeline_spec(&good));
        assert_eq!(spec.steps.len(), 1);
        assert_eq!(spec.steps[0].on_error, StepOnError::Continue);

        let empty = dir.path().join("empty.json");
        must_ok(fs::write(&empty, r#"{"name": "x", "steps": []}"#));
        assert!(load_pipeline_spec(&empty).is_err());
    }

    #[test]
    fn rejects_malformed_service_binding() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("pipe.json");
        must_ok(fs::write(
            &path,
            r#"{"steps": [{"service": "no-slash", "params": {}}]}"#,
        ));
        assert!(load_pipeline_spec(&path).is_err());
    }

    #[test]
    fn abort_stops_at_failed_step_continue_does_not() {
        let dir = must_ok(tempfile::tempdir());
        let runtime = runtime(&dir);
        let mut bad_params = Map::new();
        bad_params.insert("problem".to_string(), json!("q"));
        let spec = PipelineSpec {
            name: Some("demo".to_string()),
            steps: vec![
                PipelineStep {
                    id: Some("broken".to_string()),
                    service: Some("sequential-thinking/unknown-tool".to_string()),
                    text: None,
                    params: bad_params.clone(),
                    on_error: StepOnError::Continue,
                },
                PipelineStep {
                    id: Some("thinks".to_string()),
                    service: Some("sequential-thinking/think".to_string()),
                    text: None,
                    params: bad_params.clone(),
                    on_error: StepOnError::Abort,
                },
            ],
        };
        let outcome = must_ok(run_pipeline(&runtime, &spec, false));
        assert!(!outcome.ok);
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.aborted_at.is_none());

        let abort_spec = PipelineSpec {
            name: None,
            steps: vec![
                PipelineStep {
                    id: None,
                    service: Some("sequential-thinking/unknown-tool".to_string()),
                    text: None,
                    params: bad_params.clone(),
                    on_error: StepOnError::Abort,
                },
                PipelineStep {
                    id: None,
                    service: Some("sequential-thinking/think".to_string()),
                    text: None,
                    params: bad_params,
                    on_error: StepOnError::Abort,
                },
            ],
        };
        let outcome = must_ok(run_pipeline(&runtime, &abort_spec, false));
        assert_eq!(outcome.aborted_at, Some(1));
        assert_eq!(outcome.steps.len(), 1);
    }

    #[test]
    fn dry_run_pipeline_previews_all_steps() {
        let dir = must_ok(tempfile::tempdir());
        let runtime = runtime(&dir);
        let spec = PipelineSpec {
            name: Some("preview".to_string()),
            steps: vec![PipelineStep {
                id: None,
                service: Some("fetch/get".to_string()),
                text: None,
                params: Map::new(),
                on_error: StepOnError::Abort,
            }],
        };
        let outcome = must_ok(run_pipeline(&runtime, &spec, true));
        assert!(outcome.ok);
        assert_eq!(outcome.steps.len(), 1);
    }
}

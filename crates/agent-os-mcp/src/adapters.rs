//! Local tool adapters with a policy engine: path allow-list for filesystem
//! access, domain whitelist for fetch, read-only lint for SQL. These are the
//! in-process implementations behind the tool invocation contract.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::registry::ServerConfig;
use crate::{McpError, McpErrorCode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

pub trait ToolAdapter: Send + Sync {
    fn list_tools(&self) -> Vec<ToolInfo>;

    /// Execute one tool with already-validated parameters.
    ///
    /// # Errors
    /// Returns a typed [`McpError`]; transient codes are retried upstream.
    fn call_tool(&self, tool: &str, params: &Map<String, Value>) -> Result<Value, McpError>;
}

/// Shared safety rules for local adapters.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    allowed_paths: Vec<PathBuf>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(allowed_paths: Vec<PathBuf>) -> Self {
        Self { allowed_paths }
    }

    /// # Errors
    /// Returns `POLICY_FORBIDDEN` for paths outside the allow-list.
    pub fn validate_path(&self, raw: &str) -> Result<PathBuf, McpError> {
        let path = PathBuf::from(raw);
        let resolved = if path.is_absolute() {
            path
        } else {
            self.allowed_paths
                .first()
                .map(|base| base.join(&path))
                .unwrap_or(path)
        };
        let normalized = resolved
            .canonicalize()
            .unwrap_or_else(|_| resolved.clone());
        for base in &self.allowed_paths {
            let base = base.canonicalize().unwrap_or_else(|_| base.clone());
            if normalized.starts_with(&base) {
                return Ok(normalized);
            }
        }
        Err(McpError::new(
            McpErrorCode::PolicyForbidden,
            format!("path not allowed by policy: {}", normalized.display()),
        ))
    }

    /// # Errors
    /// Returns `POLICY_FORBIDDEN` unless the statement is read-only.
    pub fn validate_sql(&self, sql: &str) -> Result<(), McpError> {
        let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        if normalized.is_empty() {
            return Err(McpError::new(McpErrorCode::InvalidArgs, "SQL is empty"));
        }
        if !["select", "with", "pragma"]
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
        {
            return Err(McpError::new(
                McpErrorCode::PolicyForbidden,
                "only read-only SQL is allowed",
            ));
        }
        for token in ["insert ", "update ", "delete ", "drop ", "alter ", "attach ", "vacuum"] {
            if normalized.contains(token) {
                return Err(McpError::new(
                    McpErrorCode::PolicyForbidden,
                    "read-only SQL policy violation",
                ));
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns `POLICY_FORBIDDEN` for non-http(s) schemes or hosts outside
    /// a non-empty whitelist.
    pub fn validate_url(&self, url: &str, whitelist: &[String]) -> Result<(), McpError> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| {
                McpError::new(McpErrorCode::PolicyForbidden, "only http/https are allowed")
            })?;
        if whitelist.is_empty() {
            return Ok(());
        }
        let host = rest
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default()
            .split('@')
            .last()
            .unwrap_or_default()
            .split(':')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        for allowed in whitelist {
            let allowed = allowed.to_lowercase();
            if host == allowed || host.ends_with(&format!(".{allowed}")) {
                return Ok(());
            }
        }
        Err(McpError::new(
            McpErrorCode::PolicyForbidden,
            format!("domain not in whitelist: {host}"),
        ))
    }
}

fn require_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, McpError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| McpError::new(McpErrorCode::InvalidArgs, format!("{key} is required")))
}

pub struct FilesystemAdapter {
    policy: PolicyEngine,
}

impl FilesystemAdapter {
    #[must_use]
    pub fn new(policy: PolicyEngine) -> Self {
        Self { policy }
    }
}

impl ToolAdapter for FilesystemAdapter {
    fn list_tools(&self) -> Vec<ToolInfo> {
        vec![
            ToolInfo {
                name: "read_file".to_string(),
                description: "Read a UTF-8 text file".to_string(),
            },
            ToolInfo {
                name: "list_dir".to_string(),
                description: "List directory entries".to_string(),
            },
            ToolInfo {
                name: "exists".to_string(),
                description: "Check file existence".to_string(),
            },
        ]
    }

    fn call_tool(&self, tool: &str, params: &Map<String, Value>) -> Result<Value, McpError> {
        match tool {
            "read_file" => {
                let path = self.policy.validate_path(require_str(params, "path")?)?;
                let max_bytes = params
                    .get("max_bytes")
                    .and_then(Value::as_u64)
                    .unwrap_or(200_000) as usize;
                let bytes = std::fs::read(&path).map_err(|err| {
                    McpError::new(McpErrorCode::NotFound, format!("read failed: {err}"))
                })?;
                let truncated = bytes.len() > max_bytes;
                let body = String::from_utf8_lossy(&bytes[..bytes.len().min(max_bytes)]).to_string();
                Ok(json!({"path": path.display().to_string(), "content": body, "truncated": truncated}))
            }
            "list_dir" => {
                let path = self.policy.validate_path(require_str(params, "path")?)?;
                let max_entries = params
                    .get("max_entries")
                    .and_then(Value::as_u64)
                    .unwrap_or(200) as usize;
                if !path.is_dir() {
                    return Err(McpError::new(
                        McpErrorCode::InvalidArgs,
                        format!("not a directory: {}", path.display()),
                    ));
                }
                let mut entries = Vec::new();
                let reader = std::fs::read_dir(&path).map_err(|err| {
                    McpError::new(McpErrorCode::NotFound, format!("list failed: {err}"))
                })?;
                for entry in reader {
                    if entries.len() >= max_entries {
                        break;
                    }
                    let Ok(entry) = entry else { continue };
                    let entry_path = entry.path();
                    entries.push(json!({
                        "path": entry_path.display().to_string(),
                        "type": if entry_path.is_dir() { "dir" } else { "file" },
                    }));
                }
                let truncated = entries.len() >= max_entries;
                Ok(json!({"path": path.display().to_string(), "entries": entries, "truncated": truncated}))
            }
            "exists" => {
                let path = self.policy.validate_path(require_str(params, "path")?)?;
                Ok(json!({
                    "path": path.display().to_string(),
                    "exists": path.exists(),
                    "is_dir": path.is_dir(),
                }))
            }
            other => Err(McpError::new(
                McpErrorCode::NotFound,
                format!("filesystem tool not found: {other}"),
            )),
        }
    }
}

pub struct FetchAdapter {
    policy: PolicyEngine,
    server: ServerConfig,
    timeout_ms: u64,
}

impl FetchAdapter {
    #[must_use]
    pub fn new(policy: PolicyEngine, server: ServerConfig, timeout_ms: u64) -> Self {
        Self {
            policy,
            server,
            timeout_ms,
        }
    }
}

impl ToolAdapter for FetchAdapter {
    fn list_tools(&self) -> Vec<ToolInfo> {
        vec![ToolInfo {
            name: "get".to_string(),
            description: "HTTP GET with domain whitelist".to_string(),
        }]
    }

    fn call_tool(&self, tool: &str, params: &Map<String, Value>) -> Result<Value, McpError> {
        if tool != "get" {
            return Err(McpError::new(
                McpErrorCode::NotFound,
                format!("fetch tool not found: {tool}"),
            ));
        }
        let url = require_str(params, "url")?;
        self.policy.validate_url(url, &self.server.domain_whitelist)?;
        let max_bytes = params
            .get("max_bytes")
            .and_then(Value::as_u64)
            .unwrap_or(300_000) as usize;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();
        match agent.get(url).call() {
            Ok(response) => {
                let status = response.status();
                let content_type = response.content_type().to_string();
                let mut body = response.into_string().map_err(|err| {
                    McpError::new(McpErrorCode::Connection, format!("body read failed: {err}"))
                })?;
                let truncated = body.len() > max_bytes;
                body.truncate(max_bytes);
                Ok(json!({
                    "url": url,
                    "status": status,
                    "content_type": content_type,
                    "body": body,
                    "truncated": truncated,
                }))
            }
            Err(ureq::Error::Status(code, _)) if code >= 500 => Err(McpError::new(
                McpErrorCode::ServerStatus,
                format!("upstream status {code}"),
            )),
            Err(ureq::Error::Status(code, _)) => Err(McpError::new(
                McpErrorCode::InvalidArgs,
                format!("upstream status {code}"),
            )),
            Err(ureq::Error::Transport(err)) => {
                let message = err.to_string();
                if message.to_lowercase().contains("timed out") {
                    Err(McpError::new(McpErrorCode::Timeout, message))
                } else {
                    Err(McpError::new(McpErrorCode::Connection, message))
                }
            }
        }
    }
}

pub struct SqliteAdapter {
    policy: PolicyEngine,
    db_path: PathBuf,
}

impl SqliteAdapter {
    /// # Errors
    /// Returns `CONFIG` when the server declares no database path.
    pub fn new(policy: PolicyEngine, server: &ServerConfig) -> Result<Self, McpError> {
        let raw = server.db_path.as_deref().ok_or_else(|| {
            McpError::new(McpErrorCode::Config, "sqlite server missing db_path")
        })?;
        let db_path = policy.validate_path(raw)?;
        Ok(Self { policy, db_path })
    }
}

impl ToolAdapter for SqliteAdapter {
    fn list_tools(&self) -> Vec<ToolInfo> {
        vec![ToolInfo {
            name: "query".to_string(),
            description: "Read-only SQL query".to_string(),
        }]
    }

    fn call_tool(&self, tool: &str, params: &Map<String, Value>) -> Result<Value, McpError> {
        if tool != "query" {
            return Err(McpError::new(
                McpErrorCode::NotFound,
                format!("sqlite tool not found: {tool}"),
            ));
        }
        let sql = require_str(params, "sql")?;
        self.policy.validate_sql(sql)?;
        let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(200) as usize;
        let conn = rusqlite::Connection::open(&self.db_path).map_err(|err| {
            McpError::new(McpErrorCode::Connection, format!("open failed: {err}"))
        })?;
        let mut stmt = conn.prepare(sql).map_err(|err| {
            McpError::new(McpErrorCode::InvalidArgs, format!("prepare failed: {err}"))
        })?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| (*s).to_string()).collect();
        let mut rows = stmt.query([]).map_err(|err| {
            McpError::new(McpErrorCode::InvalidArgs, format!("query failed: {err}"))
        })?;
        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next() {
            if items.len() >= limit {
                break;
            }
            let mut object = Map::new();
            for (index, name) in column_names.iter().enumerate() {
                let value: Value = match row.get_ref(index) {
                    Ok(rusqlite::types::ValueRef::Null) => Value::Null,
                    Ok(rusqlite::types::ValueRef::Integer(v)) => json!(v),
                    Ok(rusqlite::types::ValueRef::Real(v)) => json!(v),
                    Ok(rusqlite::types::ValueRef::Text(v)) => {
                        json!(String::from_utf8_lossy(v).to_string())
                    }
                    Ok(rusqlite::types::ValueRef::Blob(v)) => json!(format!("<{} bytes>", v.len())),
                    Err(_) => Value::Null,
                };
                object.insert(name.clone(), value);
            }
            items.push(Value::Object(object));
        }
        Ok(json!({
            "db": self.db_path.display().to_string(),
            "count": items.len(),
            "items": items,
            "limit": limit,
        }))
    }
}

/// Pure local reasoning fallback; always available, never fails transiently.
pub struct ThinkAdapter;

impl ToolAdapter for ThinkAdapter {
    fn list_tools(&self) -> Vec<ToolInfo> {
        vec![ToolInfo {
            name: "think".to_string(),
            description: "Split a problem into actionable steps".to_string(),
        }]
    }

    fn call_tool(&self, tool: &str, params: &Map<String, Value>) -> Result<Value, McpError> {
        if tool != "think" {
            return Err(McpError::new(
                McpErrorCode::NotFound,
                format!("sequential-thinking tool not found: {tool}"),
            ));
        }
        let problem = require_str(params, "problem")?;
        let normalized = problem.replace('？', "?");
        let parts: Vec<&str> = normalized
            .split('?')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();
        let steps: Vec<String> = if parts.is_empty() {
            vec![
                "1. Define the goal and constraints".to_string(),
                "2. Collect data and evidence".to_string(),
                "3. Draft options and weigh risk".to_string(),
                "4. Produce the execution checklist".to_string(),
            ]
        } else {
            parts
                .iter()
                .enumerate()
                .map(|(index, part)| format!("{}. Clarify sub-problem: {part}", index + 1))
                .collect()
        };
        Ok(json!({"problem": problem, "steps": steps}))
    }
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

    #[test]
    fn sql_lint_permits_reads_and_rejects_writes() {
        let policy = PolicyEngine::new(Vec::new());
        assert!(policy.validate_sql("SELECT name FROM sqlite_master").is_ok());
        assert!(policy.validate_sql("with t as (select 1) select * from t").is_ok());
        assert!(policy.validate_sql("DROP TABLE runs").is_err());
        assert!(policy.validate_sql("select 1; delete from runs").is_err());
    }

    #[test]
    fn url_whitelist_matches_host_and_subdomains() {
        let policy = PolicyEngine::new(Vec::new());
        let whitelist = vec!["example.com".to_string()];
        assert!(policy.validate_url("https://example.com/page", &whitelist).is_ok());
        assert!(policy.validate_url("https://api.example.com/x", &whitelist).is_ok());
        assert!(policy.validate_url("https://evil.com/?example.com", &whitelist).is_err());
        assert!(policy.validate_url("ftp://example.com", &whitelist).is_err());
    }

    #[test]
    fn filesystem_adapter_stays_inside_allowed_paths() {
        let dir = must_ok(tempfile::tempdir());
        let inside = dir.path().join("notes.txt");
        must_ok(std::fs::write(&inside, "hello"));
        let adapter = FilesystemAdapter::new(PolicyEngine::new(vec![dir.path().to_path_buf()]));
        let mut params = Map::new();
        params.insert("path".to_string(), json!(inside.display().to_string()));
        let result = must_ok(adapter.call_tool("read_file", &params));
        assert_eq!(result["content"], json!("hello"));

        let mut outside = Map::new();
        outside.insert("path".to_string(), json!("/etc/hosts"));
        let denied = adapter.call_tool("read_file", &outside);
        assert!(matches!(
            denied,
            Err(McpError {
                code: McpErrorCode::PolicyForbidden,
                ..
            })
        ));
    }

    #[test]
    fn think_adapter_builds_steps_from_questions() {
        let adapter = ThinkAdapter;
        let mut params = Map::new();
        params.insert("problem".to_string(), json!("目标是什么？关键约束？"));
        let result = must_ok(adapter.call_tool("think", &params));
        let steps = result["steps"]
            .as_array()
            .unwrap_or_else(|| panic!("steps missing"));
        assert_eq!(steps.len(), 2);
    }
}

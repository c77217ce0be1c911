//! Tool server registry loaded from a JSON config file. `${VAR}` values in a
//! server's env map resolve from the process environment at load time.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{McpError, McpErrorCode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Relative cost weight in [0, 1]; cheaper servers rank higher.
    #[serde(default = "default_cost")]
    pub cost: f64,
    /// Domain whitelist for fetch-style servers; empty admits any host.
    #[serde(default)]
    pub domain_whitelist: Vec<String>,
    /// Database path for sqlite-style servers.
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_cost() -> f64 {
    0.6
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct RegistrySettings {
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct RegistryFile {
    #[serde(default)]
    settings: RegistrySettings,
    #[serde(default)]
    servers: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    timeout_ms: u64,
    servers: BTreeMap<String, ServerConfig>,
}

impl ToolRegistry {
    /// Load the registry; a missing file yields the builtin local pack so a
    /// fresh checkout works with zero configuration.
    ///
    /// # Errors
    /// Returns [`McpError`] with `CONFIG` when the file is unreadable or
    /// structurally invalid.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let raw = fs::read_to_string(path).map_err(|err| {
            McpError::new(
                McpErrorCode::Config,
                format!("cannot read {}: {err}", path.display()),
            )
        })?;
        let mut file: RegistryFile = serde_json::from_str(&raw).map_err(|err| {
            McpError::new(
                McpErrorCode::Config,
                format!("invalid server registry {}: {err}", path.display()),
            )
        })?;
        for server in file.servers.values_mut() {
            for value in server.env.values_mut() {
                *value = resolve_env_value(value);
            }
        }
        Ok(Self {
            timeout_ms: file.settings.timeout_ms,
            servers: file.servers,
        })
    }

    /// The default local tool pack: filesystem, fetch, sqlite, and the pure
    /// sequential-thinking fallback.
    #[must_use]
    pub fn builtin() -> Self {
        let mut servers = BTreeMap::new();
        servers.insert(
            "filesystem".to_string(),
            ServerConfig {
                description: "Read-only local filesystem access".to_string(),
                enabled: true,
                categories: vec!["local".to_string()],
                env: BTreeMap::new(),
                cost: 0.95,
                domain_whitelist: Vec::new(),
                db_path: None,
                endpoint: None,
            },
        );
        servers.insert(
            "fetch".to_string(),
            ServerConfig {
                description: "HTTP GET with domain whitelist".to_string(),
                enabled: true,
                categories: vec!["network".to_string()],
                env: BTreeMap::new(),
                cost: 0.7,
                domain_whitelist: Vec::new(),
                db_path: None,
                endpoint: None,
            },
        );
        servers.insert(
            "sqlite".to_string(),
            ServerConfig {
                description: "Read-only SQL over a local database".to_string(),
                enabled: false,
                categories: vec!["local".to_string()],
                env: BTreeMap::new(),
                cost: 0.75,
                domain_whitelist: Vec::new(),
                db_path: None,
                endpoint: None,
            },
        );
        servers.insert(
            "sequential-thinking".to_string(),
            ServerConfig {
                description: "Split a problem into actionable steps".to_string(),
                enabled: true,
                categories: vec!["local".to_string()],
                env: BTreeMap::new(),
                cost: 0.9,
                domain_whitelist: Vec::new(),
                db_path: None,
                endpoint: None,
            },
        );
        Self {
            timeout_ms: default_timeout_ms(),
            servers,
        }
    }

    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    #[must_use]
    pub fn list_servers(&self, enabled_only: bool) -> Vec<(&str, &ServerConfig)> {
        self.servers
            .iter()
            .filter(|(_, server)| !enabled_only || server.enabled)
            .map(|(name, server)| (name.as_str(), server))
            .collect()
    }

    /// # Errors
    /// Returns `NOT_FOUND` for unknown servers and `CONFIG` for disabled
    /// ones when `require_enabled` is set.
    pub fn get_server(
        &self,
        name: &str,
        require_enabled: bool,
    ) -> Result<&ServerConfig, McpError> {
        let server = self.servers.get(name).ok_or_else(|| {
            McpError::new(McpErrorCode::NotFound, format!("unknown server: {name}"))
        })?;
        if require_enabled && !server.enabled {
            return Err(McpError::new(
                McpErrorCode::Config,
                format!("server is disabled: {name}"),
            ));
        }
        Ok(server)
    }
}

fn resolve_env_value(value: &str) -> String {
    if let Some(name) = value.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        return std::env::var(name).unwrap_or_default();
    }
    value.to_string()
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
    fn builtin_pack_has_enabled_locals() {
        let registry = ToolRegistry::builtin();
        assert!(registry.get_server("filesystem", true).is_ok());
        assert!(registry.get_server("sequential-thinking", true).is_ok());
        assert!(registry.get_server("sqlite", true).is_err());
        assert!(registry.get_server("nope", false).is_err());
    }

    #[test]
    fn env_placeholders_resolve_from_process_env() {
        std::env::set_var("AGENT_OS_TEST_TOKEN", "resolved-token");
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("servers.json");
        must_ok(fs::write(
            &path,
            r#"{"servers": {"fetch": {"enabled": true, "env": {"TOKEN": "${AGENT_OS_TEST_TOKEN}"}}}}"#,
        ));
        let registry = must_ok(ToolRegistry::load(&path));
        std::env::remove_var("AGENT_OS_TEST_TOKEN");
        let server = must_ok(registry.get_server("fetch", true));
        assert_eq!(server.env.get("TOKEN").map(String::as_str), Some("resolved-token"));
    }

    #[test]
    fn missing_registry_file_uses_builtin() {
        let dir = must_ok(tempfile::tempdir());
        let registry = must_ok(ToolRegistry::load(&dir.path().join("absent.json")));
        assert!(!registry.list_servers(true).is_empty());
    }
}

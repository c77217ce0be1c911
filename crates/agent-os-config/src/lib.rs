#![forbid(unsafe_code)]

//! Declarative runtime configuration. One TOML file covers profiles, ranking
//! weights, governance rules, breaker parameters, tuner thresholds, and the
//! worker queue. Environment variables may override data paths and endpoint
//! locations, never risk or approval settings.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use agent_os_domain::{Maturity, Profile, RiskLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),
    #[error("failed to read configuration at {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("failed to parse configuration at {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Environment variable that relocates the persisted-state root. Allowed as
/// an override because it is a path, not a risk setting.
pub const ENV_DATA_DIR: &str = "AGENT_OS_DATA_DIR";
/// Environment variable pointing at the MCP server registry file.
pub const ENV_MCP_SERVERS: &str = "AGENT_OS_MCP_SERVERS";
/// Environment variable pointing at the MCP route rules file.
pub const ENV_MCP_ROUTES: &str = "AGENT_OS_MCP_ROUTES";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default = "default_profile")]
    pub profile: Profile,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_attempt_deadline_ms")]
    pub attempt_deadline_ms: u64,
    /// 0 means "resolve to min(4, cores)" at startup.
    #[serde(default)]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            data_dir: default_data_dir(),
            attempt_deadline_ms: default_attempt_deadline_ms(),
            worker_count: 0,
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProfileSettings {
    pub deterministic: bool,
    pub learning_enabled: bool,
    pub max_fallback_steps: usize,
    pub base_weight: f64,
    pub memory_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RankerSettings {
    #[serde(default = "default_memory_prior")]
    pub memory_prior: f64,
    #[serde(default = "default_min_candidate_score")]
    pub min_candidate_score: f64,
    #[serde(default = "default_ambiguity_gap_threshold")]
    pub ambiguity_gap_threshold: f64,
}

impl Default for RankerSettings {
    fn default() -> Self {
        Self {
            memory_prior: default_memory_prior(),
            min_candidate_score: default_min_candidate_score(),
            ambiguity_gap_threshold: default_ambiguity_gap_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GovernanceProfile {
    /// `"*"` admits every enabled layer.
    pub allowed_layers: Vec<String>,
    pub blocked_maturity: Vec<Maturity>,
    pub max_risk_level: RiskLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GovernanceSettings {
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub require_approval_for_publish: bool,
    #[serde(default = "default_approval_max_age_seconds")]
    pub approval_max_age_seconds: i64,
    #[serde(default)]
    pub profiles: BTreeMap<Profile, GovernanceProfile>,
}

impl Default for GovernanceSettings {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            Profile::Strict,
            GovernanceProfile {
                allowed_layers: vec!["core-generalist".to_string(), "analysis".to_string()],
                blocked_maturity: vec![Maturity::Experimental],
                max_risk_level: RiskLevel::Medium,
            },
        );
        profiles.insert(
            Profile::Adaptive,
            GovernanceProfile {
                allowed_layers: vec!["*".to_string()],
                blocked_maturity: Vec::new(),
                max_risk_level: RiskLevel::High,
            },
        );
        Self {
            sensitive_patterns: default_sensitive_patterns(),
            require_approval_for_publish: true,
            approval_max_age_seconds: default_approval_max_age_seconds(),
            profiles,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: i64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            window_seconds: default_window_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct McpSettings {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
    #[serde(default = "default_chain_budget_ms")]
    pub chain_budget_ms: u64,
    #[serde(default = "default_intent_weight")]
    pub intent_weight: f64,
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    #[serde(default = "default_metrics_days")]
    pub metrics_days: u32,
    #[serde(default = "default_success_prior_weight")]
    pub success_prior_weight: f64,
    #[serde(default = "default_servers_file")]
    pub servers_file: PathBuf,
    #[serde(default = "default_routes_file")]
    pub routes_file: PathBuf,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_pct: default_jitter_pct(),
            chain_budget_ms: default_chain_budget_ms(),
            intent_weight: default_intent_weight(),
            success_weight: default_success_weight(),
            latency_weight: default_latency_weight(),
            cost_weight: default_cost_weight(),
            metrics_days: default_metrics_days(),
            success_prior_weight: default_success_prior_weight(),
            servers_file: default_servers_file(),
            routes_file: default_routes_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TunerSettings {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,
    #[serde(default = "default_demote_windows")]
    pub demote_windows: u32,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,
    #[serde(default = "default_min_priority_score")]
    pub min_priority_score: f64,
    #[serde(default = "default_health_success_weight")]
    pub health_success_weight: f64,
    #[serde(default = "default_health_latency_weight")]
    pub health_latency_weight: f64,
    #[serde(default = "default_health_fallback_weight")]
    pub health_fallback_weight: f64,
    #[serde(default = "default_slo_success_target")]
    pub slo_success_target: f64,
    #[serde(default = "default_slo_p95_target_ms")]
    pub slo_p95_target_ms: u64,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            demote_windows: default_demote_windows(),
            min_samples: default_min_samples(),
            max_actions: default_max_actions(),
            min_priority_score: default_min_priority_score(),
            health_success_weight: default_health_success_weight(),
            health_latency_weight: default_health_latency_weight(),
            health_fallback_weight: default_health_fallback_weight(),
            slo_success_target: default_slo_success_target(),
            slo_p95_target_ms: default_slo_p95_target_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentOsConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default = "default_profiles")]
    pub profiles: BTreeMap<Profile, ProfileSettings>,
    #[serde(default)]
    pub ranker: RankerSettings,
    #[serde(default)]
    pub governance: GovernanceSettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub mcp: McpSettings,
    #[serde(default)]
    pub tuner: TunerSettings,
}

impl AgentOsConfig {
    /// Load configuration from a TOML file. A missing file yields defaults,
    /// matching the single-operator bootstrap flow; a present-but-broken file
    /// is an error.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when reading, parsing, or validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|err| ConfigError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
            toml::from_str(&raw).map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?
        } else {
            Self::bootstrap()
        };
        if config.profiles.is_empty() {
            config.profiles = default_profiles();
        }
        config.validate()?;
        Ok(config)
    }

    /// The built-in configuration used when no file exists yet.
    #[must_use]
    pub fn bootstrap() -> Self {
        Self {
            defaults: Defaults::default(),
            profiles: default_profiles(),
            ranker: RankerSettings::default(),
            governance: GovernanceSettings::default(),
            breaker: BreakerSettings::default(),
            mcp: McpSettings::default(),
            tuner: TunerSettings::default(),
        }
    }

    /// Apply the allowed environment overrides: data dir and MCP file
    /// locations only. Risk and approval settings are deliberately not
    /// overridable from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(ENV_DATA_DIR) {
            if !value.trim().is_empty() {
                self.defaults.data_dir = PathBuf::from(value);
            }
        }
        if let Ok(value) = std::env::var(ENV_MCP_SERVERS) {
            if !value.trim().is_empty() {
                self.mcp.servers_file = PathBuf::from(value);
            }
        }
        if let Ok(value) = std::env::var(ENV_MCP_ROUTES) {
            if !value.trim().is_empty() {
                self.mcp.routes_file = PathBuf::from(value);
            }
        }
    }

    /// Settings for a concrete (non-auto) profile.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for `auto` or an unconfigured profile.
    pub fn profile_settings(&self, profile: Profile) -> Result<&ProfileSettings, ConfigError> {
        if profile == Profile::Auto {
            return Err(ConfigError::Invalid(
                "auto MUST be resolved before profile settings are read".to_string(),
            ));
        }
        self.profiles.get(&profile).ok_or_else(|| {
            ConfigError::Invalid(format!("missing [profiles.{}] section", profile.as_str()))
        })
    }

    /// Governance rules for a concrete profile; a missing section falls back
    /// to the strict rules.
    #[must_use]
    pub fn governance_for(&self, profile: Profile) -> GovernanceProfile {
        if let Some(found) = self.governance.profiles.get(&profile) {
            return found.clone();
        }
        self.governance
            .profiles
            .get(&Profile::Strict)
            .cloned()
            .unwrap_or(GovernanceProfile {
                allowed_layers: vec!["core-generalist".to_string()],
                blocked_maturity: vec![Maturity::Experimental],
                max_risk_level: RiskLevel::Medium,
            })
    }

    /// Worker pool width with the `min(4, cores)` default applied.
    #[must_use]
    pub fn resolved_worker_count(&self) -> usize {
        if self.defaults.worker_count > 0 {
            return self.defaults.worker_count;
        }
        let cores = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        cores.min(4).max(1)
    }

    /// Validates numeric bounds and cross-field invariants.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when a field is out of bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.defaults.attempt_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "attempt_deadline_ms MUST be >= 1".to_string(),
            ));
        }
        if self.defaults.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity MUST be >= 1".to_string(),
            ));
        }
        for (profile, settings) in &self.profiles {
            if *profile == Profile::Auto {
                return Err(ConfigError::Invalid(
                    "[profiles.auto] is not configurable; auto resolves to strict or adaptive"
                        .to_string(),
                ));
            }
            if settings.max_fallback_steps == 0 {
                return Err(ConfigError::Invalid(format!(
                    "profiles.{}.max_fallback_steps MUST be >= 1",
                    profile.as_str()
                )));
            }
            for (name, value) in [
                ("base_weight", settings.base_weight),
                ("memory_weight", settings.memory_weight),
            ] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::Invalid(format!(
                        "profiles.{}.{name} MUST be in [0.0, 1.0]",
                        profile.as_str()
                    )));
                }
            }
        }
        for (name, value) in [
            ("ranker.memory_prior", self.ranker.memory_prior),
            (
                "ranker.ambiguity_gap_threshold",
                self.ranker.ambiguity_gap_threshold,
            ),
            ("mcp.jitter_pct", self.mcp.jitter_pct),
            ("tuner.high_watermark", self.tuner.high_watermark),
            ("tuner.low_watermark", self.tuner.low_watermark),
            ("tuner.slo_success_target", self.tuner.slo_success_target),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }
        if self.tuner.low_watermark > self.tuner.high_watermark {
            return Err(ConfigError::Invalid(
                "tuner.low_watermark MUST be <= tuner.high_watermark".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold MUST be >= 1".to_string(),
            ));
        }
        if self.breaker.cooldown_seconds <= 0 || self.breaker.window_seconds <= 0 {
            return Err(ConfigError::Invalid(
                "breaker cooldown and window MUST be positive".to_string(),
            ));
        }
        if self.mcp.top_k == 0 {
            return Err(ConfigError::Invalid("mcp.top_k MUST be >= 1".to_string()));
        }
        if self.mcp.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "mcp.backoff_factor MUST be >= 1.0".to_string(),
            ));
        }
        if self.tuner.demote_windows == 0 {
            return Err(ConfigError::Invalid(
                "tuner.demote_windows MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_profile() -> Profile {
    Profile::Strict
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_attempt_deadline_ms() -> u64 {
    60_000
}

fn default_queue_capacity() -> usize {
    32
}

fn default_profiles() -> BTreeMap<Profile, ProfileSettings> {
    let mut profiles = BTreeMap::new();
    profiles.insert(
        Profile::Strict,
        ProfileSettings {
            deterministic: true,
            learning_enabled: false,
            max_fallback_steps: 1,
            base_weight: 0.95,
            memory_weight: 0.05,
        },
    );
    profiles.insert(
        Profile::Adaptive,
        ProfileSettings {
            deterministic: false,
            learning_enabled: true,
            max_fallback_steps: 3,
            base_weight: 0.75,
            memory_weight: 0.25,
        },
    );
    profiles
}

fn default_memory_prior() -> f64 {
    0.5
}

fn default_min_candidate_score() -> f64 {
    0.12
}

fn default_ambiguity_gap_threshold() -> f64 {
    0.05
}

fn default_sensitive_patterns() -> Vec<String> {
    vec![
        "sk-".to_string(),
        "AKIA".to_string(),
        "BEGIN PRIVATE KEY".to_string(),
        "password=".to_string(),
        "api_key=".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_approval_max_age_seconds() -> i64 {
    86_400
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_seconds() -> i64 {
    300
}

fn default_window_seconds() -> i64 {
    600
}

fn default_top_k() -> usize {
    3
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter_pct() -> f64 {
    0.2
}

fn default_chain_budget_ms() -> u64 {
    120_000
}

fn default_intent_weight() -> f64 {
    0.45
}

fn default_success_weight() -> f64 {
    0.30
}

fn default_latency_weight() -> f64 {
    0.15
}

fn default_cost_weight() -> f64 {
    0.10
}

fn default_metrics_days() -> u32 {
    14
}

fn default_success_prior_weight() -> f64 {
    20.0
}

fn default_servers_file() -> PathBuf {
    PathBuf::from("config/mcp_servers.json")
}

fn default_routes_file() -> PathBuf {
    PathBuf::from("config/mcp_routes.json")
}

fn default_window_days() -> u32 {
    7
}

fn default_high_watermark() -> f64 {
    0.85
}

fn default_low_watermark() -> f64 {
    0.50
}

fn default_demote_windows() -> u32 {
    3
}

fn default_min_samples() -> usize {
    5
}

fn default_max_actions() -> usize {
    5
}

fn default_min_priority_score() -> f64 {
    0.2
}

fn default_health_success_weight() -> f64 {
    0.6
}

fn default_health_latency_weight() -> f64 {
    0.2
}

fn default_health_fallback_weight() -> f64 {
    0.2
}

fn default_slo_success_target() -> f64 {
    0.9
}

fn default_slo_p95_target_ms() -> u64 {
    8_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn bootstrap_config_validates() {
        let config = AgentOsConfig::bootstrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            must_ok(config.profile_settings(Profile::Strict)).max_fallback_steps,
            1
        );
        assert_eq!(
            must_ok(config.profile_settings(Profile::Adaptive)).max_fallback_steps,
            3
        );
    }

    #[test]
    fn missing_file_falls_back_to_bootstrap() {
        let dir = must_ok(tempfile::tempdir());
        let config = must_ok(AgentOsConfig::load(&dir.path().join("absent.toml")));
        assert_eq!(config, AgentOsConfig::bootstrap());
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("agent_os.toml");
        let mut file = must_ok(std::fs::File::create(&path));
        must_ok(writeln!(
            file,
            "[breaker]\nfailure_threshold = 5\n\n[tuner]\nwindow_days = 3\n"
        ));
        let config = must_ok(AgentOsConfig::load(&path));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_seconds, 300);
        assert_eq!(config.tuner.window_days, 3);
        assert!(!config.profiles.is_empty());
    }

    #[test]
    fn rejects_zero_fallback_budget() {
        let mut config = AgentOsConfig::bootstrap();
        if let Some(strict) = config.profiles.get_mut(&Profile::Strict) {
            strict.max_fallback_steps = 0;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_auto_profile_section() {
        let mut config = AgentOsConfig::bootstrap();
        config.profiles.insert(
            Profile::Auto,
            ProfileSettings {
                deterministic: false,
                learning_enabled: true,
                max_fallback_steps: 2,
                base_weight: 0.5,
                memory_weight: 0.5,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_touch_paths_but_not_governance() {
        let mut config = AgentOsConfig::bootstrap();
        let before = config.governance.clone();
        std::env::set_var(ENV_DATA_DIR, "/tmp/agent-os-test-state");
        config.apply_env_overrides();
        std::env::remove_var(ENV_DATA_DIR);
        assert_eq!(config.defaults.data_dir, PathBuf::from("/tmp/agent-os-test-state"));
        assert_eq!(config.governance, before);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("agent_os.toml");
        must_ok(std::fs::write(&path, "[defaults]\nprofil = \"strict\"\n"));
        assert!(AgentOsConfig::load(&path).is_err());
    }
}

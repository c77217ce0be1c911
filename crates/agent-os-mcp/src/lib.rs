#![forbid(unsafe_code)]

//! MCP-style connector runtime. When a strategy delegates to external tools,
//! this crate chooses among candidate tools (smart routing over intent match,
//! historical success, latency, and cost), executes with bounded retries and
//! fallbacks, isolates failing tools behind a persisted circuit breaker, and
//! records every call chain as a replayable record.

pub mod adapters;
pub mod breaker;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod runtime;

pub use adapters::{PolicyEngine, ToolAdapter, ToolInfo};
pub use breaker::CircuitBreaker;
pub use pipeline::{
    load_pipeline_spec, run_pipeline, PipelineOutcome, PipelineSpec, PipelineStep, StepOnError,
};
pub use registry::{ServerConfig, ToolRegistry};
pub use router::{RouteMatch, RouteRule, Router};
pub use runtime::{McpRuntime, RankedTool, ToolAttempt, ToolRunOutcome};

use agent_os_domain::ErrorKind;

/// Typed MCP failure with a stable code, mirroring the tool invocation
/// contract's error object (`error_kind`, `message`, `retryable`).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct McpError {
    pub code: McpErrorCode,
    pub message: String,
}

impl McpError {
    #[must_use]
    pub fn new(code: McpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Transient failures are retried before the chain advances.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self.code,
            McpErrorCode::Timeout | McpErrorCode::Connection | McpErrorCode::ServerStatus
        )
    }

    /// Map into the kernel's stable error taxonomy.
    #[must_use]
    pub fn error_kind(&self) -> ErrorKind {
        match self.code {
            McpErrorCode::Timeout => ErrorKind::ToolTimeout,
            McpErrorCode::Connection | McpErrorCode::ServerStatus => {
                ErrorKind::ServiceUnavailable
            }
            McpErrorCode::PolicyForbidden => ErrorKind::PolicyViolation,
            McpErrorCode::NotFound | McpErrorCode::Config | McpErrorCode::InvalidArgs => {
                ErrorKind::InternalError
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpErrorCode {
    Timeout,
    Connection,
    /// 5xx-equivalent upstream status.
    ServerStatus,
    PolicyForbidden,
    NotFound,
    Config,
    InvalidArgs,
}

impl std::fmt::Display for McpErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Timeout => "TIMEOUT",
            Self::Connection => "CONNECTION",
            Self::ServerStatus => "SERVER_STATUS",
            Self::PolicyForbidden => "POLICY_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Config => "CONFIG",
            Self::InvalidArgs => "INVALID_ARGS",
        };
        write!(f, "{text}")
    }
}

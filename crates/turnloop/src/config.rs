// Runtime Configuration
//
// Process-level defaults for the tool loop, the executor and logging,
// loaded from environment variables (a `.env` file is honoured).

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{InferenceError, Result};
use crate::toolloop::{LoopConfig, DEFAULT_PAUSE_TIMEOUT};
use crate::tools::{parse_duration, ToolConfig, ToolErrorHandling};

/// Default filter used when neither `RUST_LOG` nor `TURNLOOP_LOG` is set
pub const DEFAULT_LOG_FILTER: &str = "turnloop=info";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Tool loop iteration cap
    pub max_iterations: usize,

    /// How long a step-mode pause waits before auto-continuing
    #[serde(with = "crate::tools::config::duration_nanos")]
    pub step_pause_timeout: Duration,

    pub max_parallel_tools: usize,

    /// Per-attempt tool timeout
    #[serde(with = "crate::tools::config::duration_nanos")]
    pub execution_timeout: Duration,

    pub tool_error_handling: ToolErrorHandling,

    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let tools = ToolConfig::default();
        Self {
            max_iterations: LoopConfig::default().max_iterations,
            step_pause_timeout: DEFAULT_PAUSE_TIMEOUT,
            max_parallel_tools: tools.max_parallel_tools,
            execution_timeout: tools.execution_timeout,
            tool_error_handling: tools.tool_error_handling,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TURNLOOP_MAX_ITERATIONS`: tool loop cap (default: 5)
    /// - `TURNLOOP_STEP_PAUSE_TIMEOUT`: e.g. `30s`, `1m` (default: 30s)
    /// - `TURNLOOP_MAX_PARALLEL_TOOLS`: (default: 3)
    /// - `TURNLOOP_EXECUTION_TIMEOUT`: e.g. `30s`, `250ms` (default: 30s)
    /// - `TURNLOOP_TOOL_ERROR_HANDLING`: `continue`, `abort` or `retry`
    /// - `TURNLOOP_LOG`: tracing filter (default: `turnloop=info`)
    ///
    /// Unparsable values are rejected with a configuration error.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!(error = %e, "Failed to load .env file");
            }
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TURNLOOP_MAX_ITERATIONS") {
            config.max_iterations = parse_number("TURNLOOP_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = var("TURNLOOP_STEP_PAUSE_TIMEOUT") {
            config.step_pause_timeout = parse_env_duration("TURNLOOP_STEP_PAUSE_TIMEOUT", &v)?;
        }
        if let Some(v) = var("TURNLOOP_MAX_PARALLEL_TOOLS") {
            config.max_parallel_tools = parse_number("TURNLOOP_MAX_PARALLEL_TOOLS", &v)?;
        }
        if let Some(v) = var("TURNLOOP_EXECUTION_TIMEOUT") {
            config.execution_timeout = parse_env_duration("TURNLOOP_EXECUTION_TIMEOUT", &v)?;
        }
        if let Some(v) = var("TURNLOOP_TOOL_ERROR_HANDLING") {
            config.tool_error_handling =
                serde_json::from_value(serde_json::Value::String(v.trim().to_lowercase()))
                    .map_err(|_| {
                        InferenceError::config(format!("TURNLOOP_TOOL_ERROR_HANDLING: unknown mode {v:?}"))
                    })?;
        }
        if let Some(v) = var("TURNLOOP_LOG") {
            config.log_filter = v;
        }
        Ok(config)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig::default().with_max_iterations(self.max_iterations)
    }

    pub fn tool_config(&self) -> ToolConfig {
        ToolConfig::default()
            .with_max_iterations(self.max_iterations)
            .with_max_parallel_tools(self.max_parallel_tools)
            .with_execution_timeout(self.execution_timeout)
            .with_error_handling(self.tool_error_handling)
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| InferenceError::config(format!("{key}: expected a number, got {value:?}")))
}

fn parse_env_duration(key: &str, value: &str) -> Result<Duration> {
    parse_duration(value.trim())
        .ok_or_else(|| InferenceError::config(format!("{key}: invalid duration {value:?}")))
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn step_pause_timeout(mut self, timeout: Duration) -> Self {
        self.config.step_pause_timeout = timeout;
        self
    }

    pub fn max_parallel_tools(mut self, max: usize) -> Self {
        self.config.max_parallel_tools = max;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.config.execution_timeout = timeout;
        self
    }

    pub fn tool_error_handling(mut self, handling: ToolErrorHandling) -> Self {
        self.config.tool_error_handling = handling;
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.log_filter = filter.into();
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

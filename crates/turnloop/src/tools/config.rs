// Tool configuration
//
// ToolConfig travels in Turn.data (under TOOL_CONFIG) so provider engines
// can see which tools are offered and how the model may call them. Durations
// decode from humanised strings ("30s", "250ms", "1m30s") or integer
// nanoseconds and always encode as nanoseconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::turns::keys::{DataKey, Key, NAMESPACE};

/// Effective tool configuration recorded by the tool loop
pub const TOOL_CONFIG: DataKey<ToolConfig> = Key::new(NAMESPACE, "tool_config", 1);

/// How the model may choose tools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

/// What the executor does when a tool fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolErrorHandling {
    /// Record the error in the result and keep going
    #[default]
    Continue,
    /// Fail the batch
    Abort,
    /// Retry with exponential backoff, then record the error
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_nanos")]
    pub backoff_base: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

/// Upper bound for a single retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): base * factor^attempt,
    /// capped at [`MAX_BACKOFF`]
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let factor = self
            .backoff_factor
            .max(0.0)
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        Duration::try_from_secs_f64(self.backoff_base.as_secs_f64() * factor)
            .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub enabled: bool,
    pub tool_choice: ToolChoice,
    pub max_iterations: usize,
    #[serde(with = "duration_nanos")]
    pub execution_timeout: Duration,
    pub max_parallel_tools: usize,
    /// Allow-list of tool names; `None` allows every registered tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    pub tool_error_handling: ToolErrorHandling,
    pub retry_config: RetryConfig,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tool_choice: ToolChoice::Auto,
            max_iterations: 5,
            execution_timeout: Duration::from_secs(30),
            max_parallel_tools: 3,
            allowed_tools: None,
            tool_error_handling: ToolErrorHandling::Continue,
            retry_config: RetryConfig::default(),
        }
    }
}

impl ToolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_max_parallel_tools(mut self, max: usize) -> Self {
        self.max_parallel_tools = max;
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_error_handling(mut self, handling: ToolErrorHandling) -> Self {
        self.tool_error_handling = handling;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry_config = retry;
        self
    }

    pub fn is_tool_allowed(&self, name: &str) -> bool {
        match &self.allowed_tools {
            None => true,
            Some(allowed) => allowed.iter().any(|t| t == name),
        }
    }

    /// Keep only the allowed names, preserving order
    pub fn filter_tools<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        names
            .into_iter()
            .filter(|name| self.is_tool_allowed(name))
            .map(str::to_string)
            .collect()
    }
}

// ============================================================================
// Duration codec
// ============================================================================

/// Parse a humanised duration such as `"30s"`, `"250ms"`, `"1m30s"` or
/// `"1.5h"`. A bare number is read as nanoseconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(nanos) = s.parse::<u64>() {
        return Some(Duration::from_nanos(nanos));
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }
    Some(Duration::from_nanos(total.round() as u64))
}

pub(crate) mod duration_nanos {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Nanos(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Nanos(n) => Ok(Duration::from_nanos(n)),
            Raw::Text(text) => parse_duration(&text).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid duration: {text:?}"))
            }),
        }
    }
}

// Per-turn inference settings
//
// Provider engines read these from Turn.data. Every field is optional; a
// turn-level value wins over the engine default, an unset one falls back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::InferenceError;
use crate::turns::keys::{DataKey, Key, NAMESPACE};
use crate::turns::Turn;

pub const INFERENCE_CONFIG: DataKey<InferenceConfig> = Key::new(NAMESPACE, "inference_config", 1);
pub const STRUCTURED_OUTPUT: DataKey<StructuredOutputConfig> =
    Key::new(NAMESPACE, "structured_output", 1);

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Token budget for model reasoning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
    /// "low", "medium" or "high"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// "auto", "concise" or "detailed"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl InferenceConfig {
    /// Fields set on `self` win; unset ones come from `defaults`
    pub fn merged_over(&self, defaults: &InferenceConfig) -> InferenceConfig {
        InferenceConfig {
            thinking_budget: self.thinking_budget.or(defaults.thinking_budget),
            reasoning_effort: self
                .reasoning_effort
                .clone()
                .or_else(|| defaults.reasoning_effort.clone()),
            reasoning_summary: self
                .reasoning_summary
                .clone()
                .or_else(|| defaults.reasoning_summary.clone()),
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            max_response_tokens: self.max_response_tokens.or(defaults.max_response_tokens),
            stop: if self.stop.is_empty() {
                defaults.stop.clone()
            } else {
                self.stop.clone()
            },
            seed: self.seed.or(defaults.seed),
        }
    }

    /// Effective config for a turn. `None` when neither the turn nor the
    /// engine carries one; an undecodable turn value is ignored.
    pub fn resolve(turn: &Turn, defaults: Option<&InferenceConfig>) -> Option<InferenceConfig> {
        let from_turn = INFERENCE_CONFIG.get(&turn.data).ok().flatten();
        match (from_turn, defaults) {
            (Some(t), Some(d)) => Some(t.merged_over(d)),
            (Some(t), None) => Some(t),
            (None, d) => d.cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredOutputMode {
    #[default]
    Off,
    JsonSchema,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuredOutputConfig {
    #[serde(default)]
    pub mode: StructuredOutputMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub schema: Map<String, Value>,
    /// Defaults to strict when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
    #[serde(default)]
    pub require_valid: bool,
}

impl StructuredOutputConfig {
    pub fn json_schema(name: impl Into<String>, schema: Map<String, Value>) -> Self {
        Self {
            mode: StructuredOutputMode::JsonSchema,
            name: name.into(),
            schema,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode == StructuredOutputMode::JsonSchema
    }

    pub fn strict_or_default(&self) -> bool {
        self.strict.unwrap_or(true)
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.name.trim().is_empty() {
            return Err(InferenceError::config(
                "structured output mode json_schema requires a non-empty schema name",
            ));
        }
        if self.schema.is_empty() {
            return Err(InferenceError::config(
                "structured output mode json_schema requires a non-empty JSON schema",
            ));
        }
        Ok(())
    }

    /// Turn override when present, else the default
    pub fn resolve(turn: &Turn, default: Option<&StructuredOutputConfig>) -> Option<StructuredOutputConfig> {
        STRUCTURED_OUTPUT
            .get(&turn.data)
            .ok()
            .flatten()
            .or_else(|| default.cloned())
    }
}

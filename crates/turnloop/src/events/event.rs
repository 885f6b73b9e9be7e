// Inference events
//
// Event carries two headers (EventMetadata, optional StepMetadata) and a
// typed payload. On the wire every event is a flat JSON object:
//
//   {"type": "partial", "meta": {...}, "step": {...}, "delta": "..", "completion": ".."}
//
// Built-in kinds derive their wire form from `EventPayload`. Third parties
// add kinds through `CustomEvent` and register a decoder with `EventRegistry`.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EventError;

/// Type discriminators of the built-in kinds
pub mod event_type {
    pub const START: &str = "start";
    pub const PARTIAL: &str = "partial";
    pub const FINAL: &str = "final";
    pub const TOOL_CALL: &str = "tool-call";
    pub const TOOL_RESULT: &str = "tool-result";
    pub const TOOL_CALL_EXECUTE: &str = "tool-call-execute";
    pub const TOOL_CALL_EXECUTION_RESULT: &str = "tool-call-execution-result";
    pub const ERROR: &str = "error";
    pub const INTERRUPT: &str = "interrupt";
    pub const LOG: &str = "log";
    pub const INFO: &str = "info";
    pub const DEBUGGER_PAUSE: &str = "debugger-pause";

    pub const BUILTIN: &[&str] = &[
        START,
        PARTIAL,
        FINAL,
        TOOL_CALL,
        TOOL_RESULT,
        TOOL_CALL_EXECUTE,
        TOOL_CALL_EXECUTION_RESULT,
        ERROR,
        INTERRUPT,
        LOG,
        INFO,
        DEBUGGER_PAUSE,
    ];
}

// ============================================================================
// Headers
// ============================================================================

/// Token usage reported by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Prompt caching (OpenAI style)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cached_tokens: u64,
    /// Prompt caching (Claude style)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_creation_input_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_read_input_tokens: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Identifiers and provider data attached to every event
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Stream identifier; all events of one model response share it
    #[serde(rename = "message_id", default)]
    pub id: Uuid,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inference_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub turn_id: String,

    /// Engine or model name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub engine: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Provider or context specific values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl EventMetadata {
    /// Metadata for a fresh stream
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_inference(mut self, inference_id: impl Into<String>) -> Self {
        self.inference_id = inference_id.into();
        self
    }

    pub fn with_turn(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = turn_id.into();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Copy ids from `other` into fields that are still unset
    pub fn fill_missing_ids(&mut self, other: &EventMetadata) {
        if self.id.is_nil() {
            self.id = other.id;
        }
        if self.session_id.is_empty() {
            self.session_id = other.session_id.clone();
        }
        if self.inference_id.is_empty() {
            self.inference_id = other.inference_id.clone();
        }
        if self.turn_id.is_empty() {
            self.turn_id = other.turn_id.clone();
        }
    }
}

/// Describes the processing step that produced an event
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepMetadata {
    #[serde(default)]
    pub step_id: Uuid,
    #[serde(rename = "type", default)]
    pub step_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

// ============================================================================
// Payloads
// ============================================================================

/// Tool call as announced by a provider or executed locally
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    /// Arguments as JSON text
    #[serde(default)]
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolResultInfo {
    pub id: String,
    #[serde(default)]
    pub result: String,
}

/// Built-in event payloads. `Custom` is handled outside serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    Start,

    Partial {
        delta: String,
        completion: String,
    },

    Final {
        text: String,
    },

    ToolCall {
        tool_call: ToolCallInfo,
    },

    ToolResult {
        tool_result: ToolResultInfo,
    },

    ToolCallExecute {
        tool_call: ToolCallInfo,
    },

    ToolCallExecutionResult {
        tool_result: ToolResultInfo,
    },

    Error {
        error_string: String,
    },

    Interrupt {
        text: String,
    },

    Log {
        level: String,
        message: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        fields: Map<String, Value>,
    },

    Info {
        message: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        data: Map<String, Value>,
    },

    DebuggerPause {
        pause_id: String,
        phase: String,
        summary: String,
        deadline_ms: i64,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        extra: Map<String, Value>,
    },

    #[serde(skip)]
    Custom(Arc<dyn CustomEvent>),
}

impl EventPayload {
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::Start => event_type::START,
            EventPayload::Partial { .. } => event_type::PARTIAL,
            EventPayload::Final { .. } => event_type::FINAL,
            EventPayload::ToolCall { .. } => event_type::TOOL_CALL,
            EventPayload::ToolResult { .. } => event_type::TOOL_RESULT,
            EventPayload::ToolCallExecute { .. } => event_type::TOOL_CALL_EXECUTE,
            EventPayload::ToolCallExecutionResult { .. } => event_type::TOOL_CALL_EXECUTION_RESULT,
            EventPayload::Error { .. } => event_type::ERROR,
            EventPayload::Interrupt { .. } => event_type::INTERRUPT,
            EventPayload::Log { .. } => event_type::LOG,
            EventPayload::Info { .. } => event_type::INFO,
            EventPayload::DebuggerPause { .. } => event_type::DEBUGGER_PAUSE,
            EventPayload::Custom(custom) => custom.event_type(),
        }
    }
}

// ============================================================================
// Custom events
// ============================================================================

/// An event kind defined outside this crate
pub trait CustomEvent: Debug + Send + Sync + 'static {
    /// Wire discriminator; must not collide with a built-in kind
    fn event_type(&self) -> &str;

    /// Kind-specific fields, encoded next to `type`/`meta`/`step`
    fn to_fields(&self) -> Result<Value, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;
}

/// Serde-backed custom event body with a fixed type string
///
/// Implementing this is enough to publish the type and to register it with
/// `EventRegistry::register_factory`.
pub trait EventBody: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    const TYPE: &'static str;
}

impl<T: EventBody> CustomEvent for T {
    fn event_type(&self) -> &str {
        T::TYPE
    }

    fn to_fields(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Event
// ============================================================================

#[derive(Debug, Clone)]
pub struct Event {
    pub metadata: EventMetadata,
    pub step: Option<StepMetadata>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(metadata: EventMetadata, payload: EventPayload) -> Self {
        Self {
            metadata,
            step: None,
            payload,
        }
    }

    pub fn start(metadata: EventMetadata) -> Self {
        Self::new(metadata, EventPayload::Start)
    }

    pub fn partial(
        metadata: EventMetadata,
        delta: impl Into<String>,
        completion: impl Into<String>,
    ) -> Self {
        Self::new(
            metadata,
            EventPayload::Partial {
                delta: delta.into(),
                completion: completion.into(),
            },
        )
    }

    pub fn final_text(metadata: EventMetadata, text: impl Into<String>) -> Self {
        Self::new(metadata, EventPayload::Final { text: text.into() })
    }

    pub fn tool_call(metadata: EventMetadata, tool_call: ToolCallInfo) -> Self {
        Self::new(metadata, EventPayload::ToolCall { tool_call })
    }

    pub fn tool_result(metadata: EventMetadata, tool_result: ToolResultInfo) -> Self {
        Self::new(metadata, EventPayload::ToolResult { tool_result })
    }

    pub fn tool_call_execute(metadata: EventMetadata, tool_call: ToolCallInfo) -> Self {
        Self::new(metadata, EventPayload::ToolCallExecute { tool_call })
    }

    pub fn tool_call_execution_result(metadata: EventMetadata, tool_result: ToolResultInfo) -> Self {
        Self::new(metadata, EventPayload::ToolCallExecutionResult { tool_result })
    }

    pub fn error(metadata: EventMetadata, error: impl std::fmt::Display) -> Self {
        Self::new(
            metadata,
            EventPayload::Error {
                error_string: error.to_string(),
            },
        )
    }

    pub fn interrupt(metadata: EventMetadata, text: impl Into<String>) -> Self {
        Self::new(metadata, EventPayload::Interrupt { text: text.into() })
    }

    pub fn log(
        metadata: EventMetadata,
        level: impl Into<String>,
        message: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Self {
        Self::new(
            metadata,
            EventPayload::Log {
                level: level.into(),
                message: message.into(),
                fields,
            },
        )
    }

    pub fn info(metadata: EventMetadata, message: impl Into<String>, data: Map<String, Value>) -> Self {
        Self::new(
            metadata,
            EventPayload::Info {
                message: message.into(),
                data,
            },
        )
    }

    pub fn debugger_pause(
        metadata: EventMetadata,
        pause_id: impl Into<String>,
        phase: impl Into<String>,
        summary: impl Into<String>,
        deadline_ms: i64,
        extra: Map<String, Value>,
    ) -> Self {
        Self::new(
            metadata,
            EventPayload::DebuggerPause {
                pause_id: pause_id.into(),
                phase: phase.into(),
                summary: summary.into(),
                deadline_ms,
                extra,
            },
        )
    }

    pub fn custom(metadata: EventMetadata, body: impl CustomEvent) -> Self {
        Self::new(metadata, EventPayload::Custom(Arc::new(body)))
    }

    pub fn with_step(mut self, step: StepMetadata) -> Self {
        self.step = Some(step);
        self
    }

    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }

    /// Downcast a custom payload to its concrete type
    pub fn custom_as<T: 'static>(&self) -> Option<&T> {
        match &self.payload {
            EventPayload::Custom(custom) => custom.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Encode to the flat JSON object form
    pub fn to_value(&self) -> Result<Value, EventError> {
        let encode = |e: serde_json::Error| EventError::Encode(e.to_string());

        let mut object = match &self.payload {
            EventPayload::Custom(custom) => {
                let mut fields = match custom.to_fields().map_err(encode)? {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    other => {
                        let mut map = Map::new();
                        map.insert("data".to_string(), other);
                        map
                    }
                };
                fields.insert(
                    "type".to_string(),
                    Value::String(custom.event_type().to_string()),
                );
                fields
            }
            builtin => match serde_json::to_value(builtin).map_err(encode)? {
                Value::Object(map) => map,
                _ => return Err(EventError::Encode("payload is not an object".into())),
            },
        };

        object.insert(
            "meta".to_string(),
            serde_json::to_value(&self.metadata).map_err(encode)?,
        );
        if let Some(step) = &self.step {
            object.insert("step".to_string(), serde_json::to_value(step).map_err(encode)?);
        }
        Ok(Value::Object(object))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(&self.to_value()?).map_err(|e| EventError::Encode(e.to_string()))
    }
}

// Block - one step in the conversation
//
// A block is a tagged variant (kind) with a JSON payload map. The payload keys
// each kind requires are listed on `BlockKind`; constructors below build
// well-formed blocks so callers rarely touch the payload map directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::keys::BlockMetadata;

/// Payload keys used across block kinds
pub mod payload {
    pub const TEXT: &str = "text";
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const ARGS: &str = "args";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const ENCRYPTED_CONTENT: &str = "encrypted_content";
    pub const IMAGES: &str = "images";
    pub const ITEM_ID: &str = "item_id";
}

/// Conventional role strings
pub mod role {
    pub const USER: &str = "user";
    pub const ASSISTANT: &str = "assistant";
    pub const SYSTEM: &str = "system";
    pub const TOOL: &str = "tool";
}

/// Kind of a block
///
/// | kind | payload |
/// |---|---|
/// | `user`, `system`, `llm_text` | `text` |
/// | `reasoning` | `text` or `encrypted_content` |
/// | `tool_call` | `id`, `name`, `args` |
/// | `tool_use` | `id`, `result` and/or `error` |
/// | `other` | anything |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    User,
    System,
    LlmText,
    Reasoning,
    ToolCall,
    ToolUse,
    #[serde(other)]
    Other,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::User => "user",
            BlockKind::System => "system",
            BlockKind::LlmText => "llm_text",
            BlockKind::Reasoning => "reasoning",
            BlockKind::ToolCall => "tool_call",
            BlockKind::ToolUse => "tool_use",
            BlockKind::Other => "other",
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    pub kind: BlockKind,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,

    #[serde(default)]
    pub payload: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BlockMetadata::is_empty")]
    pub metadata: BlockMetadata,
}

impl Block {
    /// Create an empty block of the given kind
    pub fn new(kind: BlockKind) -> Self {
        Self {
            id: String::new(),
            kind,
            role: String::new(),
            payload: BTreeMap::new(),
            metadata: BlockMetadata::new(),
        }
    }

    fn text_block(kind: BlockKind, role: &str, text: impl Into<String>) -> Self {
        Self::new(kind)
            .with_role(role)
            .with_payload(payload::TEXT, Value::String(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_block(BlockKind::User, role::USER, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text_block(BlockKind::System, role::SYSTEM, text)
    }

    pub fn llm_text(text: impl Into<String>) -> Self {
        Self::text_block(BlockKind::LlmText, role::ASSISTANT, text)
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::text_block(BlockKind::Reasoning, role::ASSISTANT, text)
    }

    /// Reasoning carried only as provider-encrypted content
    pub fn encrypted_reasoning(encrypted: impl Into<String>) -> Self {
        Self::new(BlockKind::Reasoning)
            .with_role(role::ASSISTANT)
            .with_payload(payload::ENCRYPTED_CONTENT, Value::String(encrypted.into()))
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self::new(BlockKind::ToolCall)
            .with_role(role::ASSISTANT)
            .with_payload(payload::ID, Value::String(id.into()))
            .with_payload(payload::NAME, Value::String(name.into()))
            .with_payload(payload::ARGS, args)
    }

    pub fn tool_use(id: impl Into<String>, result: Value) -> Self {
        Self::new(BlockKind::ToolUse)
            .with_role(role::TOOL)
            .with_payload(payload::ID, Value::String(id.into()))
            .with_payload(payload::RESULT, result)
    }

    pub fn tool_use_error(id: impl Into<String>, result: Value, error: impl Into<String>) -> Self {
        Self::tool_use(id, result).with_payload(payload::ERROR, Value::String(error.into()))
    }

    pub fn other(payload: BTreeMap<String, Value>) -> Self {
        Self {
            payload,
            ..Self::new(BlockKind::Other)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// String payload value, if present and a string
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn text(&self) -> Option<&str> {
        self.payload_str(payload::TEXT)
    }

    /// The `id` payload of tool_call / tool_use blocks
    pub fn tool_id(&self) -> Option<&str> {
        self.payload_str(payload::ID).filter(|id| !id.is_empty())
    }

    pub fn is_kind(&self, kind: BlockKind) -> bool {
        self.kind == kind
    }
}

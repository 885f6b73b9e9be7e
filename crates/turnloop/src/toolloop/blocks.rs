// Tool blocks
//
// Conversion between Turn blocks and executor calls/results. A tool call is
// pending while no tool_use block carries its id.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::tools::{ToolCall, ToolResult};
use crate::turns::{payload, Block, BlockKind, Turn};

/// tool_call blocks without a matching tool_use, in Turn order. Blocks
/// without an id are skipped.
pub fn extract_pending_tool_calls(turn: &Turn) -> Vec<ToolCall> {
    let used: HashSet<&str> = turn
        .blocks_of_kind(BlockKind::ToolUse)
        .filter_map(Block::tool_id)
        .collect();

    turn.blocks_of_kind(BlockKind::ToolCall)
        .filter_map(|block| {
            let id = block.tool_id().filter(|id| !id.is_empty())?;
            if used.contains(id) {
                return None;
            }
            let name = block.payload_str(payload::NAME).unwrap_or_default();
            Some(ToolCall::new(id, name, call_arguments(block.payload.get(payload::ARGS))))
        })
        .collect()
}

/// Arguments may be stored as an object, as JSON text, or as any other
/// value; absent or unparsable text becomes `{}`
fn call_arguments(raw: Option<&Value>) -> Value {
    match raw {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::String(text)) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::Object(Map::new()))
        }
        Some(other) => other.clone(),
    }
}

/// tool_use block content: the JSON result, or `Error: <msg>` on failure
pub fn tool_result_content(result: &ToolResult) -> String {
    match &result.error {
        Some(e) => format!("Error: {e}"),
        None => serde_json::to_string(&result.result).unwrap_or_default(),
    }
}

/// Append one tool_use block per result, in the given order
pub fn append_tool_results_blocks(turn: &mut Turn, results: &[ToolResult]) {
    turn.append_blocks(results.iter().map(|result| {
        let content = Value::String(tool_result_content(result));
        match &result.error {
            Some(e) => Block::tool_use_error(&result.id, content, e),
            None => Block::tool_use(&result.id, content),
        }
    }));
}

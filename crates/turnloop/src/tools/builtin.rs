// Built-in tools
//
// Small tools used by demos and tests.

use serde_json::{json, Value};

use super::definition::ToolDefinition;
use crate::error::ToolError;

/// Echoes back `message` (useful for testing)
pub fn echo_tool() -> ToolDefinition {
    ToolDefinition::from_json_fn(
        "echo",
        "Echo back the provided message. Useful for testing tool execution.",
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo back"
                }
            },
            "required": ["message"],
            "additionalProperties": false
        }),
        |_ctx, args: Value| async move {
            let message = args
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Ok(json!({
                "echoed": message,
                "length": message.len()
            }))
        },
    )
}

/// Always fails with `message` (useful for testing error handling)
pub fn failing_tool(message: impl Into<String>) -> ToolDefinition {
    let message = message.into();
    ToolDefinition::from_json_fn(
        "fail",
        "A tool that always fails. Used for testing error handling.",
        json!({"type": "object", "properties": {}}),
        move |_ctx, _args: Value| {
            let message = message.clone();
            async move { Err::<Value, _>(ToolError::Execution(message)) }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;

    #[tokio::test]
    async fn test_echo_tool() {
        let out = echo_tool()
            .invoke(&RunContext::new(), json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"echoed": "hi", "length": 2}));
    }

    #[tokio::test]
    async fn test_failing_tool() {
        let err = failing_tool("boom")
            .invoke(&RunContext::new(), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}

// Tool executor
//
// Executes ToolCalls against a ToolRegistry. Every policy decision goes
// through an ExecutorHooks implementation so callers can override one step
// (argument masking, authorization, retry) without rewriting the rest.
//
// Design decisions:
// - Lookup and authorization failures become results with an error, not
//   executor errors. Only cancellation fails `execute_tool_call`.
// - `execution_timeout` bounds each attempt; a timed out attempt counts as a
//   tool error and may be retried.
// - Batch results always come back in call order, whatever order the tools
//   finished in.
// - With `abort`, a parallel batch waits for the in-flight tools and then
//   reports the first failed call in call order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::config::{duration_nanos, ToolConfig, ToolErrorHandling};
use super::definition::ToolDefinition;
use super::registry::ToolRegistry;
use crate::context::RunContext;
use crate::error::{InferenceError, Result, ToolError};
use crate::events::{Event, ToolCallInfo, ToolResultInfo};

// ============================================================================
// Calls and results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within a Turn
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    #[serde(default)]
    pub retries: u32,
}

impl ToolResult {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result,
            error: None,
            duration: Duration::ZERO,
            retries: 0,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            id: id.into(),
            result: Value::Null,
            error: Some(error.to_string()),
            duration: Duration::ZERO,
            retries: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Text form used for result events: the JSON result, `Error: <e>`, or
    /// both joined when a failed tool still produced output
    pub fn event_payload(&self) -> String {
        let json = if self.result.is_null() {
            None
        } else {
            Some(serde_json::to_string(&self.result).unwrap_or_default())
        };
        match (json, &self.error) {
            (Some(json), Some(e)) => format!("{json} | Error: {e}"),
            (None, Some(e)) => format!("Error: {e}"),
            (Some(json), None) => json,
            (None, None) => "null".to_string(),
        }
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// Overridable steps of tool execution
#[async_trait]
pub trait ExecutorHooks: Send + Sync {
    fn config(&self) -> &ToolConfig;

    /// Rewrite the call before lookup. An error fails this call only.
    async fn pre_execute(&self, _ctx: &RunContext, call: ToolCall) -> std::result::Result<ToolCall, ToolError> {
        Ok(call)
    }

    fn is_allowed(&self, call: &ToolCall) -> bool {
        self.config().is_tool_allowed(&call.name)
    }

    /// Argument text placed in events
    fn mask_arguments(&self, call: &ToolCall) -> String {
        serde_json::to_string(&call.arguments).unwrap_or_default()
    }

    async fn publish_start(&self, ctx: &RunContext, call: &ToolCall, masked_args: &str) {
        let info = ToolCallInfo {
            id: call.id.clone(),
            name: call.name.clone(),
            input: masked_args.to_string(),
        };
        ctx.publish(&Event::tool_call_execute(ctx.event_metadata(), info))
            .await;
    }

    async fn publish_result(&self, ctx: &RunContext, _call: &ToolCall, result: &ToolResult) {
        let info = ToolResultInfo {
            id: result.id.clone(),
            result: result.event_payload(),
        };
        ctx.publish(&Event::tool_call_execution_result(ctx.event_metadata(), info))
            .await;
    }

    /// Backoff before retrying after failed attempt `attempt` (0-based), or
    /// `None` to stop
    fn should_retry(&self, attempt: u32, _error: &ToolError) -> Option<Duration> {
        let config = self.config();
        if config.tool_error_handling != ToolErrorHandling::Retry {
            return None;
        }
        if attempt >= config.retry_config.max_retries {
            return None;
        }
        Some(config.retry_config.backoff(attempt))
    }

    fn max_parallel(&self) -> usize {
        self.config().max_parallel_tools.max(1)
    }
}

/// Hooks that implement the documented defaults over a ToolConfig
#[derive(Debug, Clone, Default)]
pub struct DefaultHooks {
    config: ToolConfig,
}

impl DefaultHooks {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }
}

impl ExecutorHooks for DefaultHooks {
    fn config(&self) -> &ToolConfig {
        &self.config
    }
}

// ============================================================================
// Executor
// ============================================================================

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute one call. Tool failures are reported in the result; `Err`
    /// means the run was cancelled.
    async fn execute_tool_call(
        &self,
        ctx: &RunContext,
        call: ToolCall,
        registry: &ToolRegistry,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Execute a batch; results are in call order
    async fn execute_tool_calls(
        &self,
        ctx: &RunContext,
        calls: Vec<ToolCall>,
        registry: &ToolRegistry,
    ) -> Result<Vec<ToolResult>>;
}

pub struct DefaultToolExecutor<H: ExecutorHooks = DefaultHooks> {
    hooks: H,
}

impl DefaultToolExecutor<DefaultHooks> {
    pub fn new(config: ToolConfig) -> Self {
        Self {
            hooks: DefaultHooks::new(config),
        }
    }
}

impl Default for DefaultToolExecutor<DefaultHooks> {
    fn default() -> Self {
        Self::new(ToolConfig::default())
    }
}

impl<H: ExecutorHooks> DefaultToolExecutor<H> {
    pub fn with_hooks(hooks: H) -> Self {
        Self { hooks }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn config(&self) -> &ToolConfig {
        self.hooks.config()
    }

    /// Run the retry loop for a resolved definition
    async fn invoke_with_retry(
        &self,
        ctx: &RunContext,
        call: &ToolCall,
        def: &ToolDefinition,
    ) -> std::result::Result<ToolResult, ToolError> {
        let timeout = self.hooks.config().execution_timeout;
        let mut attempt: u32 = 0;

        loop {
            debug!(tool = %call.name, call_id = %call.id, attempt, "Executing tool");

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(ToolError::Cancelled),
                outcome = invoke_once(ctx, def, call.arguments.clone(), timeout) => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    let mut result = ToolResult::success(&call.id, value);
                    result.retries = attempt;
                    return Ok(result);
                }
                Err(err) => err,
            };

            let Some(backoff) = self.hooks.should_retry(attempt, &err) else {
                let mut result = ToolResult::failure(&call.id, &err);
                result.retries = attempt;
                return Ok(result);
            };

            warn!(
                tool = %call.name,
                call_id = %call.id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Tool failed, retrying"
            );

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(ToolError::CancelledDuringBackoff),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    fn abort_error(&self, call: &ToolCall, result: &ToolResult) -> Option<InferenceError> {
        if self.hooks.config().tool_error_handling != ToolErrorHandling::Abort {
            return None;
        }
        let error = result.error.as_ref()?;
        error!(tool = %call.name, call_id = %call.id, error = %error, "Aborting tool batch");
        Some(InferenceError::ToolAborted {
            name: call.name.clone(),
            error: error.clone(),
        })
    }

    async fn execute_sequential(
        &self,
        ctx: &RunContext,
        calls: Vec<ToolCall>,
        registry: &ToolRegistry,
    ) -> Result<Vec<ToolResult>> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let result = self
                .execute_tool_call(ctx, call.clone(), registry)
                .await
                .map_err(cancelled)?;
            if let Some(err) = self.abort_error(&call, &result) {
                return Err(err);
            }
            results.push(result);
        }
        Ok(results)
    }

    async fn execute_parallel(
        &self,
        ctx: &RunContext,
        calls: Vec<ToolCall>,
        registry: &ToolRegistry,
    ) -> Result<Vec<ToolResult>> {
        let semaphore = Arc::new(Semaphore::new(self.hooks.max_parallel()));

        let outcomes = join_all(calls.iter().cloned().map(|call| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.ok();
                self.execute_tool_call(ctx, call, registry).await
            }
        }))
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (call, outcome) in calls.iter().zip(outcomes) {
            let result = outcome.map_err(cancelled)?;
            if let Some(err) = self.abort_error(call, &result) {
                return Err(err);
            }
            results.push(result);
        }
        Ok(results)
    }
}

#[async_trait]
impl<H: ExecutorHooks> ToolExecutor for DefaultToolExecutor<H> {
    async fn execute_tool_call(
        &self,
        ctx: &RunContext,
        call: ToolCall,
        registry: &ToolRegistry,
    ) -> std::result::Result<ToolResult, ToolError> {
        let started = Instant::now();
        let id = call.id.clone();

        let call = match self.hooks.pre_execute(ctx, call).await {
            Ok(call) => call,
            Err(e) => return Ok(ToolResult::failure(id, e)),
        };

        let def = match registry.get(&call.name) {
            Ok(def) => def,
            Err(e) => return Ok(ToolResult::failure(&call.id, e)),
        };

        if !self.hooks.is_allowed(&call) {
            return Ok(ToolResult::failure(
                &call.id,
                ToolError::NotAllowed(call.name.clone()),
            ));
        }

        let masked = self.hooks.mask_arguments(&call);
        self.hooks.publish_start(ctx, &call, &masked).await;

        let mut result = self.invoke_with_retry(ctx, &call, &def).await?;
        result.duration = started.elapsed();

        self.hooks.publish_result(ctx, &call, &result).await;
        Ok(result)
    }

    async fn execute_tool_calls(
        &self,
        ctx: &RunContext,
        calls: Vec<ToolCall>,
        registry: &ToolRegistry,
    ) -> Result<Vec<ToolResult>> {
        match calls.len() {
            0 => Ok(Vec::new()),
            1 => self.execute_sequential(ctx, calls, registry).await,
            _ if self.hooks.max_parallel() <= 1 => {
                self.execute_sequential(ctx, calls, registry).await
            }
            _ => self.execute_parallel(ctx, calls, registry).await,
        }
    }
}

impl<H: ExecutorHooks> std::fmt::Debug for DefaultToolExecutor<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultToolExecutor")
            .field("config", self.hooks.config())
            .finish()
    }
}

async fn invoke_once(
    ctx: &RunContext,
    def: &ToolDefinition,
    args: Value,
    timeout: Duration,
) -> std::result::Result<Value, ToolError> {
    if timeout.is_zero() {
        return def.invoke(ctx, args).await;
    }
    match tokio::time::timeout(timeout, def.invoke(ctx, args)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ToolError::Timeout(timeout)),
    }
}

fn cancelled(_: ToolError) -> InferenceError {
    InferenceError::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_type, CollectingSink};
    use crate::tools::builtin::{echo_tool, failing_tool};
    use crate::tools::config::RetryConfig;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .tool(echo_tool())
            .tool(failing_tool("boom"))
            .build()
            .unwrap()
    }

    fn sleep_tool(name: &'static str, ms: u64, log: Arc<Mutex<Vec<String>>>) -> ToolDefinition {
        ToolDefinition::from_json_fn(name, "sleeps", json!({}), move |_ctx, _args| {
            let log = log.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                log.lock().push(name.to_string());
                Ok(json!(name))
            }
        })
    }

    #[tokio::test]
    async fn test_execute_success_publishes_events() {
        let sink = CollectingSink::new();
        let ctx = RunContext::new().with_event_sink(Arc::new(sink.clone()));
        let executor = DefaultToolExecutor::default();

        let result = executor
            .execute_tool_call(&ctx, ToolCall::new("c1", "echo", json!({"message": "hi"})), &registry())
            .await
            .unwrap();

        assert_eq!(result.id, "c1");
        assert_eq!(result.result["echoed"], "hi");
        assert!(!result.is_error());
        assert_eq!(
            sink.event_types(),
            vec![
                event_type::TOOL_CALL_EXECUTE.to_string(),
                event_type::TOOL_CALL_EXECUTION_RESULT.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_not_found_and_not_allowed() {
        let executor =
            DefaultToolExecutor::new(ToolConfig::default().with_allowed_tools(["fail"]));
        let ctx = RunContext::new();

        let missing = executor
            .execute_tool_call(&ctx, ToolCall::new("c1", "nope", json!({})), &registry())
            .await
            .unwrap();
        assert_eq!(missing.error.as_deref(), Some("tool not found: nope"));

        let denied = executor
            .execute_tool_call(&ctx, ToolCall::new("c2", "echo", json!({})), &registry())
            .await
            .unwrap();
        assert_eq!(denied.error.as_deref(), Some("tool not allowed: echo"));
    }

    #[tokio::test]
    async fn test_continue_mode_collects_errors() {
        let executor = DefaultToolExecutor::default();
        let results = executor
            .execute_tool_calls(
                &RunContext::new(),
                vec![
                    ToolCall::new("a", "fail", json!({})),
                    ToolCall::new("b", "echo", json!({"message": "x"})),
                ],
                &registry(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].error.as_deref(), Some("boom"));
        assert_eq!(results[0].event_payload(), "Error: boom");
        assert!(!results[1].is_error());
    }

    #[tokio::test]
    async fn test_abort_mode_sequential_stops() {
        let executor = DefaultToolExecutor::new(
            ToolConfig::default()
                .with_max_parallel_tools(1)
                .with_error_handling(ToolErrorHandling::Abort),
        );
        let sink = CollectingSink::new();
        let ctx = RunContext::new().with_event_sink(Arc::new(sink.clone()));

        let err = executor
            .execute_tool_calls(
                &ctx,
                vec![
                    ToolCall::new("a", "fail", json!({})),
                    ToolCall::new("b", "echo", json!({"message": "x"})),
                ],
                &registry(),
            )
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "tool execution aborted due to error in fail: boom"
        );
        // second call never started
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let flaky = ToolDefinition::from_json_fn("flaky", "fails twice", json!({}), move |_ctx, _args| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ToolError::execution("transient"))
                } else {
                    Ok(json!("ok"))
                }
            }
        });
        let registry = ToolRegistry::builder().tool(flaky).build().unwrap();
        let executor = DefaultToolExecutor::new(
            ToolConfig::default()
                .with_error_handling(ToolErrorHandling::Retry)
                .with_retry_config(RetryConfig {
                    max_retries: 3,
                    backoff_base: Duration::from_millis(10),
                    backoff_factor: 2.0,
                }),
        );

        let result = executor
            .execute_tool_call(&RunContext::new(), ToolCall::new("c", "flaky", json!({})), &registry)
            .await
            .unwrap();

        assert_eq!(result.result, json!("ok"));
        assert_eq!(result.retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_reports_last_error() {
        let executor = DefaultToolExecutor::new(
            ToolConfig::default()
                .with_error_handling(ToolErrorHandling::Retry)
                .with_retry_config(RetryConfig {
                    max_retries: 2,
                    backoff_base: Duration::from_millis(5),
                    backoff_factor: 1.0,
                }),
        );
        let result = executor
            .execute_tool_call(&RunContext::new(), ToolCall::new("c", "fail", json!({})), &registry())
            .await
            .unwrap();
        assert_eq!(result.retries, 2);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let executor = DefaultToolExecutor::new(
            ToolConfig::default()
                .with_error_handling(ToolErrorHandling::Retry)
                .with_retry_config(RetryConfig {
                    max_retries: 5,
                    backoff_base: Duration::from_secs(60),
                    backoff_factor: 1.0,
                }),
        );
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = executor
            .execute_tool_call(&ctx, ToolCall::new("c", "fail", json!({})), &registry())
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::CancelledDuringBackoff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_tool_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ToolRegistry::builder()
            .tool(sleep_tool("slow", 5_000, log))
            .build()
            .unwrap();
        let executor = DefaultToolExecutor::new(
            ToolConfig::default().with_execution_timeout(Duration::from_millis(100)),
        );

        let result = executor
            .execute_tool_call(&RunContext::new(), ToolCall::new("c", "slow", json!({})), &registry)
            .await
            .unwrap();
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_results_in_call_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ToolRegistry::builder()
            .tool(sleep_tool("slow", 300, log.clone()))
            .tool(sleep_tool("medium", 200, log.clone()))
            .tool(sleep_tool("fast", 100, log.clone()))
            .build()
            .unwrap();
        let executor = DefaultToolExecutor::new(ToolConfig::default().with_max_parallel_tools(3));

        let started = tokio::time::Instant::now();
        let results = executor
            .execute_tool_calls(
                &RunContext::new(),
                vec![
                    ToolCall::new("1", "slow", json!({})),
                    ToolCall::new("2", "medium", json!({})),
                    ToolCall::new("3", "fast", json!({})),
                ],
                &registry,
            )
            .await
            .unwrap();

        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(*log.lock(), vec!["fast", "medium", "slow"]);
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_abort_reports_first_in_call_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ToolRegistry::builder()
            .tool(sleep_tool("slow", 300, log.clone()))
            .tool(failing_tool("boom"))
            .build()
            .unwrap();
        let executor = DefaultToolExecutor::new(
            ToolConfig::default().with_error_handling(ToolErrorHandling::Abort),
        );

        let err = executor
            .execute_tool_calls(
                &RunContext::new(),
                vec![
                    ToolCall::new("1", "slow", json!({})),
                    ToolCall::new("2", "fail", json!({})),
                ],
                &registry,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InferenceError::ToolAborted { ref name, .. } if name == "fail"));
        // in-flight tool ran to completion
        assert_eq!(*log.lock(), vec!["slow"]);
    }

    struct MaskingHooks(ToolConfig);

    #[async_trait]
    impl ExecutorHooks for MaskingHooks {
        fn config(&self) -> &ToolConfig {
            &self.0
        }

        fn mask_arguments(&self, _call: &ToolCall) -> String {
            "***".to_string()
        }

        async fn pre_execute(
            &self,
            _ctx: &RunContext,
            mut call: ToolCall,
        ) -> std::result::Result<ToolCall, ToolError> {
            call.name = call.name.to_lowercase();
            Ok(call)
        }
    }

    #[tokio::test]
    async fn test_custom_hooks() {
        let sink = CollectingSink::new();
        let ctx = RunContext::new().with_event_sink(Arc::new(sink.clone()));
        let executor = DefaultToolExecutor::with_hooks(MaskingHooks(ToolConfig::default()));

        let result = executor
            .execute_tool_call(&ctx, ToolCall::new("c", "ECHO", json!({"message": "secret"})), &registry())
            .await
            .unwrap();
        assert!(!result.is_error());

        let events = sink.events();
        match &events[0].payload {
            crate::events::EventPayload::ToolCallExecute { tool_call } => {
                assert_eq!(tool_call.input, "***");
                assert_eq!(tool_call.name, "echo");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_event_payload_forms() {
        let mut result = ToolResult::success("a", json!({"x": 1}));
        assert_eq!(result.event_payload(), r#"{"x":1}"#);
        result.error = Some("late".into());
        assert_eq!(result.event_payload(), r#"{"x":1} | Error: late"#);
    }
}

// Tool-calling loop
//
// Runs inference, executes the tool calls the model asked for, appends the
// results and runs inference again until the model stops calling tools or
// the iteration cap is hit.
//
// Design decisions:
// - The registry is attached to the RunContext for the duration of the run,
//   and the effective ToolConfig is recorded in Turn.data so providers can
//   advertise tools during request conversion.
// - Tool results are appended in call order regardless of completion order.
// - Failed calls become tool_use blocks carrying `Error: <msg>` and stay in
//   the Turn so the model can react on the next iteration.
// - Pauses only happen when the Turn carries a session id that the step
//   controller has enabled.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::blocks::{append_tool_results_blocks, extract_pending_tool_calls};
use super::step_controller::{
    deadline_after, PauseMeta, StepController, StepPhase, DEFAULT_PAUSE_TIMEOUT,
};
use crate::context::{phase, RunContext, SnapshotHook};
use crate::engine::Engine;
use crate::error::{InferenceError, Result};
use crate::events::Event;
use crate::tools::{
    DefaultToolExecutor, ToolCall, ToolConfig, ToolExecutor, ToolRegistry, ToolResult, TOOL_CONFIG,
};
use crate::turns::Turn;

const NO_REGISTRY: &str = "no tool registry in context";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub max_iterations: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

impl LoopConfig {
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Iteration cap with 0 read as the default
    pub fn effective_max_iterations(&self) -> usize {
        if self.max_iterations == 0 {
            LoopConfig::default().max_iterations
        } else {
            self.max_iterations
        }
    }
}

#[derive(Clone)]
pub struct ToolLoop {
    engine: Arc<dyn Engine>,
    registry: Option<Arc<ToolRegistry>>,
    loop_config: LoopConfig,
    tool_config: ToolConfig,
    executor: Option<Arc<dyn ToolExecutor>>,
    step_controller: Option<Arc<StepController>>,
    pause_timeout: Duration,
    snapshot_hook: Option<SnapshotHook>,
}

impl ToolLoop {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            registry: None,
            loop_config: LoopConfig::default(),
            tool_config: ToolConfig::default(),
            executor: None,
            step_controller: None,
            pause_timeout: DEFAULT_PAUSE_TIMEOUT,
            snapshot_hook: None,
        }
    }

    /// Registry to attach to the run context; without one the registry
    /// already in the context is used
    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn with_tool_config(mut self, config: ToolConfig) -> Self {
        self.tool_config = config;
        self
    }

    /// Executor override; defaults to a DefaultToolExecutor over the tool
    /// config
    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_step_controller(mut self, controller: Arc<StepController>) -> Self {
        self.step_controller = Some(controller);
        self
    }

    pub fn with_pause_timeout(mut self, timeout: Duration) -> Self {
        self.pause_timeout = timeout;
        self
    }

    /// Loop-level snapshot hook; takes precedence over the context hook
    pub fn with_snapshot_hook(mut self, hook: SnapshotHook) -> Self {
        self.snapshot_hook = Some(hook);
        self
    }

    pub fn tool_config(&self) -> &ToolConfig {
        &self.tool_config
    }

    pub fn loop_config(&self) -> &LoopConfig {
        &self.loop_config
    }

    fn snapshot(&self, ctx: &RunContext, turn: &Turn, phase: &str) {
        match &self.snapshot_hook {
            Some(hook) => hook(turn, phase),
            None => ctx.snapshot(turn, phase),
        }
    }

    /// Run until no tool calls are pending. Every failure carries the Turn
    /// as it stood (see [`InferenceError::partial_turn`]).
    pub async fn run(&self, ctx: &RunContext, mut turn: Turn) -> Result<Turn> {
        let ctx = match &self.registry {
            Some(registry) => ctx.clone().with_tool_registry(registry.clone()),
            None => ctx.clone(),
        };

        let max_iterations = self.loop_config.effective_max_iterations();
        let recorded = self.tool_config.clone().with_max_iterations(max_iterations);
        TOOL_CONFIG.set(&mut turn.data, &recorded)?;

        for iteration in 1..=max_iterations {
            if ctx.is_cancelled() {
                return Err(InferenceError::Cancelled.with_turn(turn));
            }
            debug!(iteration, turn_id = %turn.id, "toolloop: engine inference step");

            self.snapshot(&ctx, &turn, phase::PRE_INFERENCE);
            // The engine consumes the Turn; keep a copy for its failure path
            let before = turn.clone();
            let mut updated = match self.engine.run_inference(&ctx, turn).await {
                Ok(updated) => updated,
                Err(e) => return Err(e.with_turn(before)),
            };
            self.snapshot(&ctx, &updated, phase::POST_INFERENCE);

            let calls = extract_pending_tool_calls(&updated);
            if calls.is_empty() {
                debug!(iteration, turn_id = %updated.id, "toolloop: no pending tool calls");
                return Ok(updated);
            }
            debug!(iteration, pending = calls.len(), "toolloop: executing tool calls");

            let mut extra = Map::new();
            extra.insert("pending_tools".to_string(), json!(calls.len()));
            if let Err(e) = self
                .maybe_pause(&ctx, &updated, StepPhase::AfterInference, "Review next action", extra)
                .await
            {
                return Err(e.with_turn(updated));
            }

            let results = match self.execute_tools(&ctx, calls).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(iteration, turn_id = %updated.id, error = %e, "toolloop: tool execution failed");
                    return Err(e.with_turn(updated));
                }
            };
            append_tool_results_blocks(&mut updated, &results);
            self.snapshot(&ctx, &updated, phase::POST_TOOLS);

            if let Err(e) = self
                .maybe_pause(&ctx, &updated, StepPhase::AfterTools, "Review tool results", Map::new())
                .await
            {
                return Err(e.with_turn(updated));
            }

            turn = updated;
        }

        warn!(max_iterations, turn_id = %turn.id, "toolloop: maximum iterations reached");
        Err(InferenceError::MaxIterations {
            max: max_iterations,
            turn: Box::new(turn),
        })
    }

    async fn execute_tools(&self, ctx: &RunContext, calls: Vec<ToolCall>) -> Result<Vec<ToolResult>> {
        let Some(registry) = ctx.tool_registry() else {
            warn!(calls = calls.len(), "toolloop: no tool registry in context");
            return Ok(calls
                .iter()
                .map(|call| ToolResult::failure(&call.id, NO_REGISTRY))
                .collect());
        };

        match &self.executor {
            Some(executor) => executor.execute_tool_calls(ctx, calls, registry).await,
            None => {
                DefaultToolExecutor::new(self.tool_config.clone())
                    .execute_tool_calls(ctx, calls, registry)
                    .await
            }
        }
    }

    async fn maybe_pause(
        &self,
        ctx: &RunContext,
        turn: &Turn,
        phase: StepPhase,
        summary: &str,
        extra: Map<String, Value>,
    ) -> Result<()> {
        let Some(controller) = &self.step_controller else {
            return Ok(());
        };
        let Some(session_id) = turn.session_id().filter(|id| !id.is_empty()) else {
            return Ok(());
        };
        let Some(scope) = controller.is_enabled(&session_id) else {
            return Ok(());
        };

        let mut meta = PauseMeta::new(phase, session_id);
        meta.summary = summary.to_string();
        meta.deadline_ms = deadline_after(self.pause_timeout);
        meta.inference_id = turn.inference_id().unwrap_or_default();
        meta.turn_id = turn.id.clone();
        meta.scope = scope;
        meta.extra = extra;

        let (meta, registered) = controller.pause(meta);
        if !registered {
            return Ok(());
        }

        let mut event_meta = ctx
            .event_metadata()
            .with_session(meta.session_id.clone())
            .with_inference(meta.inference_id.clone())
            .with_turn(meta.turn_id.clone());
        if !meta.scope.conversation_id.is_empty() {
            event_meta = event_meta.with_extra(
                "conversation_id",
                Value::String(meta.scope.conversation_id.clone()),
            );
        }
        ctx.publish(&Event::debugger_pause(
            event_meta,
            meta.pause_id.clone(),
            meta.phase.as_str(),
            meta.summary.clone(),
            meta.deadline_ms,
            meta.extra.clone(),
        ))
        .await;

        info!(
            pause_id = %meta.pause_id,
            phase = %meta.phase,
            session_id = %meta.session_id,
            "toolloop: paused"
        );
        controller.wait(ctx, &meta.pause_id, self.pause_timeout).await
    }
}

impl std::fmt::Debug for ToolLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolLoop")
            .field("registry", &self.registry)
            .field("loop_config", &self.loop_config)
            .field("tool_config", &self.tool_config)
            .field("step_controller", &self.step_controller.is_some())
            .field("pause_timeout", &self.pause_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FnEngine;
    use crate::events::{event_type, CollectingSink, EventPayload};
    use crate::toolloop::step_controller::StepScope;
    use crate::tools::builtin::{echo_tool, failing_tool};
    use crate::tools::ToolErrorHandling;
    use crate::turns::keys::SESSION_ID;
    use crate::turns::{payload, Block, BlockKind};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Calls `echo` on the first inference, answers with text afterwards
    fn scripted_engine(calls: Arc<AtomicUsize>) -> Arc<dyn Engine> {
        Arc::new(FnEngine::new(move |_ctx, mut turn: Turn| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    turn.append_block(Block::tool_call("c1", "echo", json!({"message": "hi"})));
                } else {
                    turn.append_block(Block::llm_text("done"));
                }
                Ok(turn)
            }
        }))
    }

    fn always_calls_tools() -> Arc<dyn Engine> {
        let counter = Arc::new(AtomicUsize::new(0));
        Arc::new(FnEngine::new(move |_ctx, mut turn: Turn| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                turn.append_block(Block::tool_call(format!("c{n}"), "echo", json!({"message": "again"})));
                Ok(turn)
            }
        }))
    }

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::builder().tool(echo_tool()).build().unwrap())
    }

    #[tokio::test]
    async fn test_no_tool_calls_returns_after_one_inference() {
        let engine: Arc<dyn Engine> = Arc::new(FnEngine::new(|_ctx, mut turn: Turn| async move {
            turn.append_block(Block::llm_text("hello"));
            Ok(turn)
        }));
        let turn = ToolLoop::new(engine)
            .with_registry(registry())
            .run(&RunContext::new(), Turn::with_blocks([Block::user("hi")]))
            .await
            .unwrap();

        assert_eq!(turn.blocks.len(), 2);
        assert_eq!(turn.last_llm_text(), Some("hello"));
        assert!(TOOL_CONFIG.is_set(&turn.data));
    }

    #[tokio::test]
    async fn test_single_tool_roundtrip() {
        let calls = Arc::new(AtomicUsize::new(0));
        let phases = Arc::new(Mutex::new(Vec::new()));
        let seen = phases.clone();
        let ctx = RunContext::new().with_snapshot_hook(Arc::new(move |_t: &Turn, p: &str| {
            seen.lock().push(p.to_string());
        }));

        let turn = ToolLoop::new(scripted_engine(calls.clone()))
            .with_registry(registry())
            .run(&ctx, Turn::with_blocks([Block::user("say hi")]))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let kinds: Vec<_> = turn.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BlockKind::User, BlockKind::ToolCall, BlockKind::ToolUse, BlockKind::LlmText]
        );
        let result = turn.blocks[2].payload_str(payload::RESULT).unwrap();
        let parsed: Value = serde_json::from_str(result).unwrap();
        assert_eq!(parsed["echoed"], "hi");
        assert_eq!(
            *phases.lock(),
            vec!["pre_inference", "post_inference", "post_tools", "pre_inference", "post_inference"]
        );
    }

    #[tokio::test]
    async fn test_max_iterations_carries_turn() {
        let err = ToolLoop::new(always_calls_tools())
            .with_registry(registry())
            .with_loop_config(LoopConfig::default().with_max_iterations(2))
            .run(&RunContext::new(), Turn::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "max iterations (2) reached");
        let turn = err.partial_turn().unwrap();
        assert_eq!(turn.blocks_of_kind(BlockKind::ToolUse).count(), 2);
    }

    #[tokio::test]
    async fn test_missing_registry_records_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let turn = ToolLoop::new(scripted_engine(calls))
            .run(&RunContext::new(), Turn::new())
            .await
            .unwrap();

        let tool_use = turn.last_block_of_kind(BlockKind::ToolUse).unwrap();
        assert_eq!(
            tool_use.payload_str(payload::RESULT),
            Some("Error: no tool registry in context")
        );
    }

    #[tokio::test]
    async fn test_registry_from_context() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = RunContext::new().with_tool_registry(registry());
        let turn = ToolLoop::new(scripted_engine(calls))
            .run(&ctx, Turn::new())
            .await
            .unwrap();
        let tool_use = turn.last_block_of_kind(BlockKind::ToolUse).unwrap();
        assert!(!tool_use.payload.contains_key(payload::ERROR));
    }

    /// Asks for two calls of `tool`, cancelling the run first when `cancel`
    fn two_calls_engine(tool: &'static str, cancel: bool) -> Arc<dyn Engine> {
        Arc::new(FnEngine::new(move |ctx: RunContext, mut turn: Turn| async move {
            turn.append_block(Block::tool_call("c1", tool, json!({"message": "one"})));
            turn.append_block(Block::tool_call("c2", tool, json!({"message": "two"})));
            if cancel {
                ctx.cancel();
            }
            Ok(turn)
        }))
    }

    #[tokio::test]
    async fn test_cancel_during_tools_keeps_tool_calls() {
        let err = ToolLoop::new(two_calls_engine("echo", true))
            .with_registry(registry())
            .run(&RunContext::new(), Turn::with_blocks([Block::user("hi")]))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        let turn = err.partial_turn().unwrap();
        assert_eq!(turn.blocks_of_kind(BlockKind::ToolCall).count(), 2);
        assert_eq!(turn.blocks_of_kind(BlockKind::ToolUse).count(), 0);
        assert!(TOOL_CONFIG.is_set(&turn.data));
    }

    #[tokio::test]
    async fn test_abort_keeps_tool_calls() {
        let registry = Arc::new(
            ToolRegistry::builder()
                .tool(failing_tool("boom"))
                .build()
                .unwrap(),
        );
        let err = ToolLoop::new(two_calls_engine("fail", false))
            .with_registry(registry)
            .with_tool_config(
                ToolConfig::default()
                    .with_error_handling(ToolErrorHandling::Abort)
                    .with_max_parallel_tools(1),
            )
            .run(&RunContext::new(), Turn::new())
            .await
            .unwrap_err();

        assert!(matches!(err.root(), InferenceError::ToolAborted { name, .. } if name == "fail"));
        assert_eq!(
            err.to_string(),
            "tool execution aborted due to error in fail: boom"
        );
        let turn = err.partial_turn().unwrap();
        assert_eq!(turn.blocks_of_kind(BlockKind::ToolCall).count(), 2);
    }

    #[tokio::test]
    async fn test_engine_failure_keeps_previous_iterations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let engine: Arc<dyn Engine> = Arc::new(FnEngine::new(move |_ctx, mut turn: Turn| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n > 0 {
                    return Err(InferenceError::engine("http 500"));
                }
                turn.append_block(Block::tool_call("c1", "echo", json!({"message": "hi"})));
                Ok(turn)
            }
        }));
        let err = ToolLoop::new(engine)
            .with_registry(registry())
            .run(&RunContext::new(), Turn::new())
            .await
            .unwrap_err();

        assert!(matches!(err.root(), InferenceError::Engine(_)));
        let turn = err.partial_turn().unwrap();
        assert_eq!(turn.blocks_of_kind(BlockKind::ToolUse).count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_context_stops() {
        let ctx = RunContext::new();
        ctx.cancel();
        let err = ToolLoop::new(always_calls_tools())
            .run(&ctx, Turn::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_step_mode_pauses_and_continues() {
        let controller = Arc::new(StepController::new());
        controller.enable(StepScope::new("s1").with_conversation("conv"));
        let sink = CollectingSink::new();
        let ctx = RunContext::new().with_event_sink(Arc::new(sink.clone()));

        let mut turn = Turn::with_blocks([Block::user("hi")]);
        SESSION_ID.set(&mut turn.metadata, &"s1".to_string()).unwrap();

        let tool_loop = ToolLoop::new(scripted_engine(Arc::new(AtomicUsize::new(0))))
            .with_registry(registry())
            .with_step_controller(controller.clone());
        let run = tokio::spawn(async move { tool_loop.run(&ctx, turn).await });

        // release pauses as they appear
        let mut released = Vec::new();
        while released.len() < 2 {
            if let Some(meta) = controller.pending("s1").into_iter().next() {
                controller.continue_pause(&meta.pause_id);
                released.push(meta.phase);
            }
            tokio::task::yield_now().await;
        }

        let turn = run.await.unwrap().unwrap();
        assert_eq!(turn.last_llm_text(), Some("done"));
        assert_eq!(released, vec![StepPhase::AfterInference, StepPhase::AfterTools]);

        let pauses: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| e.event_type() == event_type::DEBUGGER_PAUSE)
            .collect();
        assert_eq!(pauses.len(), 2);
        assert_eq!(pauses[0].metadata.session_id, "s1");
        assert_eq!(pauses[0].metadata.extra["conversation_id"], "conv");
        match &pauses[0].payload {
            EventPayload::DebuggerPause { summary, extra, .. } => {
                assert_eq!(summary, "Review next action");
                assert_eq!(extra["pending_tools"], 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_timeout_auto_continues() {
        let controller = Arc::new(StepController::new());
        controller.enable(StepScope::new("s1"));
        let mut turn = Turn::new();
        SESSION_ID.set(&mut turn.metadata, &"s1".to_string()).unwrap();

        let turn = ToolLoop::new(scripted_engine(Arc::new(AtomicUsize::new(0))))
            .with_registry(registry())
            .with_step_controller(controller.clone())
            .with_pause_timeout(Duration::from_millis(100))
            .run(&RunContext::new(), turn)
            .await
            .unwrap();

        assert_eq!(turn.last_llm_text(), Some("done"));
        assert!(controller.pending("s1").is_empty());
    }

    #[tokio::test]
    async fn test_unenabled_session_never_pauses() {
        let controller = Arc::new(StepController::new());
        let mut turn = Turn::new();
        SESSION_ID.set(&mut turn.metadata, &"s1".to_string()).unwrap();

        let turn = ToolLoop::new(scripted_engine(Arc::new(AtomicUsize::new(0))))
            .with_registry(registry())
            .with_step_controller(controller)
            .with_pause_timeout(Duration::from_secs(3600))
            .run(&RunContext::new(), turn)
            .await
            .unwrap();
        assert_eq!(turn.last_llm_text(), Some("done"));
    }
}

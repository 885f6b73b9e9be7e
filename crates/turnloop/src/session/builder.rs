// Engine builders and runners
//
// A Session does not hold an engine directly. For every run it asks its
// EngineBuilder for an InferenceRunner, so per-session wiring (sinks,
// registry, persistence) is decided at start time.
//
// ToolLoopEngineBuilder is the stock builder: base engine, optional
// middleware chain, optional tool registry (which switches the runner into
// the tool-calling loop), event sinks, snapshot hook, step controller and a
// persister called after successful runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::context::{RunContext, SnapshotHook};
use crate::engine::{Engine, EngineWithMiddleware, Middleware};
use crate::error::{InferenceError, Result};
use crate::events::EventSink;
use crate::toolloop::{LoopConfig, StepController, ToolLoop, DEFAULT_PAUSE_TIMEOUT};
use crate::tools::{ToolConfig, ToolExecutor, ToolRegistry};
use crate::turns::keys::SESSION_ID;
use crate::turns::Turn;

/// Runs one inference for a session
#[async_trait]
pub trait InferenceRunner: Send + Sync {
    async fn run_inference(&self, ctx: &RunContext, turn: Turn) -> Result<Turn>;
}

/// Produces a runner per run
#[async_trait]
pub trait EngineBuilder: Send + Sync {
    async fn build(&self, ctx: &RunContext, session_id: &str) -> Result<Arc<dyn InferenceRunner>>;
}

/// Stores Turns after successful runs
#[async_trait]
pub trait TurnPersister: Send + Sync {
    async fn persist_turn(&self, ctx: &RunContext, turn: &Turn) -> Result<()>;
}

// ============================================================================
// ToolLoopEngineBuilder
// ============================================================================

#[derive(Clone)]
pub struct ToolLoopEngineBuilder {
    base: Option<Arc<dyn Engine>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    registry: Option<Arc<ToolRegistry>>,
    tool_config: ToolConfig,
    executor: Option<Arc<dyn ToolExecutor>>,
    event_sinks: Vec<Arc<dyn EventSink>>,
    snapshot_hook: Option<SnapshotHook>,
    step_controller: Option<Arc<StepController>>,
    pause_timeout: Duration,
    persister: Option<Arc<dyn TurnPersister>>,
}

impl Default for ToolLoopEngineBuilder {
    fn default() -> Self {
        Self {
            base: None,
            middlewares: Vec::new(),
            registry: None,
            tool_config: ToolConfig::default(),
            executor: None,
            event_sinks: Vec::new(),
            snapshot_hook: None,
            step_controller: None,
            pause_timeout: DEFAULT_PAUSE_TIMEOUT,
            persister: None,
        }
    }
}

impl ToolLoopEngineBuilder {
    pub fn new(base: Arc<dyn Engine>) -> Self {
        Self {
            base: Some(base),
            ..Self::default()
        }
    }

    pub fn with_base(mut self, base: Arc<dyn Engine>) -> Self {
        self.base = Some(base);
        self
    }

    /// Middlewares in chain order, first entry outermost
    pub fn with_middlewares(mut self, middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>) -> Self {
        self.middlewares.extend(middlewares);
        self
    }

    pub fn with_middleware(self, middleware: Arc<dyn Middleware>) -> Self {
        self.with_middlewares([middleware])
    }

    /// Enables the tool-calling loop
    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Tool config; its `max_iterations` also caps the loop
    pub fn with_tool_config(mut self, config: ToolConfig) -> Self {
        self.tool_config = config;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_event_sinks(mut self, sinks: impl IntoIterator<Item = Arc<dyn EventSink>>) -> Self {
        self.event_sinks.extend(sinks);
        self
    }

    pub fn with_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        self.with_event_sinks([sink])
    }

    pub fn with_snapshot_hook(mut self, hook: SnapshotHook) -> Self {
        self.snapshot_hook = Some(hook);
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

    pub fn with_persister(mut self, persister: Arc<dyn TurnPersister>) -> Self {
        self.persister = Some(persister);
        self
    }
}

#[async_trait]
impl EngineBuilder for ToolLoopEngineBuilder {
    async fn build(&self, _ctx: &RunContext, session_id: &str) -> Result<Arc<dyn InferenceRunner>> {
        let base = self.base.clone().ok_or(InferenceError::BaseEngineMissing)?;
        let engine: Arc<dyn Engine> = if self.middlewares.is_empty() {
            base
        } else {
            Arc::new(EngineWithMiddleware::new(base, &self.middlewares))
        };

        let tool_loop = self.registry.as_ref().map(|registry| {
            let mut tool_loop = ToolLoop::new(engine.clone())
                .with_registry(registry.clone())
                .with_tool_config(self.tool_config.clone())
                .with_loop_config(LoopConfig::default().with_max_iterations(self.tool_config.max_iterations))
                .with_pause_timeout(self.pause_timeout);
            if let Some(executor) = &self.executor {
                tool_loop = tool_loop.with_executor(executor.clone());
            }
            if let Some(controller) = &self.step_controller {
                tool_loop = tool_loop.with_step_controller(controller.clone());
            }
            tool_loop
        });

        Ok(Arc::new(ToolLoopRunner {
            session_id: session_id.to_string(),
            engine,
            tool_loop,
            event_sinks: self.event_sinks.clone(),
            snapshot_hook: self.snapshot_hook.clone(),
            persister: self.persister.clone(),
        }))
    }
}

impl std::fmt::Debug for ToolLoopEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolLoopEngineBuilder")
            .field("has_base", &self.base.is_some())
            .field("middlewares", &self.middlewares.len())
            .field("registry", &self.registry)
            .field("tool_config", &self.tool_config)
            .field("event_sinks", &self.event_sinks.len())
            .field("has_persister", &self.persister.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ToolLoopRunner
// ============================================================================

struct ToolLoopRunner {
    session_id: String,
    engine: Arc<dyn Engine>,
    tool_loop: Option<ToolLoop>,
    event_sinks: Vec<Arc<dyn EventSink>>,
    snapshot_hook: Option<SnapshotHook>,
    persister: Option<Arc<dyn TurnPersister>>,
}

impl ToolLoopRunner {
    fn stamp_session(&self, turn: &mut Turn) -> Result<()> {
        if !self.session_id.is_empty() && turn.session_id().is_none() {
            SESSION_ID.set(&mut turn.metadata, &self.session_id)?;
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceRunner for ToolLoopRunner {
    async fn run_inference(&self, ctx: &RunContext, mut turn: Turn) -> Result<Turn> {
        let mut run_ctx = ctx.clone().with_event_sinks(self.event_sinks.iter().cloned());
        if let Some(hook) = &self.snapshot_hook {
            run_ctx = run_ctx.with_snapshot_hook(hook.clone());
        }
        self.stamp_session(&mut turn)?;

        info!(
            session_id = %self.session_id,
            inference_id = %run_ctx.inference_id().unwrap_or_default(),
            turn_id = %turn.id,
            tools = self.tool_loop.is_some(),
            "Starting inference run"
        );

        let outcome = match &self.tool_loop {
            Some(tool_loop) => tool_loop.run(&run_ctx, turn).await,
            None => self.engine.run_inference(&run_ctx, turn).await,
        };
        let mut updated = outcome?;
        self.stamp_session(&mut updated)?;

        if let Some(persister) = &self.persister {
            if let Err(e) = persister.persist_turn(&run_ctx, &updated).await {
                warn!(session_id = %self.session_id, turn_id = %updated.id, error = %e, "Failed to persist turn");
            }
        }

        info!(
            session_id = %self.session_id,
            turn_id = %updated.id,
            blocks = updated.blocks.len(),
            "Inference run finished"
        );
        Ok(updated)
    }
}

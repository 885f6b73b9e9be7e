// Middleware chain
//
// A handler is `(ctx, Turn) -> Result<Turn>`; a middleware wraps one handler
// into another. `chain(base, [m1, m2, m3])` builds `m1(m2(m3(base)))`, so the
// first middleware sees the call first on the way in and last on the way out.
//
// Middlewares may rewrite the Turn, append blocks, annotate metadata or
// return without calling `next`. They own the Turn only for the duration of
// the call.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::Engine;
use crate::context::RunContext;
use crate::error::Result;
use crate::turns::Turn;

pub mod logging;
pub mod reorder;
pub mod system_prompt;

pub use logging::TurnLoggingMiddleware;
pub use reorder::ToolResultReorderMiddleware;
pub use system_prompt::SystemPromptMiddleware;

pub type HandlerFunc = Arc<dyn Fn(RunContext, Turn) -> BoxFuture<'static, Result<Turn>> + Send + Sync>;

pub trait Middleware: Send + Sync {
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc;
}

impl<F> Middleware for F
where
    F: Fn(HandlerFunc) -> HandlerFunc + Send + Sync,
{
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc {
        self(next)
    }
}

/// Box a closure middleware
pub fn middleware_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(HandlerFunc) -> HandlerFunc + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Compose `middlewares` around `handler`, first entry outermost
pub fn chain(handler: HandlerFunc, middlewares: &[Arc<dyn Middleware>]) -> HandlerFunc {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware.wrap(next))
}

/// Handler that calls `engine` directly
pub fn engine_handler(engine: Arc<dyn Engine>) -> HandlerFunc {
    Arc::new(move |ctx: RunContext, turn: Turn| -> BoxFuture<'static, Result<Turn>> {
        let engine = engine.clone();
        Box::pin(async move { engine.run_inference(&ctx, turn).await })
    })
}

/// An engine wrapped by a middleware chain; itself an Engine
#[derive(Clone)]
pub struct EngineWithMiddleware {
    handler: HandlerFunc,
}

impl EngineWithMiddleware {
    pub fn new(engine: Arc<dyn Engine>, middlewares: &[Arc<dyn Middleware>]) -> Self {
        Self {
            handler: chain(engine_handler(engine), middlewares),
        }
    }

    pub fn handler(&self) -> &HandlerFunc {
        &self.handler
    }
}

#[async_trait]
impl Engine for EngineWithMiddleware {
    async fn run_inference(&self, ctx: &RunContext, turn: Turn) -> Result<Turn> {
        (self.handler)(ctx.clone(), turn).await
    }
}

impl std::fmt::Debug for EngineWithMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineWithMiddleware").finish_non_exhaustive()
    }
}

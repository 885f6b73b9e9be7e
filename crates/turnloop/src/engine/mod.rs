// Engine abstraction
//
// An Engine turns one Turn into an updated Turn. Provider adapters implement
// it outside this crate; everything here (middleware, tool loop, sessions)
// only sees the trait. Engines may stream events through the RunContext
// sinks but always return the complete Turn on success.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::Result;
use crate::turns::Turn;

pub mod inference_config;
pub mod middleware;

pub use inference_config::{
    InferenceConfig, StructuredOutputConfig, StructuredOutputMode, INFERENCE_CONFIG,
    STRUCTURED_OUTPUT,
};
pub use middleware::{
    chain, engine_handler, middleware_fn, EngineWithMiddleware, HandlerFunc, Middleware,
};

/// Single-call inference over a Turn
///
/// Implementations must honour `ctx` cancellation and return
/// `InferenceError::Cancelled` when it fires.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn run_inference(&self, ctx: &RunContext, turn: Turn) -> Result<Turn>;
}

#[async_trait]
impl<E: Engine + ?Sized> Engine for Arc<E> {
    async fn run_inference(&self, ctx: &RunContext, turn: Turn) -> Result<Turn> {
        (**self).run_inference(ctx, turn).await
    }
}

/// Engine backed by a closure (scripted engines, adapters)
pub struct FnEngine<F>(F);

impl<F, Fut> FnEngine<F>
where
    F: Fn(RunContext, Turn) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Turn>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Engine for FnEngine<F>
where
    F: Fn(RunContext, Turn) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Turn>> + Send,
{
    async fn run_inference(&self, ctx: &RunContext, turn: Turn) -> Result<Turn> {
        (self.0)(ctx.clone(), turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turns::Block;

    #[tokio::test]
    async fn test_fn_engine_appends() {
        let engine = FnEngine::new(|_ctx, mut turn: Turn| async move {
            turn.append_block(Block::llm_text("hello"));
            Ok(turn)
        });

        let turn = engine
            .run_inference(&RunContext::new(), Turn::new())
            .await
            .unwrap();
        assert_eq!(turn.last_llm_text(), Some("hello"));

        let shared: Arc<dyn Engine> = Arc::new(engine);
        let turn = shared.run_inference(&RunContext::new(), turn).await.unwrap();
        assert_eq!(turn.blocks.len(), 2);
    }
}

// Turn logging middleware
//
// Structured log lines around the wrapped call: block count on the way in,
// block count delta, per-kind counts and duration on the way out, the error
// on failure.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{error, info};

use super::{HandlerFunc, Middleware};
use crate::context::RunContext;
use crate::error::Result;
use crate::turns::Turn;

#[derive(Debug, Clone, Copy, Default)]
pub struct TurnLoggingMiddleware;

impl TurnLoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

/// `user=1 llm_text=2 ...` in first-seen order
pub fn format_kind_counts(turn: &Turn) -> String {
    turn.kind_counts()
        .into_iter()
        .map(|(kind, n)| format!("{}={n}", kind.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Middleware for TurnLoggingMiddleware {
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc {
        Arc::new(move |ctx: RunContext, turn: Turn| -> BoxFuture<'static, Result<Turn>> {
            let next = next.clone();
            Box::pin(async move {
                let turn_id = turn.id.clone();
                let session_id = ctx.session_id().unwrap_or_default().to_string();
                let inference_id = ctx.inference_id().unwrap_or_default().to_string();
                let block_count = turn.blocks.len();
                let started = Instant::now();

                info!(
                    session_id = %session_id,
                    inference_id = %inference_id,
                    turn_id = %turn_id,
                    block_count,
                    "turn: starting inference"
                );

                match next(ctx, turn).await {
                    Ok(result) => {
                        info!(
                            session_id = %session_id,
                            inference_id = %inference_id,
                            turn_id = %turn_id,
                            block_count,
                            result_block_count = result.blocks.len(),
                            block_delta = result.blocks.len() as i64 - block_count as i64,
                            kinds = %format_kind_counts(&result),
                            duration_ms = started.elapsed().as_millis() as u64,
                            "turn: inference completed"
                        );
                        Ok(result)
                    }
                    Err(e) => {
                        error!(
                            session_id = %session_id,
                            inference_id = %inference_id,
                            turn_id = %turn_id,
                            duration_ms = started.elapsed().as_millis() as u64,
                            error = %e,
                            "turn: inference failed"
                        );
                        Err(e)
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineWithMiddleware, FnEngine};
    use crate::error::InferenceError;
    use crate::turns::Block;

    #[test]
    fn test_format_kind_counts() {
        let turn = Turn::with_blocks([
            Block::user("a"),
            Block::llm_text("b"),
            Block::llm_text("c"),
        ]);
        assert_eq!(format_kind_counts(&turn), "user=1 llm_text=2");
    }

    #[tokio::test]
    async fn test_passes_result_and_error_through() {
        let ok = EngineWithMiddleware::new(
            Arc::new(FnEngine::new(|_ctx, mut turn: Turn| async move {
                turn.append_block(Block::llm_text("x"));
                Ok(turn)
            })),
            &[Arc::new(TurnLoggingMiddleware::new()) as Arc<dyn Middleware>],
        );
        let turn = ok.run_inference(&RunContext::new(), Turn::new()).await.unwrap();
        assert_eq!(turn.blocks.len(), 1);

        let failing = EngineWithMiddleware::new(
            Arc::new(FnEngine::new(|_ctx, _turn: Turn| async move {
                Err(InferenceError::engine("provider down"))
            })),
            &[Arc::new(TurnLoggingMiddleware::new()) as Arc<dyn Middleware>],
        );
        let err = failing
            .run_inference(&RunContext::new(), Turn::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "engine error: provider down");
    }
}

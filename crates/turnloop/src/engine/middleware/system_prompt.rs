// System prompt middleware
//
// Ensures the Turn carries the configured system prompt: the first system
// block found is rewritten when its text differs, otherwise a new system
// block is inserted at the front. Blocks touched here are tagged with the
// `middleware` block metadata key.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use super::{HandlerFunc, Middleware};
use crate::context::RunContext;
use crate::error::{KeyError, Result};
use crate::turns::keys::MIDDLEWARE;
use crate::turns::{payload, Block, BlockKind, Turn};

const MIDDLEWARE_NAME: &str = "systemprompt";
const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct SystemPromptMiddleware {
    prompt: Arc<str>,
}

impl SystemPromptMiddleware {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Arc::from(prompt.into()),
        }
    }

    /// Apply the prompt to `turn` in place. An empty prompt leaves the Turn
    /// untouched.
    pub fn apply(&self, turn: &mut Turn) -> std::result::Result<(), KeyError> {
        let prompt = self.prompt.as_ref();
        if prompt.is_empty() {
            return Ok(());
        }
        debug!(
            turn_id = %turn.id,
            block_count = turn.blocks.len(),
            prompt_len = prompt.len(),
            prompt_preview = %preview(prompt),
            "systemprompt: middleware start"
        );

        let existing = turn
            .blocks
            .iter_mut()
            .enumerate()
            .find(|(_, b)| b.is_kind(BlockKind::System));

        match existing {
            Some((idx, block)) if block.text() == Some(prompt) => {
                debug!(turn_id = %turn.id, system_idx = idx, "systemprompt: prompt already set");
            }
            Some((idx, block)) => {
                block
                    .payload
                    .insert(payload::TEXT.to_string(), Value::String(prompt.to_string()));
                MIDDLEWARE.set(&mut block.metadata, &MIDDLEWARE_NAME.to_string())?;
                debug!(turn_id = %turn.id, system_idx = idx, "systemprompt: replaced text on existing system block");
            }
            None => {
                let mut block = Block::system(prompt);
                MIDDLEWARE.set(&mut block.metadata, &MIDDLEWARE_NAME.to_string())?;
                turn.prepend_block(block);
                debug!(turn_id = %turn.id, "systemprompt: inserted system block at beginning");
            }
        }
        Ok(())
    }
}

impl Middleware for SystemPromptMiddleware {
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc {
        let this = self.clone();
        Arc::new(move |ctx: RunContext, mut turn: Turn| -> BoxFuture<'static, Result<Turn>> {
            let next = next.clone();
            let this = this.clone();
            Box::pin(async move {
                this.apply(&mut turn)?;
                next(ctx, turn).await
            })
        })
    }
}

fn preview(prompt: &str) -> String {
    if prompt.chars().count() <= PREVIEW_CHARS {
        return prompt.to_string();
    }
    let mut out: String = prompt.chars().take(PREVIEW_CHARS).collect();
    out.push('…');
    out
}

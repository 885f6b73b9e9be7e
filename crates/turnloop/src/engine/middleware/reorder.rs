// Tool result reorder middleware
//
// Some providers require every tool_use block to follow its tool_call
// directly. For each run of consecutive tool_call blocks, the matching
// tool_use blocks found later in the Turn are pulled up behind the run, in
// call order. Everything else keeps its relative position.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use super::{HandlerFunc, Middleware};
use crate::context::RunContext;
use crate::error::Result;
use crate::turns::{Block, BlockKind, Turn};

#[derive(Debug, Clone, Copy, Default)]
pub struct ToolResultReorderMiddleware;

impl ToolResultReorderMiddleware {
    pub fn new() -> Self {
        Self
    }
}

/// New block order as indices into `blocks`, or `None` when already ordered
pub fn tool_adjacent_order(blocks: &[Block]) -> Option<Vec<usize>> {
    let n = blocks.len();
    let mut moved = vec![false; n];
    let mut order = Vec::with_capacity(n);

    let mut i = 0;
    while i < n {
        if moved[i] {
            i += 1;
            continue;
        }
        if !blocks[i].is_kind(BlockKind::ToolCall) {
            order.push(i);
            i += 1;
            continue;
        }

        let run_start = i;
        let mut call_ids = Vec::new();
        while i < n && blocks[i].is_kind(BlockKind::ToolCall) {
            order.push(i);
            if let Some(id) = blocks[i].tool_id().filter(|id| !id.is_empty()) {
                call_ids.push(id);
            }
            i += 1;
        }

        let mut moved_for_run = 0;
        for id in call_ids {
            for j in i..n {
                if !moved[j] && blocks[j].is_kind(BlockKind::ToolUse) && blocks[j].tool_id() == Some(id) {
                    order.push(j);
                    moved[j] = true;
                    moved_for_run += 1;
                }
            }
        }
        if moved_for_run > 0 {
            debug!(moved_tool_use = moved_for_run, start = run_start, "tool-reorder: grouped tool_use after tool_call run");
        }
    }

    let changed = order.iter().enumerate().any(|(pos, &idx)| pos != idx);
    changed.then_some(order)
}

/// Reorder `turn` in place; returns whether anything moved
pub fn reorder_tool_results(turn: &mut Turn) -> bool {
    let Some(order) = tool_adjacent_order(&turn.blocks) else {
        return false;
    };
    let mut slots: Vec<Option<Block>> = std::mem::take(&mut turn.blocks)
        .into_iter()
        .map(Some)
        .collect();
    turn.blocks = order.into_iter().filter_map(|idx| slots[idx].take()).collect();
    debug!(turn_id = %turn.id, "tool-reorder: applied block reordering to satisfy tool adjacency");
    true
}

impl Middleware for ToolResultReorderMiddleware {
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc {
        Arc::new(move |ctx: RunContext, mut turn: Turn| -> BoxFuture<'static, Result<Turn>> {
            let next = next.clone();
            Box::pin(async move {
                reorder_tool_results(&mut turn);
                next(ctx, turn).await
            })
        })
    }
}

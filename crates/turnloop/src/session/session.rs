// Session - a conversation of Turns with at most one active inference
//
// Design decisions:
// - Turns live behind a parking_lot Mutex; the lock is never held across an
//   await point.
// - start_inference runs on the latest Turn and returns immediately with an
//   ExecutionHandle; a spawned task drives the run.
// - On success the result replaces the input Turn in place, so the history
//   keeps one entry per user prompt. A failure that carries a partial Turn
//   writes that Turn back; other failures leave the history untouched.
// - Run ids are stamped on the history Turn only once the runner is built.
// - The result is published and the active slot cleared under one lock, so
//   a woken waiter can start the next run right away and no two handles
//   ever look active.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::builder::EngineBuilder;
use super::execution::ExecutionHandle;
use crate::context::RunContext;
use crate::error::{InferenceError, Result};
use crate::turns::keys::{INFERENCE_ID, SESSION_ID};
use crate::turns::{Block, Turn};

#[derive(Default)]
struct SessionState {
    turns: Vec<Turn>,
    active: Option<Arc<ExecutionHandle>>,
}

#[derive(Clone)]
pub struct Session {
    session_id: String,
    builder: Option<Arc<dyn EngineBuilder>>,
    state: Arc<Mutex<SessionState>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Session with a fresh UUID v4 id
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            builder: None,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn EngineBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    /// Append a Turn, stamping the run id and session id when unset
    pub fn append(&self, mut turn: Turn) -> Result<()> {
        self.stamp(&mut turn)?;
        self.state.lock().turns.push(turn);
        Ok(())
    }

    /// Copy of the most recent Turn
    pub fn latest(&self) -> Option<Turn> {
        self.state.lock().turns.last().cloned()
    }

    /// Copy of the whole history
    pub fn turns(&self) -> Vec<Turn> {
        self.state.lock().turns.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().turns.is_empty()
    }

    /// Append a Turn that continues the conversation with one user prompt
    pub fn append_new_turn_from_user_prompt(&self, prompt: &str) -> Result<Turn> {
        self.append_new_turn_from_user_prompts([prompt])
    }

    /// New Turn seeded from a copy of the latest Turn (or empty) plus one
    /// user block per non-empty prompt. Rejected while a run is active.
    pub fn append_new_turn_from_user_prompts<'a>(
        &self,
        prompts: impl IntoIterator<Item = &'a str>,
    ) -> Result<Turn> {
        let mut state = self.state.lock();
        if state.active.is_some() {
            return Err(InferenceError::SessionAlreadyActive);
        }

        let mut turn = state.turns.last().cloned().unwrap_or_default();
        turn.id = Uuid::new_v4().to_string();
        turn.append_blocks(
            prompts
                .into_iter()
                .filter(|p| !p.is_empty())
                .map(Block::user),
        );
        self.stamp(&mut turn)?;
        state.turns.push(turn.clone());
        Ok(turn)
    }

    fn stamp(&self, turn: &mut Turn) -> Result<()> {
        if turn.run_id.is_empty() {
            turn.run_id = self.session_id.clone();
        }
        if !self.session_id.is_empty() && !SESSION_ID.is_set(&turn.metadata) {
            SESSION_ID.set(&mut turn.metadata, &self.session_id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Inference
    // ------------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Handle of the in-flight run, if any
    pub fn active(&self) -> Option<Arc<ExecutionHandle>> {
        self.state.lock().active.clone()
    }

    /// Cancel the in-flight run
    pub fn cancel_active(&self) -> Result<()> {
        let active = self.state.lock().active.clone();
        match active {
            Some(handle) => {
                info!(session_id = %self.session_id, inference_id = %handle.inference_id(), "Cancelling active inference");
                handle.cancel();
                Ok(())
            }
            None => Err(InferenceError::SessionNoActive),
        }
    }

    /// Start an inference on the latest Turn.
    ///
    /// Fails fast when the session has no id or builder, when a run is
    /// already active, or when there is no non-empty Turn to run on.
    pub async fn start_inference(&self, ctx: &RunContext) -> Result<Arc<ExecutionHandle>> {
        if self.session_id.is_empty() {
            return Err(InferenceError::SessionIdEmpty);
        }
        let builder = self.builder.clone().ok_or(InferenceError::BuilderMissing)?;

        let inference_id = Uuid::new_v4().to_string();
        let (mut input, index) = {
            let state = self.state.lock();
            if state.active.is_some() {
                return Err(InferenceError::SessionAlreadyActive);
            }
            let index = state
                .turns
                .len()
                .checked_sub(1)
                .ok_or(InferenceError::SessionEmptyTurn)?;
            let turn = &state.turns[index];
            if turn.is_empty() {
                return Err(InferenceError::SessionEmptyTurn);
            }
            (turn.clone(), index)
        };
        let turn_id = if input.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            input.id.clone()
        };
        stamp_run(&mut input, &turn_id, &self.session_id, &inference_id)?;

        let runner = builder.build(ctx, &self.session_id).await?;
        let run_ctx = ctx
            .child()
            .with_session_meta(self.session_id.clone(), inference_id.clone());

        let handle = Arc::new(ExecutionHandle::new(
            self.session_id.clone(),
            inference_id.clone(),
            input.clone(),
            run_ctx.cancellation_token().clone(),
        ));
        {
            let mut state = self.state.lock();
            if state.active.is_some() {
                return Err(InferenceError::SessionAlreadyActive);
            }
            if let Some(slot) = state.turns.get_mut(index) {
                stamp_run(slot, &turn_id, &self.session_id, &inference_id)?;
            }
            state.active = Some(handle.clone());
        }

        info!(
            session_id = %self.session_id,
            inference_id = %inference_id,
            turn_id = %input.id,
            "Inference started"
        );

        let run = tokio::spawn({
            let run_ctx = run_ctx.clone();
            async move { runner.run_inference(&run_ctx, input).await }
        });

        let state = self.state.clone();
        let session_id = self.session_id.clone();
        let supervised = handle.clone();
        tokio::spawn(async move {
            let outcome = match run.await {
                Ok(result) => result,
                Err(e) => {
                    error!(session_id = %session_id, inference_id = %inference_id, error = %e, "Inference task failed");
                    Err(InferenceError::Join(e.to_string()))
                }
            };

            let mut state = state.lock();
            let outcome = match outcome {
                Ok(mut turn) => {
                    finalize_turn(&mut turn, &state.turns, index, &session_id, &inference_id)
                        .map(|()| {
                            if let Some(slot) = state.turns.get_mut(index) {
                                *slot = turn.clone();
                            }
                            turn
                        })
                }
                Err(err) => {
                    if let Some(partial) = err.partial_turn() {
                        let mut partial = partial.clone();
                        match finalize_turn(&mut partial, &state.turns, index, &session_id, &inference_id) {
                            Ok(()) => {
                                if let Some(slot) = state.turns.get_mut(index) {
                                    *slot = partial;
                                }
                            }
                            Err(e) => {
                                warn!(session_id = %session_id, inference_id = %inference_id, error = %e, "Failed to keep partial turn")
                            }
                        }
                    }
                    Err(err)
                }
            };

            match &outcome {
                Ok(turn) => info!(
                    session_id = %session_id,
                    inference_id = %inference_id,
                    blocks = turn.blocks.len(),
                    "Inference completed"
                ),
                Err(e) if e.is_cancelled() => {
                    debug!(session_id = %session_id, inference_id = %inference_id, "Inference cancelled")
                }
                Err(e) => {
                    error!(session_id = %session_id, inference_id = %inference_id, error = %e, "Inference failed")
                }
            }

            supervised.set_result(outcome);
            if state
                .active
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, &supervised))
            {
                state.active = None;
            }
        });

        Ok(handle)
    }
}

/// Stamp run identity; `turn_id` fills an empty Turn id
fn stamp_run(turn: &mut Turn, turn_id: &str, session_id: &str, inference_id: &str) -> Result<()> {
    if turn.id.is_empty() {
        turn.id = turn_id.to_string();
    }
    if turn.run_id.is_empty() {
        turn.run_id = session_id.to_string();
    }
    SESSION_ID.set(&mut turn.metadata, &session_id.to_string())?;
    INFERENCE_ID.set(&mut turn.metadata, &inference_id.to_string())?;
    Ok(())
}

/// Keep the input Turn's identity on the result
fn finalize_turn(
    turn: &mut Turn,
    history: &[Turn],
    index: usize,
    session_id: &str,
    inference_id: &str,
) -> Result<()> {
    if let Some(original) = history.get(index) {
        if turn.id.is_empty() {
            turn.id = original.id.clone();
        }
        if turn.run_id.is_empty() {
            turn.run_id = original.run_id.clone();
        }
    }
    if !SESSION_ID.is_set(&turn.metadata) {
        SESSION_ID.set(&mut turn.metadata, &session_id.to_string())?;
    }
    INFERENCE_ID.set(&mut turn.metadata, &inference_id.to_string())?;
    Ok(())
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("turns", &state.turns.len())
            .field("active", &state.active.as_ref().map(|h| h.inference_id().to_string()))
            .field("has_builder", &self.builder.is_some())
            .finish()
    }
}

// Step controller
//
// Coordinates debugger-style pauses across concurrent runs. A session opts
// in with `enable`; from then on each tool loop pause point registers a
// pause and blocks until one of:
// - `continue_pause(pause_id)` is called
// - the pause timeout elapses (auto-continue)
// - the run context is cancelled
// - `disable_session` drains every pause of the session
//
// Each pause's done signal is a CancellationToken, so any number of waiters
// observe the release. The pause record is removed on every exit path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::{InferenceError, Result};

/// Deadline applied when a pause does not carry one
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    AfterInference,
    AfterTools,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::AfterInference => "after_inference",
            StepPhase::AfterTools => "after_tools",
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque ownership data; the controller only keys on `session_id`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepScope {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional: BTreeMap<String, Value>,
}

impl StepScope {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Non-empty fields of `other` win; additional entries are merged
    fn merged_with(&self, other: &StepScope) -> StepScope {
        let mut out = self.clone();
        if !other.session_id.is_empty() {
            out.session_id = other.session_id.clone();
        }
        if !other.conversation_id.is_empty() {
            out.conversation_id = other.conversation_id.clone();
        }
        if !other.owner.is_empty() {
            out.owner = other.owner.clone();
        }
        out.additional
            .extend(other.additional.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseMeta {
    pub pause_id: String,
    pub phase: StepPhase,
    pub summary: String,
    /// Unix milliseconds after which the pause auto-continues
    pub deadline_ms: i64,
    pub session_id: String,
    pub inference_id: String,
    pub turn_id: String,
    pub scope: StepScope,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl PauseMeta {
    pub fn new(phase: StepPhase, session_id: impl Into<String>) -> Self {
        Self {
            pause_id: String::new(),
            phase,
            summary: String::new(),
            deadline_ms: 0,
            session_id: session_id.into(),
            inference_id: String::new(),
            turn_id: String::new(),
            scope: StepScope::default(),
            extra: Map::new(),
        }
    }
}

struct Waiter {
    meta: PauseMeta,
    done: CancellationToken,
}

#[derive(Default)]
struct ControllerState {
    enabled: HashMap<String, StepScope>,
    waiters: HashMap<String, Waiter>,
}

#[derive(Default)]
pub struct StepController {
    state: Mutex<ControllerState>,
}

impl StepController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn on pausing for `scope.session_id`; an empty id is ignored
    pub fn enable(&self, scope: StepScope) {
        if scope.session_id.is_empty() {
            return;
        }
        self.state
            .lock()
            .enabled
            .insert(scope.session_id.clone(), scope);
    }

    /// Turn off pausing and release every pending pause of the session
    pub fn disable_session(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        let released: Vec<CancellationToken> = {
            let mut state = self.state.lock();
            state.enabled.remove(session_id);
            let ids: Vec<String> = state
                .waiters
                .iter()
                .filter(|(_, w)| w.meta.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.waiters.remove(id))
                .map(|w| w.done)
                .collect()
        };
        for done in released {
            done.cancel();
        }
    }

    /// Scope the session was enabled with
    pub fn is_enabled(&self, session_id: &str) -> Option<StepScope> {
        if session_id.is_empty() {
            return None;
        }
        self.state.lock().enabled.get(session_id).cloned()
    }

    /// Register a pause. Returns the completed metadata (pause id, deadline
    /// and scope filled in) and whether a pause was registered; nothing is
    /// registered when the session is not enabled.
    pub fn pause(&self, mut meta: PauseMeta) -> (PauseMeta, bool) {
        let Some(scope) = self.is_enabled(&meta.session_id) else {
            return (meta, false);
        };
        if meta.pause_id.is_empty() {
            meta.pause_id = Uuid::new_v4().to_string();
        }
        if meta.deadline_ms == 0 {
            meta.deadline_ms = deadline_after(DEFAULT_PAUSE_TIMEOUT);
        }
        meta.scope = scope.merged_with(&meta.scope);

        self.state.lock().waiters.insert(
            meta.pause_id.clone(),
            Waiter {
                meta: meta.clone(),
                done: CancellationToken::new(),
            },
        );
        (meta, true)
    }

    /// Metadata of a pending pause; does not release it
    pub fn lookup(&self, pause_id: &str) -> Option<PauseMeta> {
        self.state
            .lock()
            .waiters
            .get(pause_id)
            .map(|w| w.meta.clone())
    }

    /// Pending pauses of a session
    pub fn pending(&self, session_id: &str) -> Vec<PauseMeta> {
        self.state
            .lock()
            .waiters
            .values()
            .filter(|w| w.meta.session_id == session_id)
            .map(|w| w.meta.clone())
            .collect()
    }

    /// Block until the pause is released. A timeout auto-continues and
    /// returns `Ok`; cancellation releases the pause and returns
    /// `InferenceError::Cancelled`. Unknown ids return immediately.
    pub async fn wait(&self, ctx: &RunContext, pause_id: &str, timeout: Duration) -> Result<()> {
        let done = match self.state.lock().waiters.get(pause_id) {
            Some(w) => w.done.clone(),
            None => return Ok(()),
        };

        tokio::select! {
            _ = done.cancelled() => Ok(()),
            _ = tokio::time::sleep(timeout) => {
                self.continue_pause(pause_id);
                Ok(())
            }
            _ = ctx.cancelled() => {
                self.continue_pause(pause_id);
                Err(InferenceError::Cancelled)
            }
        }
    }

    /// Release a pause. Returns its metadata when it was pending.
    pub fn continue_pause(&self, pause_id: &str) -> Option<PauseMeta> {
        let waiter = self.state.lock().waiters.remove(pause_id)?;
        waiter.done.cancel();
        Some(waiter.meta)
    }
}

impl fmt::Debug for StepController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StepController")
            .field("enabled_sessions", &state.enabled.len())
            .field("pending_pauses", &state.waiters.len())
            .finish()
    }
}

/// Unix milliseconds `timeout` from now
pub fn deadline_after(timeout: Duration) -> i64 {
    let delta = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
    (Utc::now() + delta).timestamp_millis()
}

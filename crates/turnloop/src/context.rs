// Run context
//
// Everything a deep callee needs to discover during a run travels in a
// RunContext: the cancellation token, attached event sinks, the snapshot
// hook, the tool registry, session and inference ids, run tags and an
// optional debug tap. The context is cheap to clone (shared parts sit behind
// `Arc`) and immutable; `with_*` methods return a derived copy.
//
// Accessors return `Option`; a missing sink, hook or registry is a valid
// no-op state, never an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

use crate::events::{Event, EventMetadata, EventSink};
use crate::tools::ToolRegistry;
use crate::turns::Turn;

/// Snapshot phases fired by the tool loop
pub mod phase {
    pub const PRE_INFERENCE: &str = "pre_inference";
    pub const POST_INFERENCE: &str = "post_inference";
    pub const POST_TOOLS: &str = "post_tools";
}

/// Observes the Turn at well-known points of a run
pub type SnapshotHook = Arc<dyn Fn(&Turn, &str) + Send + Sync>;

/// Low-level observer for provider engines
pub trait DebugTap: Send + Sync {
    /// The Turn as handed to the provider, before request conversion
    fn on_turn_before_conversion(&self, _turn: &Turn) {}

    /// Raw provider objects (request bodies, stream chunks) by label
    fn on_provider_object(&self, _label: &str, _object: &Value) {}
}

#[derive(Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
    snapshot_hook: Option<SnapshotHook>,
    registry: Option<Arc<ToolRegistry>>,
    session_id: Option<String>,
    inference_id: Option<String>,
    run_tags: Option<Arc<BTreeMap<String, String>>>,
    debug_tap: Option<Arc<dyn DebugTap>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context driven by an existing token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Derived context whose token is cancelled with, but not instead of,
    /// this one
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        child.cancel = self.cancel.child_token();
        child
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    // ------------------------------------------------------------------------
    // Event sinks
    // ------------------------------------------------------------------------

    /// Attach sinks in addition to the ones already present
    pub fn with_event_sinks(mut self, sinks: impl IntoIterator<Item = Arc<dyn EventSink>>) -> Self {
        let mut all: Vec<Arc<dyn EventSink>> = self.sinks.as_ref().clone();
        all.extend(sinks);
        self.sinks = Arc::new(all);
        self
    }

    pub fn with_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        self.with_event_sinks([sink])
    }

    pub fn event_sinks(&self) -> &[Arc<dyn EventSink>] {
        &self.sinks
    }

    /// Publish to every attached sink. Sink failures are logged and never
    /// interrupt the run.
    pub async fn publish(&self, event: &Event) {
        for sink in self.sinks.iter() {
            if let Err(e) = sink.publish_event(event).await {
                warn!(event_type = %event.event_type(), error = %e, "Failed to publish event");
            }
        }
    }

    /// Event metadata seeded with this run's ids
    pub fn event_metadata(&self) -> EventMetadata {
        let mut meta = EventMetadata::new();
        if let Some(session_id) = &self.session_id {
            meta.session_id = session_id.clone();
        }
        if let Some(inference_id) = &self.inference_id {
            meta.inference_id = inference_id.clone();
        }
        meta
    }

    // ------------------------------------------------------------------------
    // Hooks and registry
    // ------------------------------------------------------------------------

    pub fn with_snapshot_hook(mut self, hook: SnapshotHook) -> Self {
        self.snapshot_hook = Some(hook);
        self
    }

    pub fn snapshot_hook(&self) -> Option<&SnapshotHook> {
        self.snapshot_hook.as_ref()
    }

    /// Call the snapshot hook, if any
    pub fn snapshot(&self, turn: &Turn, phase: &str) {
        if let Some(hook) = &self.snapshot_hook {
            hook(turn, phase);
        }
    }

    pub fn with_tool_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn tool_registry(&self) -> Option<&Arc<ToolRegistry>> {
        self.registry.as_ref()
    }

    pub fn with_debug_tap(mut self, tap: Arc<dyn DebugTap>) -> Self {
        self.debug_tap = Some(tap);
        self
    }

    pub fn debug_tap(&self) -> Option<&Arc<dyn DebugTap>> {
        self.debug_tap.as_ref()
    }

    // ------------------------------------------------------------------------
    // Ids and tags
    // ------------------------------------------------------------------------

    pub fn with_session_meta(
        mut self,
        session_id: impl Into<String>,
        inference_id: impl Into<String>,
    ) -> Self {
        self.session_id = Some(session_id.into());
        self.inference_id = Some(inference_id.into());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn inference_id(&self) -> Option<&str> {
        self.inference_id.as_deref()
    }

    pub fn with_run_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.run_tags = Some(Arc::new(tags));
        self
    }

    /// Copy of the run tags; callers may mutate it freely
    pub fn run_tags(&self) -> Option<BTreeMap<String, String>> {
        self.run_tags.as_ref().map(|tags| tags.as_ref().clone())
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("cancelled", &self.is_cancelled())
            .field("sinks", &self.sinks.len())
            .field("snapshot_hook", &self.snapshot_hook.is_some())
            .field("registry", &self.registry)
            .field("session_id", &self.session_id)
            .field("inference_id", &self.inference_id)
            .field("run_tags", &self.run_tags)
            .field("debug_tap", &self.debug_tap.is_some())
            .finish()
    }
}

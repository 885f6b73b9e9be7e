// Provider-agnostic inference runtime
//
// This crate orchestrates LLM inference over an append-only Turn of Blocks:
// engines wrapped in middleware, a tool registry and executor, the
// tool-calling loop, sessions with a single active inference, and the event
// plumbing that streams progress to observers.
//
// Key design decisions:
// - Provider I/O lives behind the Engine trait; nothing here talks HTTP
// - Request-scoped plumbing (cancellation, sinks, registry, hooks) travels in
//   an explicit RunContext
// - Turn metadata and data are typed through versioned keys
// - Events are a closed enum plus registered custom kinds, JSON on the wire
// - Structured payloads in streamed text are extracted by a FilteringSink
//   that hides them from downstream sinks

// Data model
pub mod turns;

// Events and structured extraction
pub mod events;
pub mod structured;

// Execution
pub mod context;
pub mod engine;
pub mod session;
pub mod toolloop;
pub mod tools;

// Ambient
pub mod config;
pub mod error;
pub mod telemetry;

// Re-exports for convenience
pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use context::{DebugTap, RunContext, SnapshotHook};
pub use engine::{
    EngineWithMiddleware, Engine, FnEngine, HandlerFunc, InferenceConfig, Middleware,
    StructuredOutputConfig,
};
pub use error::{EventError, InferenceError, KeyError, Result, ToolError};
pub use events::{Event, EventMetadata, EventPayload, EventSink};
pub use session::{
    EngineBuilder, ExecutionHandle, InferenceRunner, Session, ToolLoopEngineBuilder,
    TurnPersister,
};
pub use structured::{Extractor, ExtractorSession, FilteringOptions, FilteringSink};
pub use toolloop::{LoopConfig, StepController, StepPhase, ToolLoop};
pub use tools::{
    ToolCall, ToolConfig, ToolDefinition, ToolExecutor, ToolRegistry, ToolResult,
};
pub use turns::{Block, BlockKind, Key, Turn};

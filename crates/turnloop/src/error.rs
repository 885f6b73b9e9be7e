// Error types for the inference runtime
//
// Each area owns a small error enum (keys, events, tools). InferenceError is
// the error surfaced by engines, the tool loop and sessions; it converts from
// the area errors and is Clone so an ExecutionHandle can hand the same
// outcome to every waiter.

use thiserror::Error;

use crate::turns::Turn;

/// Result type alias for inference operations
pub type Result<T> = std::result::Result<T, InferenceError>;

/// Errors raised by typed key accessors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    /// Stored value could not be decoded into the key's type
    #[error("key {key}: type mismatch: {reason}")]
    TypeMismatch { key: String, reason: String },

    /// Value could not be encoded as JSON
    #[error("key {key}: value is not JSON-serializable: {reason}")]
    NotSerializable { key: String, reason: String },
}

/// Errors raised by the event codec, sinks and router
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("failed to encode event: {0}")]
    Encode(String),

    #[error("failed to decode event: {0}")]
    Decode(String),

    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("decoder already registered for type {0:?}")]
    DuplicateType(String),

    #[error("failed to publish event: {0}")]
    Publish(String),

    #[error("handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("router closed")]
    Closed,
}

/// Errors raised by tool definitions, registries and the executor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool name cannot be empty")]
    EmptyName,

    #[error("tool name mismatch: registered as {registered}, definition says {definition}")]
    NameMismatch {
        registered: String,
        definition: String,
    },

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool not allowed: {0}")]
    NotAllowed(String),

    #[error("invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("{0}")]
    Execution(String),

    #[error("tool execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("context cancelled")]
    Cancelled,

    #[error("context cancelled during retry backoff")]
    CancelledDuringBackoff,

    #[error("invalid tool schema: {0}")]
    Schema(String),
}

impl ToolError {
    /// Create an execution error from any displayable message
    pub fn execution(msg: impl std::fmt::Display) -> Self {
        ToolError::Execution(msg.to_string())
    }
}

/// Errors surfaced by engines, the tool loop, the runner and sessions
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    /// Provider or engine failure (transport errors bubble through unchanged)
    #[error("engine error: {0}")]
    Engine(String),

    /// The run context was cancelled
    #[error("context canceled")]
    Cancelled,

    /// The tool loop hit its iteration cap; carries the Turn at that point
    #[error("max iterations ({max}) reached")]
    MaxIterations { max: usize, turn: Box<Turn> },

    /// A tool failed while error handling was set to abort
    #[error("tool execution aborted due to error in {name}: {error}")]
    ToolAborted { name: String, error: String },

    /// A run failed after its Turn had progressed; carries that Turn
    #[error("{error}")]
    WithTurn {
        error: Box<InferenceError>,
        turn: Box<Turn>,
    },

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("session id is empty")]
    SessionIdEmpty,

    #[error("session has no engine builder")]
    BuilderMissing,

    #[error("engine builder has no base engine")]
    BaseEngineMissing,

    #[error("session already has an active inference")]
    SessionAlreadyActive,

    #[error("session has no active inference")]
    SessionNoActive,

    #[error("session has no turn to run inference on")]
    SessionEmptyTurn,

    #[error("inference task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl InferenceError {
    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        InferenceError::Engine(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        InferenceError::Configuration(msg.into())
    }

    /// Attach the Turn as it stood when the failure happened. Errors that
    /// already carry a Turn keep theirs.
    pub fn with_turn(self, turn: Turn) -> Self {
        match self {
            InferenceError::MaxIterations { .. } | InferenceError::WithTurn { .. } => self,
            error => InferenceError::WithTurn {
                error: Box::new(error),
                turn: Box::new(turn),
            },
        }
    }

    /// The underlying error, looking through an attached Turn
    pub fn root(&self) -> &InferenceError {
        match self {
            InferenceError::WithTurn { error, .. } => error.root(),
            other => other,
        }
    }

    /// True when the error stems from context cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.root(),
            InferenceError::Cancelled
                | InferenceError::Tool(ToolError::Cancelled)
                | InferenceError::Tool(ToolError::CancelledDuringBackoff)
        )
    }

    /// Turn state captured when the failure happened, if any
    pub fn partial_turn(&self) -> Option<&Turn> {
        match self {
            InferenceError::MaxIterations { turn, .. } | InferenceError::WithTurn { turn, .. } => {
                Some(&**turn)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_iterations_message_and_turn() {
        let turn = Turn::new();
        let err = InferenceError::MaxIterations {
            max: 3,
            turn: Box::new(turn.clone()),
        };
        assert_eq!(err.to_string(), "max iterations (3) reached");
        assert_eq!(err.partial_turn().unwrap().blocks.len(), 0);
    }

    #[test]
    fn test_abort_message() {
        let err = InferenceError::ToolAborted {
            name: "search".into(),
            error: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "tool execution aborted due to error in search: boom"
        );
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(InferenceError::Cancelled.is_cancelled());
        assert!(InferenceError::from(ToolError::CancelledDuringBackoff).is_cancelled());
        assert!(!InferenceError::engine("http 500").is_cancelled());
    }

    #[test]
    fn test_with_turn_wraps_once() {
        let mut turn = Turn::new();
        turn.id = "t1".into();
        let err = InferenceError::Cancelled.with_turn(turn.clone());
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "context canceled");
        assert_eq!(err.partial_turn().unwrap().id, "t1");

        let mut later = Turn::new();
        later.id = "t2".into();
        let err = err.with_turn(later);
        assert_eq!(err.partial_turn().unwrap().id, "t1");
        assert!(matches!(err.root(), InferenceError::Cancelled));

        let max = InferenceError::MaxIterations {
            max: 1,
            turn: Box::new(turn.clone()),
        };
        assert!(matches!(max.with_turn(Turn::new()), InferenceError::MaxIterations { .. }));
    }
}

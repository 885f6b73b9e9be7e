// Session layer
//
// Session owns the Turn history and the single active inference;
// EngineBuilder produces the runner each run uses.

mod builder;
mod execution;
#[allow(clippy::module_inception)]
mod session;

pub use builder::{EngineBuilder, InferenceRunner, ToolLoopEngineBuilder, TurnPersister};
pub use execution::ExecutionHandle;
pub use session::Session;

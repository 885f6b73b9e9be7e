// Tool-calling loop, step controller and tool block helpers

pub mod blocks;
pub mod step_controller;
pub mod tool_loop;

pub use blocks::{append_tool_results_blocks, extract_pending_tool_calls, tool_result_content};
pub use step_controller::{
    PauseMeta, StepController, StepPhase, StepScope, DEFAULT_PAUSE_TIMEOUT,
};
pub use tool_loop::{LoopConfig, ToolLoop};

// Tool definitions, registry, configuration and execution

pub mod builtin;
pub mod config;
pub mod definition;
pub mod executor;
pub mod registry;

pub use config::{
    parse_duration, RetryConfig, ToolChoice, ToolConfig, ToolErrorHandling, MAX_BACKOFF, TOOL_CONFIG,
};
pub use definition::{ToolDefinition, ToolDescriptor, ToolExample, ToolFunction};
pub use executor::{
    DefaultHooks, DefaultToolExecutor, ExecutorHooks, ToolCall, ToolExecutor, ToolResult,
};
pub use registry::{ToolRegistry, ToolRegistryBuilder};

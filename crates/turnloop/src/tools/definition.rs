// Tool definitions
//
// A ToolDefinition pairs the description a provider sends to the model
// (name, description, JSON schema) with the callable that runs it. Typed
// tools are built with `from_fn`: the argument type derives `JsonSchema`, so
// the parameter schema is generated once at construction and arguments are
// decoded with serde before the function runs.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::error::ToolError;

/// The invocable part of a tool: JSON in, JSON out
#[async_trait]
pub trait ToolFunction: Send + Sync {
    async fn call(&self, ctx: &RunContext, args: Value) -> Result<Value, ToolError>;
}

/// Sample invocation shown to models that support few-shot tool examples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExample {
    pub input: Value,
    pub output: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Provider-facing, serializable part of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
    pub function: Arc<dyn ToolFunction>,
    pub examples: Vec<ToolExample>,
    pub tags: Vec<String>,
    pub version: String,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        function: Arc<dyn ToolFunction>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            function,
            examples: Vec::new(),
            tags: Vec::new(),
            version: String::new(),
        }
    }

    /// Build a typed tool. The parameter schema is derived from `A`.
    ///
    /// ```ignore
    /// #[derive(Deserialize, JsonSchema)]
    /// struct WeatherArgs { city: String }
    ///
    /// let def = ToolDefinition::from_fn("get_weather", "Current weather", |_ctx, args: WeatherArgs| async move {
    ///     Ok(json!({"city": args.city, "temp_c": 21}))
    /// })?;
    /// ```
    pub fn from_fn<A, R, F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        f: F,
    ) -> Result<Self, ToolError>
    where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RunContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ToolError>> + Send + 'static,
    {
        let name = name.into();
        let schema = schemars::schema_for!(A);
        let parameters =
            serde_json::to_value(&schema).map_err(|e| ToolError::Schema(e.to_string()))?;
        let function = TypedFunction {
            name: name.clone(),
            f,
            _types: PhantomData,
        };
        Ok(Self::new(name, description, parameters, Arc::new(function)))
    }

    /// Build a tool over raw JSON arguments with a hand-written schema
    pub fn from_json_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(RunContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self::new(name, description, parameters, Arc::new(JsonFunction(f)))
    }

    pub fn with_examples(mut self, examples: Vec<ToolExample>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    pub async fn invoke(&self, ctx: &RunContext, args: Value) -> Result<Value, ToolError> {
        self.function.call(ctx, args).await
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("tags", &self.tags)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Function adapters
// ============================================================================

struct TypedFunction<A, R, F> {
    name: String,
    f: F,
    _types: PhantomData<fn(A) -> R>,
}

#[async_trait]
impl<A, R, F, Fut> ToolFunction for TypedFunction<A, R, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(RunContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ToolError>> + Send + 'static,
{
    async fn call(&self, ctx: &RunContext, args: Value) -> Result<Value, ToolError> {
        let args: A = serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let output = (self.f)(ctx.clone(), args).await?;
        serde_json::to_value(output).map_err(ToolError::execution)
    }
}

struct JsonFunction<F>(F);

#[async_trait]
impl<F, Fut> ToolFunction for JsonFunction<F>
where
    F: Fn(RunContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, ctx: &RunContext, args: Value) -> Result<Value, ToolError> {
        (self.0)(ctx.clone(), args).await
    }
}

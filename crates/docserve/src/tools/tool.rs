//! Tool and tool-creator types shared by built-ins, plugins and proxies.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

/// Future returned by every tool handler.
pub type ToolFuture = BoxFuture<'static, Result<Value, ToolError>>;

/// Handler type: takes the JSON argument object, resolves to a JSON result.
pub type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

pub fn boxed_tool_future<F>(future: F) -> ToolFuture
where
    F: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    future.boxed()
}

/// Failure reported by a tool handler.
///
/// Displays as the bare message so that an error raised inside a plugin
/// reads the same after it has crossed the worker channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    pub stack: Option<String>,
    pub code: Option<String>,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Builds a tool error from any error, keeping its source chain as the stack.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        let mut tool_error = Self::new(error.to_string());
        if !chain.is_empty() {
            tool_error.stack = Some(chain.join("\n"));
        }
        tool_error
    }
}

impl From<crate::error::CoreError> for ToolError {
    fn from(error: crate::error::CoreError) -> Self {
        Self::from_error(&error)
    }
}

/// Description and input shape advertised for a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub description: String,
    /// JSON Schema for the argument object. Opaque to the host.
    pub input_schema: Value,
}

impl ToolSchema {
    pub fn new(description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            description: description.into(),
            input_schema,
        }
    }
}

/// A realized tool: name, schema and handler.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub schema: ToolSchema,
    pub handler: ToolHandler,
}

impl Tool {
    pub fn new(name: impl Into<String>, schema: ToolSchema, handler: ToolHandler) -> Self {
        Self {
            name: name.into(),
            schema,
            handler,
        }
    }

    /// Calls the handler with one argument object. `null` becomes `{}`.
    pub fn call(&self, args: Value) -> ToolFuture {
        let args = if args.is_null() {
            Value::Object(Default::default())
        } else {
            args
        };
        (self.handler)(args)
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Tool")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

type CreateFn = Arc<dyn Fn() -> Result<Tool, ToolError> + Send + Sync>;

/// Deferred factory for a [`Tool`].
///
/// Construction runs only when the registry realizes the creator.
#[derive(Clone)]
pub struct ToolCreator {
    label: Option<String>,
    create: CreateFn,
}

impl ToolCreator {
    pub fn new<F>(create: F) -> Self
    where
        F: Fn() -> Result<Tool, ToolError> + Send + Sync + 'static,
    {
        Self {
            label: None,
            create: Arc::new(create),
        }
    }

    /// Creator tagged with a name for diagnostics.
    pub fn labeled<F>(label: impl Into<String>, create: F) -> Self
    where
        F: Fn() -> Result<Tool, ToolError> + Send + Sync + 'static,
    {
        Self {
            label: Some(label.into()),
            create: Arc::new(create),
        }
    }

    /// Creator that hands out clones of an already realized tool.
    pub fn from_tool(tool: Tool) -> Self {
        let label = tool.name.clone();
        Self::labeled(label, move || Ok(tool.clone()))
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn create(&self) -> Result<Tool, ToolError> {
        (self.create)()
    }
}

impl std::fmt::Debug for ToolCreator {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ToolCreator")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

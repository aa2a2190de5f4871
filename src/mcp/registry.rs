//! Capability registries: tools, resources and prompts.
//!
//! Each registry is a name-keyed table of capability metadata plus an
//! invocation handler. Registries are filled once at startup and shared
//! read-only (behind `Arc`) with every transport.
//!
//! Handlers report failures as [`HandlerError`]. The registry turns those,
//! and its own lookup and argument-shape checks, into a [`DispatchError`]
//! whose [`DispatchErrorKind`] lets the dispatcher pick the protocol error
//! code deterministically.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// A failure raised by a user-supplied capability handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Discriminant of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    /// The named tool, resource or prompt is not registered.
    NotFound,
    /// The arguments were rejected before the handler ran.
    InvalidParams,
    /// The handler ran and failed.
    ExecutionFailed,
    /// Anything else (e.g. a handler that panicked).
    Internal,
}

/// An error produced at the registry boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DispatchError {
    /// What went wrong.
    pub kind: DispatchErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DispatchError {
    /// Creates a new dispatch error.
    #[must_use]
    pub fn new(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::NotFound, message)
    }

    /// Creates an invalid-params error.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::InvalidParams, message)
    }

    /// Creates an execution-failed error.
    #[must_use]
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::ExecutionFailed, message)
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::Internal, message)
    }
}

/// Runs a handler future on its own task so a panicking handler surfaces as
/// an internal error instead of tearing down the calling transport.
///
/// This relies on unwinding; the release profile keeps `panic = "unwind"`.
async fn run_guarded<T, F>(what: String, fut: F) -> Result<Result<T, HandlerError>, DispatchError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, HandlerError>> + Send + 'static,
{
    tokio::spawn(fut).await.map_err(|e| {
        tracing::error!(capability = %what, error = %e, "Capability handler aborted");
        DispatchError::internal(format!("Unexpected error calling {what}"))
    })
}

// =============================================================================
// Tools
// =============================================================================

/// A tool implementation.
///
/// Handlers always receive named arguments; positional calls are mapped to
/// names by the registry according to the tool's [`CallingConvention`].
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Runs the tool.
    async fn call(&self, args: Map<String, Value>) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, args: Map<String, Value>) -> Result<Value, HandlerError> {
        (self)(args).await
    }
}

/// How a tool accepts its arguments, fixed at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallingConvention {
    /// Arguments arrive as an object.
    Named,
    /// Arguments may also arrive as a list, mapped onto these names in order.
    Positional(Vec<String>),
    /// The tool takes no arguments.
    NoArgs,
}

/// Arguments of a `tools/call` request, by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    /// `"arguments": {...}`
    Named(Map<String, Value>),
    /// `"arguments": [...]`
    Positional(Vec<Value>),
    /// Absent or `null`.
    Absent,
}

impl ToolArguments {
    /// Classifies the raw `arguments` member of a `tools/call` request.
    ///
    /// # Errors
    ///
    /// Returns an invalid-params error for scalars.
    pub fn from_value(tool: &str, value: Option<&Value>) -> Result<Self, DispatchError> {
        match value {
            None | Some(Value::Null) => Ok(Self::Absent),
            Some(Value::Object(map)) => Ok(Self::Named(map.clone())),
            Some(Value::Array(list)) => Ok(Self::Positional(list.clone())),
            Some(_) => Err(DispatchError::invalid_params(format!(
                "Parameters for tool '{tool}' must be a dictionary, a list (if positional), \
                 or null (if no arguments)."
            ))),
        }
    }
}

/// A tool definition as listed by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,
}

/// A tool ready to be registered.
pub struct Tool {
    name: String,
    description: String,
    properties: Map<String, Value>,
    required: Vec<String>,
    convention: CallingConvention,
    handler: Arc<dyn ToolHandler>,
}

impl Tool {
    /// Creates a tool taking named arguments.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            properties: Map::new(),
            required: Vec::new(),
            convention: CallingConvention::Named,
            handler: Arc::new(handler),
        }
    }

    /// Declares an input property with its JSON schema.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Declares an input property that must be supplied.
    #[must_use]
    pub fn required_property(mut self, name: impl Into<String>, schema: Value) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.properties.insert(name, schema);
        self
    }

    /// Accepts positional arguments, mapped onto `names` in order.
    #[must_use]
    pub fn positional<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.convention =
            CallingConvention::Positional(names.into_iter().map(Into::into).collect());
        self
    }

    /// Marks the tool as taking no arguments.
    #[must_use]
    pub fn no_args(mut self) -> Self {
        self.convention = CallingConvention::NoArgs;
        self
    }

    fn definition(&self) -> ToolDefinition {
        let mut schema = json!({
            "type": "object",
            "properties": self.properties,
        });
        if !self.required.is_empty() {
            schema["required"] = json!(self.required);
        }
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: schema,
        }
    }
}

/// Name-keyed table of tools, listed in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Tool>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any tool of the same name.
    pub fn register(&mut self, tool: Tool) -> &mut Self {
        if self.tools.contains_key(&tool.name) {
            tracing::warn!(tool = %tool.name, "Tool is being redefined");
        }
        tracing::debug!(tool = %tool.name, "Tool registered");
        self.tools.insert(tool.name.clone(), tool);
        self
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Lists every tool definition.
    #[must_use]
    pub fn list_tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(Tool::definition).collect()
    }

    /// Calls a registered tool.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no tool has this name
    /// - `InvalidParams` if the argument shape does not fit the tool
    /// - `ExecutionFailed` if the handler fails
    /// - `Internal` if the handler panics
    pub async fn call_tool(&self, name: &str, args: ToolArguments) -> Result<Value, DispatchError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| DispatchError::not_found(format!("Tool '{name}' not found.")))?;

        let named = Self::bind_arguments(name, &tool.convention, args)?;
        let handler = Arc::clone(&tool.handler);

        run_guarded(format!("tool: {name}"), async move { handler.call(named).await })
            .await?
            .map_err(|e| {
                DispatchError::execution_failed(format!("Error executing tool '{name}': {e}"))
            })
    }

    /// Maps request arguments onto the tool's calling convention.
    fn bind_arguments(
        name: &str,
        convention: &CallingConvention,
        args: ToolArguments,
    ) -> Result<Map<String, Value>, DispatchError> {
        match (convention, args) {
            (_, ToolArguments::Absent) => Ok(Map::new()),
            (CallingConvention::NoArgs, ToolArguments::Named(map)) if map.is_empty() => Ok(map),
            (CallingConvention::NoArgs, ToolArguments::Positional(list)) if list.is_empty() => {
                Ok(Map::new())
            }
            (CallingConvention::NoArgs, _) => Err(DispatchError::invalid_params(format!(
                "Tool '{name}' takes no arguments."
            ))),
            (_, ToolArguments::Named(map)) => Ok(map),
            (CallingConvention::Positional(names), ToolArguments::Positional(list)) => {
                if list.len() == names.len() {
                    Ok(names.iter().cloned().zip(list).collect())
                } else {
                    Err(DispatchError::invalid_params(format!(
                        "Tool '{name}' expects {} positional parameters, got {}.",
                        names.len(),
                        list.len()
                    )))
                }
            }
            (CallingConvention::Named, ToolArguments::Positional(_)) => {
                Err(DispatchError::invalid_params(format!(
                    "Tool '{name}' received list parameters but has no defined positional \
                     parameter names."
                )))
            }
        }
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Content produced by a resource read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceContent {
    /// UTF-8 text.
    Text(String),
    /// Binary data, base64-encoded on the wire.
    Blob(Vec<u8>),
}

/// A resource implementation.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Reads the resource at `uri`.
    async fn read(&self, uri: &str) -> Result<ResourceContent, HandlerError>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResourceContent, HandlerError>> + Send + 'static,
{
    async fn read(&self, uri: &str) -> Result<ResourceContent, HandlerError> {
        (self)(uri.to_string()).await
    }
}

/// A resource definition as listed by `resources/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// Resource URI, unique within the registry.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A resource ready to be registered.
pub struct Resource {
    definition: ResourceDefinition,
    handler: Arc<dyn ResourceHandler>,
}

impl Resource {
    /// Creates a resource.
    pub fn new(
        uri: impl Into<String>,
        name: impl Into<String>,
        handler: impl ResourceHandler + 'static,
    ) -> Self {
        Self {
            definition: ResourceDefinition {
                uri: uri.into(),
                name: name.into(),
                description: None,
                mime_type: None,
            },
            handler: Arc::new(handler),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    /// Sets the MIME type.
    #[must_use]
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.definition.mime_type = Some(mime_type.into());
        self
    }
}

/// The result of a successful resource read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRead {
    /// MIME type declared at registration, if any.
    pub mime_type: Option<String>,
    /// The content returned by the handler.
    pub content: ResourceContent,
}

/// URI-keyed table of resources, listed in registration order.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: IndexMap<String, Resource>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource, replacing any resource with the same URI.
    pub fn register(&mut self, resource: Resource) -> &mut Self {
        let uri = resource.definition.uri.clone();
        if self.resources.contains_key(&uri) {
            tracing::warn!(uri = %uri, "Resource is being redefined");
        }
        tracing::debug!(uri = %uri, "Resource registered");
        self.resources.insert(uri, resource);
        self
    }

    /// Returns `true` if a resource with this URI is registered.
    #[must_use]
    pub fn contains(&self, uri: &str) -> bool {
        self.resources.contains_key(uri)
    }

    /// Lists every resource definition.
    #[must_use]
    pub fn list_resources(&self) -> Vec<ResourceDefinition> {
        self.resources
            .values()
            .map(|r| r.definition.clone())
            .collect()
    }

    /// Reads a registered resource.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no resource has this URI
    /// - `ExecutionFailed` if the handler fails
    /// - `Internal` if the handler panics
    pub async fn read_resource_content(&self, uri: &str) -> Result<ResourceRead, DispatchError> {
        let resource = self
            .resources
            .get(uri)
            .ok_or_else(|| DispatchError::not_found(format!("Resource '{uri}' not found.")))?;

        let handler = Arc::clone(&resource.handler);
        let owned_uri = uri.to_string();
        let content = run_guarded(format!("resource: {uri}"), async move {
            handler.read(&owned_uri).await
        })
        .await?
        .map_err(|e| DispatchError::execution_failed(e.to_string()))?;

        Ok(ResourceRead {
            mime_type: resource.definition.mime_type.clone(),
            content,
        })
    }
}

// =============================================================================
// Prompts
// =============================================================================

/// A prompt implementation.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Renders the prompt with the given arguments.
    async fn get(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> PromptHandler for F
where
    F: Fn(String, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn get(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, HandlerError> {
        (self)(name.to_string(), arguments).await
    }
}

/// One declared prompt argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    pub required: bool,
}

/// A prompt definition as listed by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptDefinition {
    /// Unique prompt name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Declared arguments.
    pub arguments: Vec<PromptArgument>,
}

/// A prompt ready to be registered.
pub struct Prompt {
    definition: PromptDefinition,
    handler: Arc<dyn PromptHandler>,
}

impl Prompt {
    /// Creates a prompt without arguments.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl PromptHandler + 'static,
    ) -> Self {
        Self {
            definition: PromptDefinition {
                name: name.into(),
                description: description.into(),
                arguments: Vec::new(),
            },
            handler: Arc::new(handler),
        }
    }

    /// Declares an argument.
    #[must_use]
    pub fn argument(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.definition.arguments.push(PromptArgument {
            name: name.into(),
            description: Some(description.into()),
            required,
        });
        self
    }
}

/// Name-keyed table of prompts, listed in registration order.
#[derive(Default)]
pub struct PromptRegistry {
    prompts: IndexMap<String, Prompt>,
}

impl PromptRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a prompt, replacing any prompt of the same name.
    pub fn register(&mut self, prompt: Prompt) -> &mut Self {
        let name = prompt.definition.name.clone();
        if self.prompts.contains_key(&name) {
            tracing::warn!(prompt = %name, "Prompt is being redefined");
        }
        tracing::debug!(prompt = %name, "Prompt registered");
        self.prompts.insert(name, prompt);
        self
    }

    /// Lists every prompt definition.
    #[must_use]
    pub fn list_prompts(&self) -> Vec<PromptDefinition> {
        self.prompts.values().map(|p| p.definition.clone()).collect()
    }

    /// Renders a registered prompt.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no prompt has this name
    /// - `ExecutionFailed` if the handler fails
    /// - `Internal` if the handler panics
    pub async fn get_prompt_result(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let prompt = self
            .prompts
            .get(name)
            .ok_or_else(|| DispatchError::not_found(format!("Prompt '{name}' not found.")))?;

        let handler = Arc::clone(&prompt.handler);
        let owned_name = name.to_string();
        run_guarded(format!("prompt: {name}"), async move {
            handler.get(&owned_name, arguments).await
        })
        .await?
        .map_err(|e| DispatchError::execution_failed(e.to_string()))
    }
}

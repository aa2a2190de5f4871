//! The MCP dispatcher.
//!
//! [`ServerCore`] routes one decoded JSON-RPC message to the matching method
//! handler and wraps the outcome in a response envelope. It holds no state
//! between calls apart from shared references to the capability registries
//! it was built with, so a single instance is shared by every transport and
//! every BLE link.
//!
//! # Supported methods
//!
//! | Method                  | Needs registry |
//! |-------------------------|----------------|
//! | `initialize`            | none           |
//! | `tools/list`            | tools          |
//! | `tools/call`            | tools          |
//! | `resources/list`        | resources      |
//! | `resources/read`        | resources      |
//! | `resources/subscribe`   | resources      |
//! | `resources/unsubscribe` | none           |
//! | `prompts/list`          | prompts        |
//! | `prompts/get`           | prompts        |

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::mcp::protocol::{
    classify, decode_json, params_object, ErrorCode, IncomingMessage, JsonRpcError,
    JsonRpcResponse, RequestId, Response, MCP_PROTOCOL_VERSION, SERVER_NAME,
};
use crate::mcp::registry::{
    DispatchError, DispatchErrorKind, PromptRegistry, ResourceContent, ResourceRegistry,
    ToolArguments, ToolRegistry,
};

/// Server capabilities advertised during initialisation.
///
/// A capability is present only if the corresponding registry was supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerCapabilities {
    /// Tool-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListCapabilities>,
    /// Resource-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceCapabilities>,
    /// Prompt-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListCapabilities>,
}

/// Capabilities of a listable registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListCapabilities {
    /// Whether the list can change during the session. Always `false`.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Resource-specific capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCapabilities {
    /// Whether change subscriptions deliver notifications. Always `false`.
    pub subscribe: bool,
    /// Whether the list can change during the session. Always `false`.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Server information for the initialisation response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

impl ServerInfo {
    /// Creates server information.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self::new(SERVER_NAME, env!("CARGO_PKG_VERSION"))
    }
}

/// Content item in a tool call response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
}

/// Result of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Content returned by the tool.
    pub content: Vec<ToolContent>,
    /// Whether the tool call resulted in an error.
    pub is_error: bool,
}

impl ToolCallResult {
    /// Creates a successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Creates an error text result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }

    /// Renders a tool's return value. Strings are used verbatim, anything
    /// else as its JSON text.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Self::text(text),
            other => Self::text(other.to_string()),
        }
    }
}

/// A method failure before the request ID is attached.
#[derive(Debug)]
struct Failure {
    code: ErrorCode,
    category: &'static str,
    detail: String,
}

impl Failure {
    fn new(code: ErrorCode, category: &'static str, detail: impl Into<String>) -> Self {
        Self {
            code,
            category,
            detail: detail.into(),
        }
    }

    fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidParams,
            ErrorCode::InvalidParams.default_message(),
            detail,
        )
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, "Internal Server Error", detail)
    }

    fn unavailable(registry: &str) -> Self {
        Self::new(
            ErrorCode::ServerError,
            "Server Configuration Error",
            format!("{registry} registry not available."),
        )
    }

    /// Maps a resource or prompt registry error onto the wire.
    fn from_dispatch(err: DispatchError, category: &'static str) -> Self {
        match err.kind {
            DispatchErrorKind::NotFound => Self::new(ErrorCode::NotFound, category, err.message),
            DispatchErrorKind::InvalidParams => Self::invalid_params(err.message),
            DispatchErrorKind::ExecutionFailed => {
                Self::new(ErrorCode::ServerError, category, err.message)
            }
            DispatchErrorKind::Internal => Self::internal(err.message),
        }
    }

    fn into_error(self, id: Option<RequestId>) -> JsonRpcError {
        JsonRpcError::application(id, self.code, self.category, self.detail)
    }
}

type MethodResult = Result<Value, Failure>;

/// The transport-independent MCP dispatcher.
#[derive(Clone, Default)]
pub struct ServerCore {
    info: ServerInfo,
    tools: Option<Arc<ToolRegistry>>,
    resources: Option<Arc<ResourceRegistry>>,
    prompts: Option<Arc<PromptRegistry>>,
}

impl ServerCore {
    /// Creates a dispatcher with no registries.
    #[must_use]
    pub fn new(info: ServerInfo) -> Self {
        Self {
            info,
            tools: None,
            resources: None,
            prompts: None,
        }
    }

    /// Attaches the tool registry.
    #[must_use]
    pub fn with_tools(mut self, tools: impl Into<Arc<ToolRegistry>>) -> Self {
        self.tools = Some(tools.into());
        self
    }

    /// Attaches the resource registry.
    #[must_use]
    pub fn with_resources(mut self, resources: impl Into<Arc<ResourceRegistry>>) -> Self {
        self.resources = Some(resources.into());
        self
    }

    /// Attaches the prompt registry.
    #[must_use]
    pub fn with_prompts(mut self, prompts: impl Into<Arc<PromptRegistry>>) -> Self {
        self.prompts = Some(prompts.into());
        self
    }

    /// Returns the server information announced by `initialize`.
    #[must_use]
    pub const fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Returns the capabilities implied by the attached registries.
    #[must_use]
    pub fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: self.tools.as_ref().map(|_| ListCapabilities::default()),
            resources: self
                .resources
                .as_ref()
                .map(|_| ResourceCapabilities::default()),
            prompts: self.prompts.as_ref().map(|_| ListCapabilities::default()),
        }
    }

    /// Decodes one frame of JSON text and dispatches it.
    ///
    /// Blank frames are ignored. Undecodable frames yield a parse error with
    /// `id: null`.
    pub async fn handle_frame(&self, text: &str) -> Option<Response> {
        if text.trim().is_empty() {
            return None;
        }
        match decode_json(text) {
            Ok(value) => self.dispatch(value).await,
            Err(error) => {
                tracing::warn!(bytes = text.len(), "Received invalid JSON");
                Some(error.into())
            }
        }
    }

    /// Dispatches one decoded JSON-RPC message.
    ///
    /// Returns exactly one response for a request (a message with an `id`
    /// member) and `None` for a notification.
    pub async fn dispatch(&self, raw: Value) -> Option<Response> {
        let msg = match classify(raw) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(answered = error.is_some(), "Rejected malformed message");
                return error.map(Response::from);
            }
        };

        match msg {
            IncomingMessage::Request(req) => {
                tracing::debug!(method = %req.method, id = ?req.id, "Handling request");
                let response = match self.route(&req.method, req.params.as_ref()).await {
                    Some(Ok(result)) => JsonRpcResponse::success(req.id, result).into(),
                    Some(Err(failure)) => {
                        tracing::debug!(
                            method = %req.method,
                            code = failure.code.code(),
                            detail = %failure.detail,
                            "Request failed"
                        );
                        failure.into_error(req.id).into()
                    }
                    None => {
                        tracing::debug!(method = %req.method, "Method not found");
                        JsonRpcError::method_not_found(req.id, &req.method).into()
                    }
                };
                Some(response)
            }
            IncomingMessage::Notification(notif) => {
                tracing::debug!(method = %notif.method, "Handling notification");
                let _ = self.route(&notif.method, notif.params.as_ref()).await;
                None
            }
        }
    }

    /// Routes a method to its handler. Returns `None` for unknown methods.
    async fn route(&self, method: &str, params: Option<&Value>) -> Option<MethodResult> {
        let result = match method {
            "initialize" => Ok(self.initialize()),
            "tools/list" => self.tools_list(),
            "tools/call" => self.tools_call(params).await,
            "resources/list" => self.resources_list(),
            "resources/read" => self.resources_read(params).await,
            "resources/subscribe" => self.resources_subscribe(params),
            "resources/unsubscribe" => Self::resources_unsubscribe(params),
            "prompts/list" => self.prompts_list(),
            "prompts/get" => self.prompts_get(params).await,
            _ => return None,
        };
        Some(result)
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": self.capabilities(),
            "serverInfo": self.info,
        })
    }

    fn tool_registry(&self) -> Result<&ToolRegistry, Failure> {
        self.tools.as_deref().ok_or_else(|| Failure::unavailable("Tool"))
    }

    fn resource_registry(&self) -> Result<&ResourceRegistry, Failure> {
        self.resources
            .as_deref()
            .ok_or_else(|| Failure::unavailable("Resource"))
    }

    fn prompt_registry(&self) -> Result<&PromptRegistry, Failure> {
        self.prompts
            .as_deref()
            .ok_or_else(|| Failure::unavailable("Prompt"))
    }

    fn tools_list(&self) -> MethodResult {
        let tools = self.tool_registry()?.list_tool_definitions();
        Ok(json!({ "tools": tools }))
    }

    async fn tools_call(&self, params: Option<&Value>) -> MethodResult {
        let registry = self.tool_registry()?;
        let params = object_params(params, "tools/call")?;

        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Err(Failure::invalid_params(
                "Tool 'name' not provided in parameters for tools/call.",
            ));
        };

        let args = ToolArguments::from_value(name, params.get("arguments"))
            .map_err(|e| Failure::invalid_params(e.message))?;

        let result = match registry.call_tool(name, args).await {
            Ok(value) => ToolCallResult::from_value(value),
            Err(e) => match e.kind {
                DispatchErrorKind::ExecutionFailed => {
                    tracing::info!(tool = %name, error = %e, "Tool execution failed");
                    ToolCallResult::error(e.message)
                }
                DispatchErrorKind::NotFound | DispatchErrorKind::InvalidParams => {
                    return Err(Failure::invalid_params(e.message));
                }
                DispatchErrorKind::Internal => return Err(Failure::internal(e.message)),
            },
        };

        serde_json::to_value(&result).map_err(|e| {
            tracing::error!(error = %e, "Failed to serialise tool call result");
            Failure::internal("Failed to serialise tool call result.")
        })
    }

    fn resources_list(&self) -> MethodResult {
        let resources = self.resource_registry()?.list_resources();
        Ok(json!({ "resources": resources }))
    }

    async fn resources_read(&self, params: Option<&Value>) -> MethodResult {
        let params = object_params(params, "resources/read")?;
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return Err(Failure::invalid_params("Missing 'uri' parameter."));
        };

        let registry = self.resource_registry()?;

        let read = registry
            .read_resource_content(uri)
            .await
            .map_err(|e| Failure::from_dispatch(e, "Resource Error"))?;

        let item = match read.content {
            ResourceContent::Text(text) => json!({
                "uri": uri,
                "mimeType": read.mime_type.as_deref().unwrap_or("text/plain"),
                "text": text,
            }),
            ResourceContent::Blob(bytes) => json!({
                "uri": uri,
                "mimeType": read.mime_type.as_deref().unwrap_or("application/octet-stream"),
                "blob": BASE64_STANDARD.encode(bytes),
            }),
        };

        Ok(json!({ "contents": [item] }))
    }

    fn resources_subscribe(&self, params: Option<&Value>) -> MethodResult {
        let uri = subscription_uri(params)?;
        let registry = self.resource_registry()?;

        if !registry.contains(uri) {
            return Err(Failure::new(
                ErrorCode::NotFound,
                "Subscription Error",
                format!("Resource URI '{uri}' not found in registry."),
            ));
        }

        tracing::debug!(uri = %uri, "Subscription acknowledged");
        Ok(json!({}))
    }

    /// Always acknowledges; no subscription state is kept.
    fn resources_unsubscribe(params: Option<&Value>) -> MethodResult {
        let uri = subscription_uri(params)?;
        tracing::debug!(uri = %uri, "Unsubscription acknowledged");
        Ok(json!({}))
    }

    fn prompts_list(&self) -> MethodResult {
        let prompts = self.prompt_registry()?.list_prompts();
        Ok(json!({ "prompts": prompts }))
    }

    async fn prompts_get(&self, params: Option<&Value>) -> MethodResult {
        let registry = self.prompt_registry()?;
        let params = object_params(params, "prompts/get")?;

        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Err(Failure::invalid_params("Missing 'name' parameter for prompt."));
        };

        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(Failure::invalid_params(format!(
                    "Arguments for prompt '{name}' must be an object."
                )))
            }
        };

        registry
            .get_prompt_result(name, arguments)
            .await
            .map_err(|e| Failure::from_dispatch(e, "Prompt Error"))
    }
}

fn object_params(params: Option<&Value>, method: &str) -> Result<Map<String, Value>, Failure> {
    params_object(params).ok_or_else(|| {
        Failure::invalid_params(format!("Parameters for {method} must be an object."))
    })
}

fn subscription_uri(params: Option<&Value>) -> Result<&str, Failure> {
    params
        .and_then(|p| p.get("uri"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Failure::invalid_params("Missing or invalid 'uri' parameter (must be a string).")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::registry::{HandlerError, Resource, Tool};

    async fn fail(_: Map<String, Value>) -> Result<Value, HandlerError> {
        Err(HandlerError::new("Something went wrong in the tool"))
    }

    async fn bytes(_: String) -> Result<ResourceContent, HandlerError> {
        Ok(ResourceContent::Blob(vec![0x00, 0xff, 0x10]))
    }

    fn core() -> ServerCore {
        let mut tools = ToolRegistry::new();
        tools.register(Tool::new("fail", "Always fails", fail));
        let mut resources = ResourceRegistry::new();
        resources.register(Resource::new("mcp://bin", "Binary", bytes));
        ServerCore::new(ServerInfo::new("test", "1.0"))
            .with_tools(tools)
            .with_resources(resources)
    }

    async fn call(core: &ServerCore, method: &str, params: Value) -> Response {
        core.dispatch(json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}))
            .await
            .expect("requests are answered")
    }

    #[test]
    fn capabilities_follow_registries() {
        let caps = serde_json::to_value(core().capabilities()).unwrap();
        assert_eq!(
            caps,
            json!({
                "tools": {"listChanged": false},
                "resources": {"subscribe": false, "listChanged": false},
            })
        );

        let empty = serde_json::to_value(ServerCore::default().capabilities()).unwrap();
        assert_eq!(empty, json!({}));
    }

    #[test]
    fn tool_result_rendering() {
        assert_eq!(
            ToolCallResult::from_value(json!("plain")).content,
            vec![ToolContent::Text { text: "plain".into() }]
        );
        assert_eq!(
            ToolCallResult::from_value(json!(30.0)).content,
            vec![ToolContent::Text { text: "30.0".into() }]
        );
        assert_eq!(
            ToolCallResult::from_value(json!({"k": 1})).content,
            vec![ToolContent::Text { text: r#"{"k":1}"#.into() }]
        );
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let response = call(&core(), "initialize", json!({})).await;
        let result = response.result().unwrap();
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"], json!({"name": "test", "version": "1.0"}));
        assert!(result["capabilities"].get("prompts").is_none());
    }

    #[tokio::test]
    async fn missing_registry_is_configuration_error() {
        let response = call(&core(), "prompts/list", json!({})).await;
        let error = response.error().unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "Server Configuration Error");
        assert_eq!(error.data, Some(json!("Prompt registry not available.")));
    }

    #[tokio::test]
    async fn failing_tool_is_error_payload() {
        let response = call(&core(), "tools/call", json!({"name": "fail"})).await;
        let result = response.result().unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Error executing tool 'fail'"));
        assert!(text.contains("Something went wrong in the tool"));
    }

    #[tokio::test]
    async fn scalar_tool_arguments_are_invalid_params() {
        let response = call(&core(), "tools/call", json!({"name": "fail", "arguments": 5})).await;
        assert_eq!(response.error().unwrap().code, -32602);
    }

    #[tokio::test]
    async fn blob_resource_is_base64() {
        let response = call(&core(), "resources/read", json!({"uri": "mcp://bin"})).await;
        let item = &response.result().unwrap()["contents"][0];
        assert_eq!(item["uri"], "mcp://bin");
        assert_eq!(item["mimeType"], "application/octet-stream");
        assert_eq!(item["blob"], "AP8Q");
    }

    #[tokio::test]
    async fn unknown_resource_is_not_found() {
        let response = call(&core(), "resources/read", json!({"uri": "mcp://missing"})).await;
        let error = response.error().unwrap();
        assert_eq!(error.code, -32001);
        assert_eq!(error.message, "Resource Error");
    }

    #[tokio::test]
    async fn bad_uri_is_invalid_params_even_without_resources() {
        let bare = ServerCore::default();

        let response = call(&bare, "resources/subscribe", json!({"uri": 5})).await;
        assert_eq!(response.error().unwrap().code, -32602);

        let response = call(&bare, "resources/read", json!({})).await;
        assert_eq!(response.error().unwrap().code, -32602);

        let response = call(&bare, "resources/read", json!({"uri": "mcp://bin"})).await;
        assert_eq!(response.error().unwrap().code, -32000);
    }

    #[tokio::test]
    async fn notification_gets_no_response() {
        let response = core()
            .dispatch(json!({"jsonrpc": "2.0", "method": "tools/list"}))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn blank_and_invalid_frames() {
        let core = core();
        assert!(core.handle_frame("   ").await.is_none());

        let response = core.handle_frame("{not json").await.unwrap();
        assert_eq!(response.error().unwrap().code, -32700);
        assert!(response.id().is_none());
    }
}

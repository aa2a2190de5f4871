//! JSON-RPC 2.0 message types for the MCP protocol.
//!
//! This module defines the envelope shapes shared by every transport.
//! All messages follow the JSON-RPC 2.0 specification with MCP-specific
//! conventions for error objects.
//!
//! # Message Types
//!
//! - **Request**: A message expecting a response (has `id`, possibly `null`)
//! - **Notification**: A one-way message (no `id` member, no response)
//! - **Response**: A reply to a request, exactly one of `result` or `error`
//!
//! # Error Objects
//!
//! Error objects carry a short category in `message` (e.g. `"Invalid Params"`)
//! and the human-readable detail as a string in `data`. Responses to input
//! whose `id` could not be recovered carry `"id": null`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The MCP protocol version this implementation announces.
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// The JSON-RPC protocol marker.
pub const JSONRPC_VERSION: &str = "2.0";

/// Default server name for capability negotiation.
pub const SERVER_NAME: &str = "MicroPython MCP Server";

/// A JSON-RPC 2.0 request ID.
///
/// Only numbers and strings are accepted. An explicit `null` is represented
/// as `None` wherever an ID is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID (integer or float, preserved as sent).
    Number(serde_json::Number),
    /// String request ID.
    String(String),
}

impl RequestId {
    /// Extracts a request ID from a raw `id` member.
    ///
    /// Returns `Ok(None)` for `null` and `Err(())` for values that cannot be
    /// an ID (booleans, arrays, objects).
    #[allow(clippy::result_unit_err)]
    pub fn from_value(value: &Value) -> Result<Option<Self>, ()> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => Ok(Some(Self::Number(n.clone()))),
            Value::String(s) => Ok(Some(Self::String(s.clone()))),
            _ => Err(()),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC 2.0 request message.
///
/// Requests expect exactly one response from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    /// The request identifier. `None` when the client sent `"id": null`.
    pub id: Option<RequestId>,

    /// The method to invoke.
    pub method: String,

    /// Optional parameters for the method.
    pub params: Option<Value>,
}

/// A JSON-RPC 2.0 notification message (incoming).
///
/// Notifications do not have an ID and do not expect a response.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    /// The notification method.
    pub method: String,

    /// Optional parameters for the notification.
    pub params: Option<Value>,
}

/// An incoming message that could be either a request or notification.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// A request expecting a response.
    Request(JsonRpcRequest),
    /// A notification (no response expected).
    Notification(JsonRpcNotification),
}

/// A successful JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    /// Always "2.0".
    pub jsonrpc: &'static str,

    /// The request ID this response corresponds to.
    pub id: Option<RequestId>,

    /// The result of the method call.
    pub result: Value,
}

impl JsonRpcResponse {
    /// Creates a new success response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Value is not const-compatible
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
        }
    }
}

/// JSON-RPC 2.0 error codes, including the application range used by MCP
/// servers for capability-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the server.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Generic application failure (configuration, handler failure).
    ServerError,
    /// A named tool, resource or prompt does not exist.
    NotFound,
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::ServerError => -32000,
            Self::NotFound => -32001,
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method Not Found",
            Self::InvalidParams => "Invalid Params",
            Self::ServerError => "Server Error",
            Self::NotFound => "Not Found",
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcErrorData {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Adds additional data to the error.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// A JSON-RPC 2.0 error response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    /// Always "2.0".
    pub jsonrpc: &'static str,

    /// The request ID this error corresponds to, `null` if unknown.
    pub id: Option<RequestId>,

    /// The error details.
    pub error: JsonRpcErrorData,
}

impl JsonRpcError {
    /// Creates a new error response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // JsonRpcErrorData contains String
    pub fn new(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            error,
        }
    }

    /// Creates a parse error response (ID cannot be determined).
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(
            None,
            JsonRpcErrorData::from_code(ErrorCode::ParseError)
                .with_data("Invalid JSON received by server."),
        )
    }

    /// Creates an invalid request error response.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>) -> Self {
        Self::new(
            id,
            JsonRpcErrorData::from_code(ErrorCode::InvalidRequest)
                .with_data("The JSON sent is not a valid Request object."),
        )
    }

    /// Creates a method not found error response.
    ///
    /// The offending method name is echoed in `data`.
    #[must_use]
    pub fn method_not_found(id: Option<RequestId>, method: &str) -> Self {
        Self::new(
            id,
            JsonRpcErrorData::from_code(ErrorCode::MethodNotFound).with_data(format!(
                "The method '{method}' is not supported by this server."
            )),
        )
    }

    /// Creates an application error response with a category message.
    #[must_use]
    pub fn application(
        id: Option<RequestId>,
        code: ErrorCode,
        category: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            JsonRpcErrorData::with_message(code, category).with_data(detail.into()),
        )
    }
}

/// A response envelope: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// A `result` envelope.
    Success(JsonRpcResponse),
    /// An `error` envelope.
    Error(JsonRpcError),
}

impl Response {
    /// Returns the ID echoed by this response.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Success(resp) => resp.id.as_ref(),
            Self::Error(err) => err.id.as_ref(),
        }
    }

    /// Returns the error object if this is an error envelope.
    #[must_use]
    pub const fn error(&self) -> Option<&JsonRpcErrorData> {
        match self {
            Self::Success(_) => None,
            Self::Error(err) => Some(&err.error),
        }
    }

    /// Returns the result value if this is a success envelope.
    #[must_use]
    pub const fn result(&self) -> Option<&Value> {
        match self {
            Self::Success(resp) => Some(&resp.result),
            Self::Error(_) => None,
        }
    }

    /// Serialises the envelope to a single-line JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<JsonRpcResponse> for Response {
    fn from(resp: JsonRpcResponse) -> Self {
        Self::Success(resp)
    }
}

impl From<JsonRpcError> for Response {
    fn from(err: JsonRpcError) -> Self {
        Self::Error(err)
    }
}

/// Decodes one frame of JSON text into a value.
///
/// # Errors
///
/// Returns a parse error response (with `id: null`) if the text is not JSON.
pub fn decode_json(text: &str) -> Result<Value, JsonRpcError> {
    serde_json::from_str(text).map_err(|_| JsonRpcError::parse_error())
}

/// Classifies a decoded JSON value as a request or notification.
///
/// Returns `Err(Some(error))` for malformed requests that carried an `id`
/// member and `Err(None)` for malformed messages that did not, since those
/// must not be answered.
pub fn classify(value: Value) -> Result<IncomingMessage, Option<JsonRpcError>> {
    let Value::Object(mut obj) = value else {
        return Err(Some(JsonRpcError::invalid_request(None)));
    };

    let has_id = obj.contains_key("id");
    let id = match obj.get("id").map(RequestId::from_value) {
        None | Some(Ok(None)) => None,
        Some(Ok(id)) => id,
        Some(Err(())) => return Err(Some(JsonRpcError::invalid_request(None))),
    };

    let reject = |id: Option<RequestId>| {
        if has_id {
            Some(JsonRpcError::invalid_request(id))
        } else {
            None
        }
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(reject(id));
    }

    let method = match obj.remove("method") {
        Some(Value::String(method)) if !method.is_empty() => method,
        _ => return Err(reject(id)),
    };
    let params = obj.remove("params");

    if has_id {
        Ok(IncomingMessage::Request(JsonRpcRequest { id, method, params }))
    } else {
        Ok(IncomingMessage::Notification(JsonRpcNotification { method, params }))
    }
}

/// Returns the parameters as an object, treating absent or `null` params as
/// an empty object.
///
/// Returns `None` if params are present but not an object.
#[must_use]
pub fn params_object(params: Option<&Value>) -> Option<Map<String, Value>> {
    match params {
        None | Some(Value::Null) => Some(Map::new()),
        Some(Value::Object(map)) => Some(map.clone()),
        Some(_) => None,
    }
}

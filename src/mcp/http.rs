//! HTTP transport: one JSON-RPC message per `POST /`.
//!
//! | Outcome                                  | Status | Body               |
//! |------------------------------------------|--------|--------------------|
//! | Request (answered, including RPC errors) | 200    | response envelope  |
//! | Notification or malformed notification   | 204    | empty              |
//! | Body is not JSON (or empty)              | 400    | parse error        |
//! | `Content-Type` is not `application/json` | 415    | invalid request    |

use std::io;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;

use crate::mcp::protocol::{decode_json, ErrorCode, JsonRpcError, JsonRpcErrorData, Response};
use crate::mcp::server::ServerCore;
use crate::shutdown::ShutdownSignal;

/// Default listening port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Builds the router serving `core` at `POST /`.
#[must_use]
pub fn router(core: Arc<ServerCore>) -> Router {
    Router::new()
        .route("/", post(handle_message))
        .with_state(core)
}

/// Serves `core` on `listener` until `shutdown` fires.
///
/// In-flight requests are allowed to finish before this returns.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve(
    listener: TcpListener,
    core: Arc<ServerCore>,
    mut shutdown: ShutdownSignal,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP transport listening");
    }

    axum::serve(listener, router(core))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("HTTP transport stopped");
    Ok(())
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("application/json"))
}

fn reply(status: StatusCode, response: Response) -> HttpResponse {
    (status, Json(response)).into_response()
}

async fn handle_message(
    State(core): State<Arc<ServerCore>>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    if !is_json(&headers) {
        tracing::debug!(
            content_type = ?headers.get(header::CONTENT_TYPE),
            "Rejected request with wrong content type"
        );
        let error = JsonRpcError::new(
            None,
            JsonRpcErrorData::from_code(ErrorCode::InvalidRequest)
                .with_data("Content-Type must be application/json."),
        );
        return reply(StatusCode::UNSUPPORTED_MEDIA_TYPE, error.into());
    }

    let decoded = std::str::from_utf8(&body)
        .map_err(|_| JsonRpcError::parse_error())
        .and_then(decode_json);
    let value = match decoded {
        Ok(value) => value,
        Err(error) => {
            tracing::debug!(bytes = body.len(), "Rejected body that is not JSON");
            return reply(StatusCode::BAD_REQUEST, error.into());
        }
    };

    match core.dispatch(value).await {
        Some(response) => reply(StatusCode::OK, response),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::registry::{HandlerError, Tool, ToolRegistry};
    use crate::shutdown::Shutdown;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Map, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    async fn echo(args: Map<String, Value>) -> Result<Value, HandlerError> {
        let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
        Ok(json!(format!("echo: {message}")))
    }

    fn core() -> Arc<ServerCore> {
        let mut tools = ToolRegistry::new();
        tools.register(Tool::new("echo", "Echo", echo));
        Arc::new(ServerCore::default().with_tools(tools))
    }

    async fn post_body(content_type: Option<&str>, body: &str) -> (StatusCode, Vec<u8>) {
        let mut request = Request::builder().method("POST").uri("/");
        if let Some(content_type) = content_type {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        let request = request.body(Body::from(body.to_string())).unwrap();

        let response = router(core()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn post_json(body: &str) -> (StatusCode, Value) {
        let (status, bytes) = post_body(Some("application/json"), body).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn request_is_answered_with_200() {
        let (status, body) = post_json(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"message":"hi"}}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["content"][0]["text"], "echo: hi");
    }

    #[tokio::test]
    async fn rpc_errors_still_use_200() {
        let (status, body) = post_json(r#"{"jsonrpc":"2.0","id":"x","method":"nope"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "x");
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notifications_get_204() {
        let (status, body) = post_body(
            Some("application/json"),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());

        let (status, _) = post_body(Some("application/json"), r#"{"jsonrpc":"2.0"}"#).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn bad_json_is_400() {
        for body in ["{oops", ""] {
            let (status, body) = post_json(body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["id"], Value::Null);
            assert_eq!(body["error"]["code"], -32700);
        }
    }

    #[tokio::test]
    async fn content_type_is_checked() {
        let (status, bytes) = post_body(Some("text/plain"), r#"{"jsonrpc":"2.0","id":1}"#).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["id"], Value::Null);
        assert_eq!(body["error"]["code"], -32600);
        assert_eq!(body["error"]["data"], "Content-Type must be application/json.");

        let (status, _) = post_body(None, "{}").await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let (status, _) = post_body(
            Some("Application/JSON; charset=utf-8"),
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn only_post_is_routed() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = router(core()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn serves_over_tcp_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let server = tokio::spawn(serve(listener, core(), shutdown.signal()));

        let body = r#"{"jsonrpc":"2.0","id":5,"method":"tools/list"}"#;
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST / HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
        assert!(raw.contains(r#""name":"echo""#), "{raw}");

        shutdown.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

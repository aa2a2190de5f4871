//! Integration tests for MCP protocol handling.
//!
//! These tests drive the dispatcher with the built-in capabilities, the way
//! either transport does, and check the JSON that goes back on the wire.

use device_mcp::capabilities;
use device_mcp::mcp::server::{ServerCore, ServerInfo};
use device_mcp::mcp::MCP_PROTOCOL_VERSION;
use serde_json::{json, Value};

fn core() -> ServerCore {
    capabilities::server_core(ServerInfo::default())
}

async fn call(core: &ServerCore, message: Value) -> Option<Value> {
    core.dispatch(message)
        .await
        .map(|response| serde_json::to_value(response).unwrap())
}

async fn request(core: &ServerCore, id: Value, method: &str, params: Value) -> Value {
    call(
        core,
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}),
    )
    .await
    .expect("request must be answered")
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_initialize_announces_capabilities() {
    let core = core();
    let response = request(&core, json!(1), "initialize", json!({})).await;

    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 1);
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
    assert_eq!(result["serverInfo"]["name"], "MicroPython MCP Server");
    assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
    assert_eq!(result["capabilities"]["resources"]["subscribe"], false);
    assert!(result["capabilities"]["prompts"].is_object());
}

#[tokio::test]
async fn test_string_ids_are_echoed() {
    let core = core();
    let response = request(&core, json!("abc-1"), "tools/list", json!({})).await;
    assert_eq!(response["id"], "abc-1");
    assert!(response.get("error").is_none());
}

#[tokio::test]
async fn test_notifications_get_no_response() {
    let core = core();
    for method in ["notifications/initialized", "tools/list", "no/such/method"] {
        let response = call(&core, json!({"jsonrpc": "2.0", "method": method})).await;
        assert!(response.is_none(), "{method} was answered");
    }
}

#[tokio::test]
async fn test_exactly_one_response_per_request() {
    let core = core();
    let messages = [
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        json!({"jsonrpc": "2.0", "id": 3, "method": "bogus"}),
        json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {"name": "nope"}}),
    ];

    let mut ids = Vec::new();
    for message in messages {
        if let Some(response) = call(&core, message).await {
            ids.push(response["id"].clone());
        }
    }
    assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4)]);
}

// =============================================================================
// Malformed input
// =============================================================================

#[tokio::test]
async fn test_invalid_json_is_parse_error() {
    let core = core();
    let response = core.handle_frame("{not json").await.unwrap();
    let response = serde_json::to_value(response).unwrap();
    assert_eq!(response["id"], Value::Null);
    assert_eq!(response["error"]["code"], -32700);
    assert_eq!(response["error"]["message"], "Parse error");
}

#[tokio::test]
async fn test_invalid_requests() {
    let core = core();

    let response = call(&core, json!([1, 2, 3])).await.unwrap();
    assert_eq!(response["error"]["code"], -32600);
    assert_eq!(response["id"], Value::Null);

    let response = call(&core, json!({"jsonrpc": "1.0", "id": 7, "method": "initialize"}))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], -32600);
    assert_eq!(response["id"], 7);

    let response = call(&core, json!({"jsonrpc": "2.0", "id": 8, "method": 42}))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], -32600);
    assert_eq!(response["id"], 8);
}

#[tokio::test]
async fn test_unknown_method() {
    let core = core();
    let response = request(&core, json!(5), "does/not/exist", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);
    assert_eq!(response["error"]["message"], "Method Not Found");
    assert!(response["error"]["data"]
        .as_str()
        .unwrap()
        .contains("does/not/exist"));
}

// =============================================================================
// Tools
// =============================================================================

#[tokio::test]
async fn test_tools_list_in_registration_order() {
    let core = core();
    let response = request(&core, json!(1), "tools/list", json!({})).await;
    let names: Vec<&str> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["echo", "add", "info"]);
    assert_eq!(
        response["result"]["tools"][0]["inputSchema"]["required"],
        json!(["message"])
    );
}

#[tokio::test]
async fn test_echo_tool() {
    let core = core();
    let response = request(
        &core,
        json!(2),
        "tools/call",
        json!({"name": "echo", "arguments": {"message": "hi"}}),
    )
    .await;

    assert_eq!(
        response["result"],
        json!({"content": [{"type": "text", "text": "echo: hi"}], "isError": false})
    );
}

#[tokio::test]
async fn test_add_tool_positional_arguments() {
    let core = core();
    let response = request(
        &core,
        json!(3),
        "tools/call",
        json!({"name": "add", "arguments": [2, 3.5]}),
    )
    .await;
    assert_eq!(response["result"]["content"][0]["text"], "5.5");
    assert_eq!(response["result"]["isError"], false);
}

#[tokio::test]
async fn test_unknown_tool_is_invalid_params() {
    let core = core();
    let response = request(&core, json!(4), "tools/call", json!({"name": "nope"})).await;
    assert_eq!(response["error"]["code"], -32602);
    assert!(response["error"]["data"]
        .as_str()
        .unwrap()
        .contains("Tool 'nope' not found."));
}

#[tokio::test]
async fn test_missing_tool_name() {
    let core = core();
    let response = request(&core, json!(4), "tools/call", json!({"arguments": {}})).await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn test_failing_tool_reports_is_error() {
    let core = core();
    let response = request(
        &core,
        json!(5),
        "tools/call",
        json!({"name": "add", "arguments": {"a": "x", "b": 1}}),
    )
    .await;

    assert!(response.get("error").is_none());
    assert_eq!(response["result"]["isError"], true);
    assert!(response["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("Invalid number input"));
}

// =============================================================================
// Resources
// =============================================================================

#[tokio::test]
async fn test_read_device_info() {
    let core = core();
    let response = request(
        &core,
        json!(6),
        "resources/read",
        json!({"uri": capabilities::DEVICE_INFO_URI}),
    )
    .await;

    let content = &response["result"]["contents"][0];
    assert_eq!(content["uri"], capabilities::DEVICE_INFO_URI);
    assert_eq!(content["mimeType"], "text/plain");
    assert!(content["text"].as_str().unwrap().contains("version:"));
}

#[tokio::test]
async fn test_read_unknown_resource() {
    let core = core();
    let response = request(&core, json!(7), "resources/read", json!({"uri": "mcp://nope"})).await;
    assert_eq!(response["error"]["code"], -32001);
    assert_eq!(response["error"]["message"], "Resource Error");
}

#[tokio::test]
async fn test_subscribe_and_unsubscribe() {
    let core = core();

    let known = request(
        &core,
        json!(8),
        "resources/subscribe",
        json!({"uri": capabilities::DEVICE_INFO_URI}),
    )
    .await;
    assert_eq!(known["result"], json!({}));

    let unknown = request(
        &core,
        json!(9),
        "resources/subscribe",
        json!({"uri": "mcp://nope"}),
    )
    .await;
    assert_eq!(unknown["error"]["code"], -32001);
    assert_eq!(unknown["error"]["message"], "Subscription Error");

    let unsubscribe = request(
        &core,
        json!(10),
        "resources/unsubscribe",
        json!({"uri": "mcp://never-subscribed"}),
    )
    .await;
    assert_eq!(unsubscribe["result"], json!({}));

    let missing = request(&core, json!(11), "resources/unsubscribe", json!({})).await;
    assert_eq!(missing["error"]["code"], -32602);
}

#[tokio::test]
async fn test_subscribe_rejects_bad_uri() {
    let core = core();

    for (id, params) in [(12, json!({"uri": 5})), (13, json!({}))] {
        let response = request(&core, json!(id), "resources/subscribe", params).await;
        assert_eq!(response["id"], id);
        assert_eq!(response["error"]["code"], -32602);
        assert_eq!(response["error"]["message"], "Invalid Params");
        assert_eq!(
            response["error"]["data"],
            "Missing or invalid 'uri' parameter (must be a string)."
        );
    }
}

// =============================================================================
// Prompts
// =============================================================================

#[tokio::test]
async fn test_prompts_list_and_get() {
    let core = core();

    let list = request(&core, json!(12), "prompts/list", json!({})).await;
    assert_eq!(list["result"]["prompts"][0]["name"], "example_prompt");
    assert_eq!(list["result"]["prompts"][0]["arguments"][0]["required"], true);

    let get = request(
        &core,
        json!(13),
        "prompts/get",
        json!({"name": "example_prompt", "arguments": {"topic": "rust"}}),
    )
    .await;
    assert_eq!(
        get["result"]["messages"][0]["content"]["text"],
        "Tell me more about rust."
    );

    let unknown = request(&core, json!(14), "prompts/get", json!({"name": "nope"})).await;
    assert_eq!(unknown["error"]["code"], -32001);
    assert_eq!(unknown["error"]["message"], "Prompt Error");
}

#[tokio::test]
async fn test_missing_registry_is_configuration_error() {
    let core = ServerCore::new(ServerInfo::default());
    let response = request(&core, json!(15), "tools/list", json!({})).await;
    assert_eq!(response["error"]["code"], -32000);
    assert_eq!(response["error"]["message"], "Server Configuration Error");
    assert_eq!(response["error"]["data"], "Tool registry not available.");
}

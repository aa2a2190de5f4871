//! Built-in tools, resources and prompts registered at startup.

use serde_json::{json, Map, Value};

use crate::mcp::registry::{
    HandlerError, Prompt, PromptRegistry, Resource, ResourceContent, ResourceRegistry, Tool,
    ToolRegistry,
};
use crate::mcp::server::{ServerCore, ServerInfo};

/// URI of the device information resource.
pub const DEVICE_INFO_URI: &str = "mcp://device/info";

async fn echo(args: Map<String, Value>) -> Result<Value, HandlerError> {
    let message = args
        .get("message")
        .and_then(Value::as_str)
        .ok_or("Missing required argument 'message'.")?;
    Ok(Value::String(format!("echo: {message}")))
}

fn number(args: &Map<String, Value>, name: &str) -> Result<f64, HandlerError> {
    let value = args
        .get(name)
        .ok_or_else(|| HandlerError::new(format!("Missing required argument '{name}'.")))?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| HandlerError::new("Invalid number input for 'add' tool."))
}

async fn add(args: Map<String, Value>) -> Result<Value, HandlerError> {
    let sum = number(&args, "a")? + number(&args, "b")?;
    Ok(json!(sum))
}

async fn info(_: Map<String, Value>) -> Result<Value, HandlerError> {
    Ok(Value::String(format!(
        "This is a device MCP server, version {}.",
        env!("CARGO_PKG_VERSION")
    )))
}

/// Registers the built-in tools.
#[must_use]
pub fn tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(
            Tool::new("echo", "Echoes back the provided message.", echo).required_property(
                "message",
                json!({"type": "string", "description": "The message to be echoed"}),
            ),
        )
        .register(
            Tool::new("add", "Adds two numbers provided as 'a' and 'b'.", add)
                .required_property(
                    "a",
                    json!({"type": "number", "description": "The first number."}),
                )
                .required_property(
                    "b",
                    json!({"type": "number", "description": "The second number."}),
                )
                .positional(["a", "b"]),
        )
        .register(
            Tool::new("info", "Provides static information about the server.", info).no_args(),
        );
    registry
}

/// Registers the built-in resources.
#[must_use]
pub fn resources(server: &ServerInfo) -> ResourceRegistry {
    let summary = format!(
        "name: {}\nversion: {}\ntransports: stdio, ble\nos: {}\narch: {}\n",
        server.name,
        server.version,
        std::env::consts::OS,
        std::env::consts::ARCH,
    );

    let mut registry = ResourceRegistry::new();
    registry.register(
        Resource::new(DEVICE_INFO_URI, "Device Information", move |_uri: String| {
            let summary = summary.clone();
            async move { Ok::<_, HandlerError>(ResourceContent::Text(summary)) }
        })
        .description("Server and platform summary.")
        .mime_type("text/plain"),
    );
    registry
}

async fn example_prompt(_name: String, args: Map<String, Value>) -> Result<Value, HandlerError> {
    let topic = args
        .get("topic")
        .and_then(Value::as_str)
        .unwrap_or("a default topic");
    Ok(json!({
        "description": format!("A dynamically generated prompt about {topic}"),
        "messages": [{
            "role": "user",
            "content": {"type": "text", "text": format!("Tell me more about {topic}.")},
        }],
    }))
}

/// Registers the built-in prompts.
#[must_use]
pub fn prompts() -> PromptRegistry {
    let mut registry = PromptRegistry::new();
    registry.register(
        Prompt::new(
            "example_prompt",
            "A sample prompt that can discuss a topic.",
            example_prompt,
        )
        .argument("topic", "The topic for the prompt", true),
    );
    registry
}

/// Builds a dispatcher with every built-in capability.
#[must_use]
pub fn server_core(info: ServerInfo) -> ServerCore {
    let resources = resources(&info);
    ServerCore::new(info)
        .with_tools(tools())
        .with_resources(resources)
        .with_prompts(prompts())
}

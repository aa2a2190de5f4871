//! Model Context Protocol (MCP) server implementation.
//!
//! The dispatcher ([`ServerCore`]) takes one decoded JSON-RPC message and
//! returns at most one response. It knows nothing about transports; the
//! console transport, the HTTP endpoint in [`http`] and the BLE server in
//! [`crate::ble`] all feed it complete messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         MCP Server                           │
//! │                                                              │
//! │   ┌─────────────┐    ┌─────────────┐    ┌──────────────┐     │
//! │   │  Transport  │───▶│ ServerCore  │───▶│  Registries  │     │
//! │   │ (stdio/...) │    │ (dispatch)  │    │ (tools, ...) │     │
//! │   └─────────────┘    └─────────────┘    └──────────────┘     │
//! │          │                  │                   │            │
//! │          ▼                  ▼                   ▼            │
//! │   ┌──────────────────────────────────────────────────┐       │
//! │   │                JSON-RPC Messages                 │       │
//! │   └──────────────────────────────────────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2025-03-26.

pub mod http;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Response, MCP_PROTOCOL_VERSION};
pub use registry::{PromptRegistry, ResourceRegistry, ToolRegistry};
pub use server::{ServerCore, ServerInfo};
pub use transport::ConsoleTransport;

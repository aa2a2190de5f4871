//! device-mcp: Model Context Protocol server for small devices
//!
//! Exposes tools, resources and prompts to AI assistants over JSON-RPC 2.0,
//! on the console, over HTTP or over a BLE GATT link.
//!
//! # Architecture
//!
//! One transport-agnostic dispatcher serves every transport:
//!
//! - **Console**: newline-delimited JSON-RPC on stdin/stdout
//! - **HTTP**: one JSON-RPC message per `POST /`
//! - **BLE**: a Nordic UART style GATT service; writes are reassembled into
//!   frames and responses are notified back in MTU-sized chunks
//!
//! # Modules
//!
//! - [`mcp`] — JSON-RPC types, capability registries, dispatcher, console and HTTP transports
//! - [`ble`] — GATT framing, connection lifecycle, peripheral backends
//! - [`capabilities`] — Built-in tools, resources and prompts
//! - [`config`] — Configuration loading and validation
//! - [`error`] — Error types
//! - [`shutdown`] — Cooperative cancellation

pub mod ble;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod mcp;
pub mod shutdown;

//! Line-oriented console transport.
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stdin: receives messages from the client
//! - stdout: sends responses to the client
//! - stderr: may be used for logging (not MCP messages)
//!
//! The transport is generic over its reader and writer so the same loop runs
//! against stdin/stdout in production and in-memory streams in tests.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::mcp::protocol::Response;
use crate::mcp::server::ServerCore;
use crate::shutdown::ShutdownSignal;

/// A newline-delimited JSON-RPC transport.
pub struct ConsoleTransport<R, W> {
    reader: R,
    writer: W,
}

impl ConsoleTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    /// Creates a transport over the process's stdin and stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> ConsoleTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a transport over the given streams.
    pub const fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Reads the next message line.
    ///
    /// Returns `None` at end of input.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }

    /// Writes a response as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    pub async fn write_response(&mut self, response: &Response) -> io::Result<()> {
        let json = response
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        self.write_raw(&json).await
    }

    async fn write_raw(&mut self, json: &str) -> io::Result<()> {
        debug_assert!(
            !json.contains('\n'),
            "JSON message must not contain embedded newlines"
        );

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Handles one input line, writing the response if there is one.
    async fn handle_line(&mut self, core: &ServerCore, line: &str) -> io::Result<()> {
        if let Some(response) = core.handle_frame(line).await {
            self.write_response(&response).await?;
        }
        Ok(())
    }

    /// Serves requests until end of input or until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn run(&mut self, core: &ServerCore, mut shutdown: ShutdownSignal) -> io::Result<()> {
        tracing::info!("Console transport ready, waiting for requests");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("Console transport stopping");
                    return Ok(());
                }

                line = self.read_line() => {
                    let Some(line) = line? else {
                        tracing::info!("Console input closed");
                        return Ok(());
                    };
                    self.handle_line(core, &line).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcResponse, RequestId};
    use crate::mcp::registry::{HandlerError, Tool, ToolRegistry};
    use crate::shutdown::Shutdown;
    use serde_json::{json, Map, Value};
    use tokio_test::io::Builder;

    async fn echo(args: Map<String, Value>) -> Result<Value, HandlerError> {
        let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
        Ok(json!(format!("echo: {message}")))
    }

    fn core() -> ServerCore {
        let mut tools = ToolRegistry::new();
        tools.register(Tool::new("echo", "Echo", echo));
        ServerCore::default().with_tools(tools)
    }

    #[tokio::test]
    async fn answers_requests_line_by_line() {
        let request = r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"message":"hi"}}}"#;
        let expected = r#"{"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"echo: hi"}],"isError":false}}"#;

        let reader = Builder::new().read(format!("{request}\n").as_bytes()).build();
        let writer = Builder::new()
            .write(expected.as_bytes())
            .write(b"\n")
            .build();

        let shutdown = Shutdown::new();
        let mut transport = ConsoleTransport::new(BufReader::new(reader), writer);
        transport.run(&core(), shutdown.signal()).await.unwrap();
    }

    #[tokio::test]
    async fn skips_blank_lines_and_notifications() {
        let input = "\n   \r\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n";
        let reader = Builder::new().read(input.as_bytes()).build();
        // No writes are expected; the mock panics on any unexpected write.
        let writer = Builder::new().build();

        let shutdown = Shutdown::new();
        let mut transport = ConsoleTransport::new(BufReader::new(reader), writer);
        transport.run(&core(), shutdown.signal()).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_json_gets_parse_error() {
        let expected = r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error","data":"Invalid JSON received by server."}}"#;
        let reader = Builder::new().read(b"{oops\r\n").build();
        let writer = Builder::new()
            .write(expected.as_bytes())
            .write(b"\n")
            .build();

        let shutdown = Shutdown::new();
        let mut transport = ConsoleTransport::new(BufReader::new(reader), writer);
        transport.run(&core(), shutdown.signal()).await.unwrap();
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (reader, _keep_open) = tokio::io::duplex(64);
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let mut transport = ConsoleTransport::new(BufReader::new(reader), tokio::io::sink());
        transport.run(&core(), shutdown.signal()).await.unwrap();
    }

    #[test]
    fn serialised_responses_have_no_newlines() {
        let response: Response = JsonRpcResponse::success(
            Some(RequestId::from(1)),
            json!({"message": "hello\nworld", "nested": {"key": "value"}}),
        )
        .into();
        let json = response.to_json().unwrap();
        assert!(!json.contains('\n'));
    }
}

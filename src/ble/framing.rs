//! Frame reassembly and chunked transmission for the BLE link.
//!
//! A single ATT write carries only a few tens of bytes, so a client splits
//! each JSON-RPC message across many writes and marks its end with a
//! terminator byte. [`ConnectionContext`] accumulates writes for one link
//! and yields a [`Frame`] when the terminator arrives.
//!
//! Responses travel the other way as a sequence of notifications, each at
//! most the link payload size. The receiver concatenates notification
//! payloads in delivery order.
//!
//! The terminator has no escape mechanism. It must never appear inside a
//! legitimate payload.

use super::peripheral::{BleError, Link, LinkHandle};

/// Default frame terminator.
pub const DEFAULT_TERMINATOR: u8 = b'\n';

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// One reassembled inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The frame body, terminator excluded.
    Text(String),
    /// The frame body was not valid UTF-8.
    InvalidUtf8 {
        /// Length of the rejected body in bytes.
        len: usize,
    },
    /// The frame outgrew the size limit and was dropped.
    Oversized {
        /// Bytes buffered when the limit was hit.
        len: usize,
    },
}

/// Receive-side state for one physical link.
///
/// Created when a link is accepted and dropped when it goes away, so no
/// partial frame ever outlives its link.
#[derive(Debug)]
pub struct ConnectionContext {
    link_handle: LinkHandle,
    receive_buffer: Vec<u8>,
    is_active: bool,
    terminator: u8,
    max_frame_len: usize,
    discarding: bool,
}

impl ConnectionContext {
    /// Creates the context for a freshly accepted link.
    #[must_use]
    pub const fn new(link_handle: LinkHandle, terminator: u8) -> Self {
        Self {
            link_handle,
            receive_buffer: Vec::new(),
            is_active: true,
            terminator,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            discarding: false,
        }
    }

    /// Sets the largest accepted frame body.
    #[must_use]
    pub const fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Returns the link this context belongs to.
    #[must_use]
    pub const fn link_handle(&self) -> LinkHandle {
        self.link_handle
    }

    /// Returns `true` until the link has been closed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.is_active
    }

    /// Returns the number of buffered bytes of the pending frame.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.receive_buffer.len()
    }

    /// Appends one inbound write and returns the frame it completes, if any.
    ///
    /// Everything before the first terminator is the frame body. The buffer
    /// is then emptied; bytes that followed the terminator in the same write
    /// are discarded.
    ///
    /// A frame longer than the size limit yields [`Frame::Oversized`] once;
    /// the rest of it, up to and including its terminator, is skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Option<Frame> {
        if !self.is_active {
            return None;
        }

        if self.discarding {
            if bytes.contains(&self.terminator) {
                self.discarding = false;
            }
            return None;
        }

        self.receive_buffer.extend_from_slice(bytes);

        let Some(pos) = self
            .receive_buffer
            .iter()
            .position(|&b| b == self.terminator)
        else {
            if self.receive_buffer.len() > self.max_frame_len {
                return Some(self.overflow(true));
            }
            return None;
        };

        if pos > self.max_frame_len {
            return Some(self.overflow(false));
        }

        let trailing = self.receive_buffer.len() - pos - 1;
        if trailing > 0 {
            tracing::debug!(
                link = %self.link_handle,
                bytes = trailing,
                "Discarding bytes after frame terminator"
            );
        }

        let mut body = std::mem::take(&mut self.receive_buffer);
        body.truncate(pos);

        tracing::trace!(link = %self.link_handle, bytes = body.len(), "Frame complete");

        Some(match String::from_utf8(body) {
            Ok(text) => Frame::Text(text),
            Err(e) => Frame::InvalidUtf8 {
                len: e.as_bytes().len(),
            },
        })
    }

    fn overflow(&mut self, skip_rest: bool) -> Frame {
        let len = self.receive_buffer.len();
        tracing::warn!(
            link = %self.link_handle,
            bytes = len,
            max = self.max_frame_len,
            "Frame exceeds size limit, dropping it"
        );
        self.receive_buffer = Vec::new();
        self.discarding = skip_rest;
        Frame::Oversized { len }
    }

    /// Drops any partial frame and marks the context closed.
    pub fn close(&mut self) {
        if !self.receive_buffer.is_empty() {
            tracing::debug!(
                link = %self.link_handle,
                bytes = self.receive_buffer.len(),
                "Discarding partial frame"
            );
        }
        self.receive_buffer.clear();
        self.is_active = false;
    }
}

/// Serialised response bytes, optionally followed by the terminator.
#[must_use]
pub fn encode_response(json: &str, terminator: Option<u8>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(json.len() + 1);
    bytes.extend_from_slice(json.as_bytes());
    if let Some(t) = terminator {
        bytes.push(t);
    }
    bytes
}

/// Splits `payload` into consecutive chunks of at most `chunk_size` bytes.
///
/// A `chunk_size` of zero is treated as one.
pub fn chunks(payload: &[u8], chunk_size: usize) -> std::slice::Chunks<'_, u8> {
    payload.chunks(chunk_size.max(1))
}

/// Reassembles notification payloads received in delivery order.
#[must_use]
pub fn reassemble<'a, I>(notifications: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    notifications.into_iter().flatten().copied().collect()
}

/// Sends `payload` as a sequence of notifications.
///
/// Returns the number of notifications sent.
///
/// # Errors
///
/// Stops at the first failed notification and returns its error.
pub async fn send_chunked(
    link: &dyn Link,
    payload: &[u8],
    chunk_size: usize,
) -> Result<usize, BleError> {
    let mut sent = 0;
    for chunk in chunks(payload, chunk_size) {
        link.notify(chunk).await?;
        sent += 1;
    }
    tracing::trace!(bytes = payload.len(), chunks = sent, "Notified response");
    Ok(sent)
}

/// Lossy view of a frame body for logging.
#[must_use]
pub fn preview(bytes: &[u8], limit: usize) -> String {
    let end = bytes.len().min(limit);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    fn ctx() -> ConnectionContext {
        ConnectionContext::new(LinkHandle(1), DEFAULT_TERMINATOR)
    }

    #[test]
    fn waits_for_terminator() {
        let mut ctx = ctx();
        assert_eq!(ctx.push(br#"{"jsonrpc":"2.0","#), None);
        assert_eq!(ctx.pending_len(), 17);
        assert_eq!(
            ctx.push(b"\"id\":1}\n"),
            Some(Frame::Text(r#"{"jsonrpc":"2.0","id":1}"#.to_string()))
        );
        assert_eq!(ctx.pending_len(), 0);
    }

    #[test]
    fn trailing_bytes_are_discarded() {
        let mut ctx = ctx();
        assert_eq!(ctx.push(b"{}\n{\"partial"), Some(Frame::Text("{}".into())));
        assert_eq!(ctx.pending_len(), 0);
    }

    #[test]
    fn terminator_alone_is_empty_frame() {
        let mut ctx = ctx();
        assert_eq!(ctx.push(b"\n"), Some(Frame::Text(String::new())));
    }

    #[test]
    fn custom_terminator() {
        let mut ctx = ConnectionContext::new(LinkHandle(2), b'\x04');
        assert_eq!(ctx.push(b"a\nb"), None);
        assert_eq!(ctx.push(b"\x04"), Some(Frame::Text("a\nb".into())));
    }

    #[test]
    fn multibyte_split_across_writes() {
        let text = "{\"m\":\"h\u{e9}llo\"}";
        let bytes = text.as_bytes();
        let split = text.find('\u{e9}').unwrap() + 1;
        let mut ctx = ctx();
        assert_eq!(ctx.push(&bytes[..split]), None);
        assert_eq!(ctx.push(&bytes[split..]), None);
        assert_eq!(ctx.push(b"\n"), Some(Frame::Text(text.into())));
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut ctx = ctx();
        assert_eq!(
            ctx.push(&[0xff, 0xfe, b'\n']),
            Some(Frame::InvalidUtf8 { len: 2 })
        );
        assert_eq!(ctx.pending_len(), 0);
    }

    #[test]
    fn oversized_frame_is_dropped_once() {
        let mut ctx = ctx().with_max_frame_len(8);
        assert_eq!(ctx.push(b"{\"a\":"), None);
        assert_eq!(ctx.push(b"\"0123"), Some(Frame::Oversized { len: 10 }));
        assert_eq!(ctx.pending_len(), 0);

        // The tail of the dropped frame produces nothing.
        assert_eq!(ctx.push(b"456789"), None);
        assert_eq!(ctx.push(b"\"}\n"), None);
        assert_eq!(ctx.pending_len(), 0);

        assert_eq!(ctx.push(b"{}\n"), Some(Frame::Text("{}".into())));
    }

    #[test]
    fn oversized_frame_in_one_write() {
        let mut ctx = ctx().with_max_frame_len(4);
        assert_eq!(ctx.push(b"0123456\n"), Some(Frame::Oversized { len: 8 }));
        assert_eq!(ctx.push(b"1234\n"), Some(Frame::Text("1234".into())));
    }

    #[test]
    fn close_discards_partial_frame() {
        let mut ctx = ctx();
        ctx.push(b"{\"jsonrpc\"");
        ctx.close();
        assert!(!ctx.is_active());
        assert_eq!(ctx.pending_len(), 0);
        assert_eq!(ctx.push(b"}\n"), None);
    }

    #[test]
    fn encode_appends_terminator() {
        assert_eq!(encode_response("{}", Some(b'\n')), b"{}\n");
        assert_eq!(encode_response("{}", None), b"{}");
    }

    #[test]
    fn chunk_sizes() {
        let payload = [0u8; 45];
        let sizes: Vec<_> = chunks(&payload, 20).map(<[u8]>::len).collect();
        assert_eq!(sizes, [20, 20, 5]);

        let exact = [0u8; 40];
        assert_eq!(chunks(&exact, 20).count(), 2);
        assert_eq!(chunks(&exact, 0).count(), 40);
        assert_eq!(chunks(&[], 20).count(), 0);
    }

    #[derive(Default)]
    struct Recorder {
        notifications: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Link for Recorder {
        async fn notify(&self, chunk: &[u8]) -> Result<(), BleError> {
            self.notifications.lock().unwrap().push(chunk.to_vec());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), BleError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_chunked_one_notify_per_chunk() {
        let link = Recorder::default();
        let payload = encode_response(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#, Some(b'\n'));

        let sent = send_chunked(&link, &payload, 20).await.unwrap();

        let notifications = link.notifications.lock().unwrap();
        assert_eq!(sent, notifications.len());
        assert!(notifications.iter().all(|n| n.len() <= 20));
        assert_eq!(reassemble(notifications.iter().map(Vec::as_slice)), payload);
    }

    #[test]
    fn preview_truncates() {
        assert_eq!(preview(b"hello world", 5), "hello");
        assert_eq!(preview(&[0xff, b'a'], 8), "\u{fffd}a");
    }
}

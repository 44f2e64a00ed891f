//! Span and event helpers for buffer operations.

use tracing::{Level, Span, span};

/// Create a span for an operation on one buffer.
///
/// # Example
///
/// ```rust,ignore
/// use hwbuffer::observability::span_buffer_op;
///
/// let _guard = span_buffer_op("lock", buffer.id()).entered();
/// ```
#[inline]
pub fn span_buffer_op(op: &'static str, buffer: u64) -> Span {
    span!(Level::DEBUG, "buffer_op", op = op, buffer = buffer)
}

/// Create a span for a send or receive on a socket.
#[inline]
pub fn span_transport(direction: &'static str, socket_fd: i32) -> Span {
    span!(Level::DEBUG, "transport", direction = direction, socket = socket_fd)
}

/// Log a completed handle transfer.
#[inline]
pub fn trace_transfer(direction: &'static str, buffer: u64, payload: usize, attachments: usize) {
    tracing::debug!(
        direction = direction,
        buffer = buffer,
        payload = payload,
        attachments = attachments,
        "buffer handle transferred"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        // Must not panic without a subscriber.
        let _span = span_buffer_op("lock", 1);
        let _guard = span_transport("send", 3).entered();
        trace_transfer("send", 1, 72, 2);
    }
}

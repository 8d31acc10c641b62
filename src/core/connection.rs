//! Connection seam and operation event plumbing
//!
//! The protocol core does not own transports. It talks to an opaque
//! [`Connection`] that queues commands towards the instrument, and it is
//! fed response fragments through an operation inbox by whatever layer owns
//! the wire. Exclusive command/response access (acquire/release) is the
//! caller's responsibility; the core assumes at most one in-flight command
//! per connection.

use tokio::sync::mpsc;

/// Per-command options forwarded to the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Whether the connection layer should record the command in its
    /// own console/terminal log.
    pub log: bool,
    /// Marks the command as part of a long-running operation, so the
    /// connection keeps routing response data to the active operation.
    pub long_operation: bool,
}

impl SendOptions {
    /// The options every operation in this crate sends with: unlogged,
    /// long-operation.
    pub fn long_operation() -> Self {
        Self {
            log: false,
            long_operation: true,
        }
    }
}

/// Command sink towards the instrument.
///
/// `send` is fire-and-forget; responses come back out-of-band through the
/// operation inbox. Commands are Latin-1 strings: every `char` in
/// `U+0000..=U+00FF` maps one-to-one to a wire byte. Implementations must
/// preserve that mapping, or arbitrary-block chunk data will be corrupted.
pub trait Connection: Send + Sync {
    /// Queue a command for transmission.
    fn send(&self, command: &str, options: SendOptions);
}

/// An event delivered to a running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    /// A raw response fragment from the instrument.
    Data(String),
    /// External cancellation request.
    Abort,
}

/// Sending half of an operation inbox, held by the connection plumbing.
#[derive(Debug, Clone)]
pub struct OperationSender {
    tx: mpsc::UnboundedSender<OperationEvent>,
}

impl OperationSender {
    /// Forward a response fragment to the operation. Fragments arriving
    /// after the operation completed are dropped silently.
    pub fn data(&self, chunk: &str) {
        let _ = self.tx.send(OperationEvent::Data(chunk.to_string()));
    }

    /// Request cooperative cancellation.
    pub fn abort(&self) {
        let _ = self.tx.send(OperationEvent::Abort);
    }
}

/// Receiving half of an operation inbox, consumed by the operation driver.
pub type OperationReceiver = mpsc::UnboundedReceiver<OperationEvent>;

/// Create the inbox pair connecting the wire plumbing to one operation.
pub fn operation_channel() -> (OperationSender, OperationReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OperationSender { tx }, rx)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inbox_delivers_in_order() {
        let (tx, mut rx) = operation_channel();
        tx.data("a");
        tx.abort();

        assert_eq!(rx.recv().await, Some(OperationEvent::Data("a".to_string())));
        assert_eq!(rx.recv().await, Some(OperationEvent::Abort));
    }

    #[test]
    fn test_send_after_receiver_dropped_is_silent() {
        let (tx, rx) = operation_channel();
        drop(rx);
        tx.data("late");
        tx.abort();
    }
}

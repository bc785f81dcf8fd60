use thiserror::Error;

/// Failure of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("could not establish connection: receiving end does not exist")]
    NoReceiver,
    #[error("connection closed before a response was received")]
    ConnectionClosed,
    #[error("the message port closed before a response was received")]
    PortClosed,
    #[error("no acknowledgment within {0} ms")]
    Timeout(u64),
    #[error("destination rejected the message: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Connection, port and timeout failures may succeed later; everything
    /// else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::NoReceiver
            | TransportError::ConnectionClosed
            | TransportError::PortClosed
            | TransportError::Timeout(_) => true,
            TransportError::Rejected(_) => false,
            TransportError::Other(msg) => is_retryable_message(msg),
        }
    }
}

/// Classify an opaque error string reported by a host transport.
pub fn is_retryable_message(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains("could not establish connection")
        || msg.contains("receiving end does not exist")
        || msg.contains("port closed")
        || msg.contains("connection closed")
        || msg.contains("timeout")
        || msg.contains("timed out")
}

/// Outcome reported to `send` callers when a message was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("delivery failed after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("destination {0} was cleaned up during delivery")]
    DestinationClosed(String),
}

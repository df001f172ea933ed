//! Error types for the stream ingester

use std::fmt;
use thiserror::Error;

/// Result type alias for ingester operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Main error type for the ingester
///
/// Only construction and lifecycle failures surface as `StreamError`.
/// Per-record failures stay inside the decoder worker.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A collaborator (writer, platform source) could not be constructed
    #[error("failed to construct {component}: {message}")]
    Construction { component: String, message: String },

    /// Sink error surfaced during shutdown
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// `start()` called on a logger that is not in the constructed state
    #[error("logger '{0}' already started")]
    AlreadyStarted(String),

    /// A worker task panicked or was aborted
    #[error("worker join error: {0}")]
    Join(String),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl StreamError {
    pub(crate) fn construction(component: impl Into<String>, message: impl fmt::Display) -> Self {
        StreamError::Construction {
            component: component.into(),
            message: message.to_string(),
        }
    }
}

/// Failure to decode one inbound frame
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Frame header or body runs past the end of the buffer
    #[error("truncated frame at offset {offset}: need {needed} bytes, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Protobuf body could not be parsed
    #[error("protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),

    /// Compressed body could not be inflated
    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    /// Compressed body inflates past the allowed size
    #[error("inflated body exceeds {limit} bytes")]
    Oversized { limit: usize },

    /// A field carried a value outside its domain
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Error type for write sink operations
#[derive(Error, Debug)]
pub enum SinkError {
    /// Write failed
    #[error("write failed: {0}")]
    Write(String),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The writer's batcher is gone
    #[error("writer '{0}' is closed")]
    Closed(&'static str),
}

/// Error type for platform metadata lookups and refreshes
#[derive(Error, Debug)]
pub enum PlatformError {
    /// No controller address answered
    #[error("no controller reachable: {0}")]
    Unreachable(String),

    /// Response exceeded the configured buffer budget
    #[error("response of {size} bytes exceeds buffer size {limit}")]
    TooLarge { size: usize, limit: usize },

    /// Response could not be parsed
    #[error("invalid platform data: {0}")]
    Invalid(String),
}

/// Enqueue failure; the rejected item is handed back to the producer
pub enum EnqueueError<T> {
    /// Partition at capacity under the `reject-new` policy
    Full { partition: usize, item: T },
    /// The queue set has been closed
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// Recover the item that was not enqueued
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full { item, .. } => item,
            EnqueueError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full { partition, .. } => {
                f.debug_struct("Full").field("partition", partition).finish()
            }
            EnqueueError::Closed(_) => f.write_str("Closed"),
        }
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full { partition, .. } => write!(f, "partition {partition} is full"),
            EnqueueError::Closed(_) => f.write_str("queue set closed"),
        }
    }
}

impl<T> std::error::Error for EnqueueError<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_error_into_stream_error() {
        let err: StreamError = SinkError::Closed("flow_log").into();
        assert!(matches!(err, StreamError::Sink(_)));
        assert_eq!(err.to_string(), "sink error: writer 'flow_log' is closed");
    }

    #[test]
    fn test_enqueue_error_returns_item() {
        let err = EnqueueError::Full {
            partition: 3,
            item: "payload",
        };
        assert_eq!(err.to_string(), "partition 3 is full");
        assert_eq!(err.into_inner(), "payload");
    }

    #[test]
    fn test_construction_error_message() {
        let err = StreamError::construction("flow_log writer", "bad address");
        assert_eq!(
            err.to_string(),
            "failed to construct flow_log writer: bad address"
        );
    }
}

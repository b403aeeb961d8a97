//! Error types for the KCP core protocol engine

use crate::protocol::DecodeError;
use std::fmt;

/// Result type for KCP core operations
pub type KcpCoreResult<T> = std::result::Result<T, KcpCoreError>;

/// Error types produced by the engine and its delivery queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KcpCoreError {
    /// Inbound packet could not be decoded; it was dropped
    MalformedPacket(DecodeError),
    /// Another receive (or send) is already outstanding on this queue
    ConcurrentOperation,
    /// Destination is smaller than the next datagram; the datagram stays queued
    BufferTooSmall { required: usize, available: usize },
    /// Datagram exceeds the maximum message size
    MessageTooLarge { size: usize, limit: usize },
    /// Transport closed; no further sends are possible
    ConnectionClosed,
    /// Conversation was disposed
    Disposed,
    /// A segment exceeded the retransmission limit; the conversation is dead
    MaxRetransmitExceeded,
}

impl KcpCoreError {
    /// Check if this is a fatal error that should stop the engine
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KcpCoreError::MaxRetransmitExceeded | KcpCoreError::Disposed
        )
    }

    /// Check if the error only concerns the call that produced it
    pub fn is_operation_error(&self) -> bool {
        matches!(
            self,
            KcpCoreError::ConcurrentOperation
                | KcpCoreError::BufferTooSmall { .. }
                | KcpCoreError::MessageTooLarge { .. }
        )
    }
}

impl From<DecodeError> for KcpCoreError {
    fn from(e: DecodeError) -> Self {
        KcpCoreError::MalformedPacket(e)
    }
}

impl fmt::Display for KcpCoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KcpCoreError::MalformedPacket(e) => write!(f, "Malformed packet: {e}"),
            KcpCoreError::ConcurrentOperation => {
                write!(f, "Another operation is already pending on this conversation")
            }
            KcpCoreError::BufferTooSmall { required, available } => write!(
                f,
                "Buffer too small: next message needs {required} bytes, {available} provided"
            ),
            KcpCoreError::MessageTooLarge { size, limit } => {
                write!(f, "Message of {size} bytes exceeds the {limit} byte limit")
            }
            KcpCoreError::ConnectionClosed => write!(f, "Connection closed"),
            KcpCoreError::Disposed => write!(f, "Conversation disposed"),
            KcpCoreError::MaxRetransmitExceeded => {
                write!(f, "Connection lost: retransmission limit exceeded")
            }
        }
    }
}

impl std::error::Error for KcpCoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KcpCoreError::MalformedPacket(e) => Some(e),
            _ => None,
        }
    }
}

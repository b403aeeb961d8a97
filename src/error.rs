//! Error types for KCP conversations.
//!
//! [`KcpError`] extends [`kcp_core::KcpCoreError`] with I/O, cancellation,
//! and configuration variants needed by the async runtime layer.

use kcp_core::{DecodeError, KcpCoreError};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KcpError>;

// ── Error types ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum KcpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(DecodeError),

    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionError },

    #[error("Another operation is already pending on this conversation")]
    ConcurrentOperation,

    #[error("Buffer too small: next message needs {required} bytes, {available} provided")]
    BufferTooSmall { required: usize, available: usize },

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Operation canceled")]
    Canceled,

    #[error("Configuration error: {message}")]
    Config { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// Transport closed or listener shut down
    Closed,
    /// Retransmission limit exceeded
    Lost,
    /// Conversation was disposed
    Disposed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Lost => write!(f, "connection lost"),
            Self::Disposed => write!(f, "conversation disposed"),
        }
    }
}

// ── Bridge: kcp-core errors → KcpError ──────────────────────────────────

impl From<KcpCoreError> for KcpError {
    fn from(e: KcpCoreError) -> Self {
        match e {
            KcpCoreError::MalformedPacket(e) => Self::MalformedPacket(e),
            KcpCoreError::ConcurrentOperation => Self::ConcurrentOperation,
            KcpCoreError::BufferTooSmall { required, available } => {
                Self::BufferTooSmall { required, available }
            }
            KcpCoreError::MessageTooLarge { size, limit } => Self::MessageTooLarge { size, limit },
            KcpCoreError::ConnectionClosed => Self::connection(ConnectionError::Closed),
            KcpCoreError::Disposed => Self::connection(ConnectionError::Disposed),
            KcpCoreError::MaxRetransmitExceeded => Self::connection(ConnectionError::Lost),
        }
    }
}

// ── Constructors ────────────────────────────────────────────────────────

impl KcpError {
    pub fn connection(kind: ConnectionError) -> Self {
        Self::Connection { kind }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}

// ── Predicates ──────────────────────────────────────────────────────────

impl KcpError {
    /// The failed call can be retried on the same conversation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            Self::BufferTooSmall { .. } | Self::Canceled | Self::ConcurrentOperation => true,
            _ => false,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// The conversation can no longer carry data.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                kind: ConnectionError::Lost | ConnectionError::Disposed
            }
        )
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Connection { kind } => matches!(kind, ConnectionError::Closed),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

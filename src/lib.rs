//! # KCP: reliable ARQ conversations over tokio
//!
//! An async implementation of the KCP (Fast and Reliable ARQ Protocol)
//! on top of any datagram transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  kcp  (this crate)                         │
//! │                                            │
//! │  KcpConversation / KcpListener  ← user API │
//! │  transport                      ← I/O      │
//! │  buffer_pool                    ← leases   │
//! ├────────────────────────────────────────────┤
//! │  kcp-core  (dependency)                    │
//! │                                            │
//! │  KcpEngine     ← pure sync state machine   │
//! │  send/receive  ← single-waiter queues      │
//! │  protocol      ← wire types & constants    │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kcp::{CancellationToken, KcpConfig, KcpConversation};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr: SocketAddr = "127.0.0.1:8080".parse()?;
//!     let config = KcpConfig::new().fast_mode();
//!     let conversation = KcpConversation::connect_udp(addr, 1, config).await?;
//!     let cancel = CancellationToken::new();
//!
//!     conversation.send(b"Hello, KCP!", &cancel).await?;
//!
//!     let mut buffer = [0u8; 1024];
//!     if let Some(n) = conversation.receive(&mut buffer, &cancel).await? {
//!         println!("Received: {:?}", &buffer[..n]);
//!     }
//!     Ok(())
//! }
//! ```

// ── Layer 1: Core protocol (re-exported from kcp-core) ─────────────────

/// Core protocol types, constants, and wire format.
pub use kcp_core::protocol;

/// Direct access to the standalone `kcp-core` crate.
pub use kcp_core;

pub use kcp_core::{BufferLease, BufferPool, EngineState, HeapBufferPool, KcpStats};

// ── Layer 2: Transport & buffers ────────────────────────────────────────

pub mod buffer_pool;
pub mod transport;
pub use buffer_pool::TieredBufferPool;
pub use transport::{Addr, Transport, UdpTransport};

// ── Layer 3: Configuration & errors (extends core with I/O concerns) ────

pub mod config;
pub mod error;
pub use config::{KcpConfig, NodeDelayConfig};
pub use error::{ConnectionError, KcpError, Result};

// ── Layer 4: Conversations ──────────────────────────────────────────────

pub mod conversation;
pub mod listener;
pub use conversation::KcpConversation;
pub use listener::KcpListener;

pub use tokio_util::sync::CancellationToken;

// ── Version info ────────────────────────────────────────────────────────

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

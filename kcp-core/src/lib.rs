//! Pure synchronous KCP protocol engine.
//!
//! This crate implements the core KCP ARQ protocol with no runtime
//! dependencies: no tokio, no async, no I/O. It only depends on `bytes`
//! and `tracing`.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  kcp-core                                  │
//! │                                            │
//! │  protocol       ← wire codec               │
//! │  config         ← tuning                   │
//! │  error          ← failure kinds            │
//! │  lease          ← pooled payload buffers   │
//! │  send_queue     ← bounded outbound queue   │
//! │  receive_queue  ← reassembly + delivery    │
//! │  engine         ← ARQ state machine        │
//! └────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
mod node_queue;
pub mod protocol;
pub mod receive_queue;
pub mod send_queue;
mod slot;

pub use config::{KcpCoreConfig, NodeDelayConfig};
pub use engine::{EngineState, KcpEngine};
pub use error::{KcpCoreError, KcpCoreResult};
pub use lease::{BufferLease, BufferPool, HeapBufferPool};
pub use protocol::*;
pub use receive_queue::{ReceiveQueue, ReceiveTarget};
pub use send_queue::SendQueue;
pub use slot::OperationId;

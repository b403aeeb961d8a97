//! Configuration types for the KCP core protocol engine

use crate::lease::{BufferPool, HeapBufferPool};
use crate::protocol::constants;
use std::sync::Arc;

/// Node delay configuration for different performance modes
#[derive(Debug, Clone)]
pub struct NodeDelayConfig {
    /// Enable no-delay mode
    pub nodelay: bool,
    /// Internal update interval in milliseconds
    pub interval: u32,
    /// Fast resend threshold (duplicate acks), 0 disables fast retransmit
    pub resend: u32,
    /// Disable congestion control
    pub no_congestion_control: bool,
}

impl NodeDelayConfig {
    /// Normal mode - balanced performance and reliability
    pub fn normal() -> Self {
        Self {
            nodelay: false,
            interval: 40,
            resend: constants::IKCP_ACK_FAST,
            no_congestion_control: false,
        }
    }

    /// Fast mode - optimized for low latency
    pub fn fast() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            resend: 2,
            no_congestion_control: false,
        }
    }

    /// Turbo mode - maximum performance, minimum latency
    pub fn turbo() -> Self {
        Self {
            nodelay: true,
            interval: 5,
            resend: 1,
            no_congestion_control: true,
        }
    }

    /// Custom configuration
    pub fn custom(nodelay: bool, interval: u32, resend: u32, no_congestion_control: bool) -> Self {
        Self {
            nodelay,
            interval,
            resend,
            no_congestion_control,
        }
    }
}

impl Default for NodeDelayConfig {
    fn default() -> Self {
        Self::normal()
    }
}

/// Protocol-only configuration for the KCP engine.
///
/// Contains only the fields the engine reads, no transport or I/O settings.
#[derive(Debug, Clone)]
pub struct KcpCoreConfig {
    /// Maximum transmission unit
    pub mtu: u32,
    /// Send window size
    pub snd_wnd: u32,
    /// Receive window size
    pub rcv_wnd: u32,
    /// Node delay configuration
    pub nodelay: NodeDelayConfig,
    /// Maximum retransmissions of one segment before the conversation dies
    pub max_retries: u32,
    /// Enable stream mode (no message boundaries)
    pub stream_mode: bool,
    /// Unsent fragments plus unacknowledged segments allowed before writes park
    pub send_queue_size: usize,
    /// Largest datagram accepted by `write`; `None` derives it from the MSS
    pub max_message_size: Option<usize>,
    /// Pool backing payload leases
    pub buffer_pool: Arc<dyn BufferPool>,
}

impl Default for KcpCoreConfig {
    fn default() -> Self {
        Self {
            mtu: constants::IKCP_MTU_DEF,
            snd_wnd: constants::IKCP_WND_SND,
            rcv_wnd: constants::IKCP_WND_RCV,
            nodelay: NodeDelayConfig::normal(),
            max_retries: constants::IKCP_DEADLINK,
            stream_mode: false,
            send_queue_size: constants::IKCP_SEND_QUEUE_SIZE,
            max_message_size: None,
            buffer_pool: Arc::new(HeapBufferPool),
        }
    }
}

impl KcpCoreConfig {
    /// Maximum segment size (MTU minus header overhead)
    pub fn mss(&self) -> usize {
        self.mtu.saturating_sub(constants::IKCP_OVERHEAD) as usize
    }

    /// Largest datagram the fragment index, the send queue and the receive
    /// window can all hold.
    pub fn datagram_capacity(&self) -> usize {
        // A message only completes once all its fragments sit in the
        // receive queue, which holds at most rcv_wnd of them
        let fragments = constants::IKCP_MAX_FRAGMENTS
            .min(self.send_queue_size)
            .min(self.rcv_wnd.max(1) as usize);
        self.mss() * fragments
    }

    /// Effective datagram ceiling: the configured size capped by
    /// [`datagram_capacity`](Self::datagram_capacity).
    pub fn message_limit(&self) -> usize {
        let derived = self.datagram_capacity();
        match self.max_message_size {
            Some(limit) => limit.min(derived),
            None => derived,
        }
    }
}

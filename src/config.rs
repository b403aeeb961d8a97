//! Configuration types for KCP conversations.
//!
//! [`KcpConfig`] extends the core [`NodeDelayConfig`] with queue, admission,
//! and runtime settings used by the async layer.

use crate::buffer_pool::TieredBufferPool;
use crate::error::{KcpError, Result};
use kcp_core::protocol::constants;
use kcp_core::BufferPool;
use std::sync::Arc;
use std::time::Duration;

// Re-export from kcp-core so users see a single NodeDelayConfig type.
pub use kcp_core::config::NodeDelayConfig;

// ── KcpConfig ───────────────────────────────────────────────────────────

/// Full KCP configuration: protocol settings plus runtime settings.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    // Protocol settings (forwarded to the kcp-core engine)
    pub mtu: u32,
    pub snd_wnd: u32,
    pub rcv_wnd: u32,
    pub nodelay: NodeDelayConfig,
    pub max_retries: u32,
    pub stream_mode: bool,
    pub send_queue_size: usize,
    pub max_message_size: Option<usize>,
    pub buffer_pool: Arc<dyn BufferPool>,

    // Runtime settings (used only by the async layer)
    /// Conversations admitted but not yet accepted
    pub backlog: usize,
    /// How often the listener drops conversations that are no longer active
    pub cleanup_interval: Duration,
}

impl Default for KcpConfig {
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
            buffer_pool: TieredBufferPool::global(),
            backlog: 100,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Extracts the protocol-only fields that `KcpEngine` reads.
impl From<KcpConfig> for kcp_core::KcpCoreConfig {
    fn from(c: KcpConfig) -> Self {
        Self {
            mtu: c.mtu,
            snd_wnd: c.snd_wnd,
            rcv_wnd: c.rcv_wnd,
            nodelay: c.nodelay,
            max_retries: c.max_retries,
            stream_mode: c.stream_mode,
            send_queue_size: c.send_queue_size,
            max_message_size: c.max_message_size,
            buffer_pool: c.buffer_pool,
        }
    }
}

// ── Builder methods ─────────────────────────────────────────────────────

impl KcpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Protocol tuning --

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn window_size(mut self, snd_wnd: u32, rcv_wnd: u32) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn normal_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::normal();
        self
    }

    pub fn fast_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::fast();
        self
    }

    pub fn turbo_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::turbo();
        self
    }

    pub fn nodelay_config(mut self, config: NodeDelayConfig) -> Self {
        self.nodelay = config;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn stream_mode(mut self, enabled: bool) -> Self {
        self.stream_mode = enabled;
        self
    }

    pub fn send_queue_size(mut self, size: usize) -> Self {
        self.send_queue_size = size;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn buffer_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.buffer_pool = pool;
        self
    }

    // -- Runtime tuning --

    pub fn backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    // -- Validation --

    pub fn validate(&self) -> Result<()> {
        if self.mtu <= constants::IKCP_OVERHEAD || self.mtu > 65535 {
            return Err(KcpError::config("MTU must be between 25 and 65535"));
        }
        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            return Err(KcpError::config("Window sizes must be greater than 0"));
        }
        if self.nodelay.interval == 0 {
            return Err(KcpError::config("Update interval must be greater than 0"));
        }
        if self.max_retries == 0 {
            return Err(KcpError::config("Max retries must be greater than 0"));
        }
        if self.send_queue_size == 0 {
            return Err(KcpError::config("Send queue size must be greater than 0"));
        }
        if self.backlog == 0 {
            return Err(KcpError::config("Backlog must be greater than 0"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(KcpError::config("Cleanup interval must be greater than 0"));
        }
        if let Some(size) = self.max_message_size {
            let capacity = kcp_core::KcpCoreConfig::from(self.clone()).datagram_capacity();
            if size > capacity {
                return Err(KcpError::config(format!(
                    "Max message size {size} exceeds the {capacity} bytes the windows can hold"
                )));
            }
        }
        Ok(())
    }
}

// ── Presets ──────────────────────────────────────────────────────────────

impl KcpConfig {
    pub fn realtime() -> Self {
        Self::default().fast_mode().window_size(64, 64).mtu(1200)
    }

    pub fn file_transfer() -> Self {
        Self::default()
            .normal_mode()
            .window_size(256, 256)
            .stream_mode(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = KcpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.send_queue_size, 1024);
        assert_eq!(config.backlog, 100);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(KcpConfig::new().mtu(24).validate().is_err());
        assert!(KcpConfig::new().window_size(0, 32).validate().is_err());
        assert!(KcpConfig::new().backlog(0).validate().is_err());
        assert!(KcpConfig::new().send_queue_size(0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_message_larger_than_receive_window() {
        // 128 fragments of 1376 bytes fit the default window
        assert!(KcpConfig::new().max_message_size(128 * 1376).validate().is_ok());
        assert!(KcpConfig::new()
            .max_message_size(128 * 1376 + 1)
            .validate()
            .is_err());
        assert!(KcpConfig::new()
            .window_size(32, 16)
            .max_message_size(20 * 1376)
            .validate()
            .is_err());
    }

    #[test]
    fn test_core_config_carries_protocol_fields() {
        let core: kcp_core::KcpCoreConfig = KcpConfig::realtime()
            .max_message_size(4096)
            .into();
        assert_eq!(core.mtu, 1200);
        assert_eq!(core.rcv_wnd, 64);
        assert_eq!(core.max_message_size, Some(4096));
        assert_eq!(core.mss(), 1176);
    }
}

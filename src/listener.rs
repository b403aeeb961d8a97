//! KCP listener: demultiplexes inbound datagrams into conversations

use crate::config::KcpConfig;
use crate::conversation::KcpConversation;
use crate::error::{ConnectionError, KcpError, Result};
use crate::transport::{Transport, UdpTransport};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kcp_core::KcpHeader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

type ConversationMap<T> = DashMap<<T as Transport>::Addr, KcpConversation<T>>;

/// Accepts conversations from remote endpoints sharing one transport.
///
/// Each endpoint maps to at most one conversation. A datagram from an unknown
/// endpoint opens a new conversation only while the accept backlog has room;
/// otherwise it is dropped and the peer has to retry.
pub struct KcpListener<T: Transport = UdpTransport> {
    local_addr: T::Addr,
    conversations: Arc<ConversationMap<T>>,
    backlog: mpsc::Receiver<KcpConversation<T>>,
    shutdown: CancellationToken,
    listen_task: Option<JoinHandle<()>>,
}

// --- UDP-specific convenience methods ---

impl KcpListener<UdpTransport> {
    /// Bind to the specified address
    pub async fn bind(addr: SocketAddr, config: KcpConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addr).await?;
        Self::with_transport(Arc::new(transport), config)
    }
}

// --- Generic methods for any Transport ---

impl<T: Transport> KcpListener<T> {
    /// Create a listener using a custom [`Transport`].
    ///
    /// Must be called within a tokio runtime.
    pub fn with_transport(transport: Arc<T>, config: KcpConfig) -> Result<Self> {
        config.validate()?;
        let local_addr = transport.local_addr()?;

        let (backlog_tx, backlog) = mpsc::channel(config.backlog);
        let conversations = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        let listen_task = tokio::spawn(Self::listen(
            transport,
            config,
            conversations.clone(),
            backlog_tx,
            shutdown.clone(),
        ));

        info!(addr = %local_addr, "KCP listener started");
        Ok(Self {
            local_addr,
            conversations,
            backlog,
            shutdown,
            listen_task: Some(listen_task),
        })
    }

    /// Wait for the next admitted conversation.
    ///
    /// Fails with a closed connection error once the transport is gone and
    /// the backlog is drained.
    pub async fn accept(&mut self, cancel: &CancellationToken) -> Result<KcpConversation<T>> {
        if cancel.is_cancelled() {
            return Err(KcpError::Canceled);
        }
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(KcpError::Canceled),
                next = self.backlog.recv() => next,
            };
            match next {
                Some(conversation) if conversation.is_active() => return Ok(conversation),
                Some(conversation) => {
                    debug!(peer = %conversation.peer(), "Skipping conversation closed before accept");
                }
                None => return Err(KcpError::connection(ConnectionError::Closed)),
            }
        }
    }

    /// Get the local address
    pub fn local_addr(&self) -> &T::Addr {
        &self.local_addr
    }

    /// Number of endpoints with a routed conversation
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Stop routing to `conversation`. A newer conversation registered for
    /// the same endpoint is left alone.
    pub fn remove(&self, conversation: &KcpConversation<T>) -> bool {
        self.conversations
            .remove_if(conversation.peer(), |_, current| current.ptr_eq(conversation))
            .is_some()
    }

    /// Close the listener. Every live conversation moves to the transport
    /// closed state.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.listen_task.take() {
            let _ = task.await;
        }
        info!(addr = %self.local_addr, "KCP listener closed");
    }

    async fn listen(
        transport: Arc<T>,
        config: KcpConfig,
        conversations: Arc<ConversationMap<T>>,
        backlog: mpsc::Sender<KcpConversation<T>>,
        shutdown: CancellationToken,
    ) {
        let mut buf = vec![0u8; 65536];
        let mut cleanup = tokio::time::interval(config.cleanup_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                received = transport.recv_from(&mut buf) => match received {
                    Ok((size, peer)) => {
                        Self::route(&transport, &config, &conversations, &backlog, &buf[..size], peer);
                    }
                    Err(e) => {
                        error!(error = %e, "Transport receive failed");
                        break;
                    }
                },

                _ = cleanup.tick() => Self::cleanup(&conversations),
            }
        }

        for entry in conversations.iter() {
            entry.value().set_transport_closed();
        }
        conversations.clear();
    }

    fn route(
        transport: &Arc<T>,
        config: &KcpConfig,
        conversations: &ConversationMap<T>,
        backlog: &mpsc::Sender<KcpConversation<T>>,
        packet: &[u8],
        peer: T::Addr,
    ) {
        // Clone out of the map so no shard lock is held while the engine runs
        let existing = conversations.get(&peer).map(|entry| entry.value().clone());
        if let Some(conversation) = existing {
            if conversation.is_active() {
                if let Err(e) = conversation.input_packet(packet) {
                    trace!(peer = %peer, error = %e, "Dropped inbound packet");
                }
                return;
            }
            conversations.remove_if(&peer, |_, current| current.ptr_eq(&conversation));
            debug!(peer = %peer, conv = %conversation.conv(), "Released inactive conversation");
        }

        let header = match KcpHeader::peek(packet) {
            Ok(header) => header,
            Err(e) => {
                trace!(peer = %peer, error = %e, "Undecodable packet from unknown endpoint");
                return;
            }
        };

        let Ok(permit) = backlog.try_reserve() else {
            debug!(peer = %peer, conv = %header.conv, "Backlog full, dropping first packet");
            return;
        };

        let conversation = match conversations.entry(peer.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let conversation =
                    KcpConversation::new(transport.clone(), peer.clone(), header.conv, config);
                slot.insert(conversation.clone());
                conversation
            }
        };

        if let Err(e) = conversation.input_packet(packet) {
            trace!(peer = %peer, error = %e, "Dropped inbound packet");
        }
        debug!(peer = %peer, conv = %header.conv, "Conversation admitted");
        permit.send(conversation);
    }

    fn cleanup(conversations: &ConversationMap<T>) {
        let before = conversations.len();
        conversations.retain(|_, conversation| conversation.is_active());
        let removed = before - conversations.len();
        if removed > 0 {
            debug!(removed, "Removed inactive conversations");
        }
    }
}

impl<T: Transport> Drop for KcpListener<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

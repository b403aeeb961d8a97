//! Async conversation handle
//!
//! A [`KcpConversation`] owns one [`KcpEngine`] behind a single mutex. Two
//! background tasks serve it: one drives the update timer, the other writes
//! produced datagrams to the transport. Reads and writes are plain futures
//! that park on the engine's operation slots; dropping one (for instance
//! when its cancellation token fires) unregisters it without losing data.

use crate::config::KcpConfig;
use crate::error::{KcpError, Result};
use crate::transport::{Transport, UdpTransport};

use bytes::Bytes;
use kcp_core::{ConvId, EngineState, KcpEngine, KcpStats, OperationId, ReceiveTarget, Timestamp};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Shared state behind every clone of a conversation handle
struct Inner<T: Transport> {
    conv: ConvId,
    peer: T::Addr,
    engine: Mutex<KcpEngine>,
    outbound: mpsc::UnboundedSender<Bytes>,
    epoch: Instant,
    shutdown: CancellationToken,
}

impl<T: Transport> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, KcpEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> Timestamp {
        self.epoch.elapsed().as_millis() as Timestamp
    }

    /// Hand produced datagrams to the outbound task.
    fn pump(&self, engine: &mut KcpEngine) {
        for packet in engine.drain_output() {
            if self.outbound.send(packet).is_err() {
                trace!(conv = %self.conv, "Outbound task gone, dropping packet");
            }
        }
    }

    /// Flush right away instead of waiting for the next tick.
    fn flush(&self, engine: &mut KcpEngine) {
        if let Err(e) = engine.flush(self.now()) {
            warn!(conv = %self.conv, peer = %self.peer, error = %e, "Conversation lost");
            self.shutdown.cancel();
        }
        self.pump(engine);
    }

    /// Timer step. Returns false once the engine stops accepting updates.
    fn tick(&self) -> bool {
        let mut engine = self.lock();
        if !engine.is_active() {
            return false;
        }
        match engine.update(self.now()) {
            Ok(()) => {
                self.pump(&mut engine);
                true
            }
            Err(e) => {
                warn!(conv = %self.conv, peer = %self.peer, error = %e, "Conversation lost");
                self.shutdown.cancel();
                false
            }
        }
    }

    /// Feed one datagram, then answer right away if it produced acks.
    fn input(&self, packet: &[u8]) -> Result<()> {
        let mut engine = self.lock();
        let now = self.now();
        let result = engine.input(packet, now).map_err(KcpError::from);
        if engine.needs_flush() {
            self.flush(&mut engine);
        }
        result
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to one KCP conversation with a remote endpoint.
///
/// Handles are cheap to clone and all refer to the same engine. At most one
/// receive and one send may be outstanding at a time across all clones.
pub struct KcpConversation<T: Transport = UdpTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for KcpConversation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for KcpConversation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KcpConversation")
            .field("conv", &self.inner.conv)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

// --- UDP-specific convenience methods ---

impl KcpConversation<UdpTransport> {
    /// Bind an ephemeral UDP socket and open a conversation with `peer`.
    pub async fn connect_udp(peer: SocketAddr, conv: ConvId, config: KcpConfig) -> Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let transport = UdpTransport::bind(local).await?;
        Self::connect(Arc::new(transport), peer, conv, config)
    }
}

// --- Generic methods for any Transport ---

impl<T: Transport> KcpConversation<T> {
    /// Create a conversation whose inbound packets are fed by the caller
    /// through [`input_packet`](Self::input_packet).
    ///
    /// Must be called within a tokio runtime.
    pub fn new(transport: Arc<T>, peer: T::Addr, conv: ConvId, config: &KcpConfig) -> Self {
        let interval = Duration::from_millis(u64::from(config.nodelay.interval.max(1)));
        let (outbound, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            conv,
            peer: peer.clone(),
            engine: Mutex::new(KcpEngine::new(conv, config.clone().into())),
            outbound,
            epoch: Instant::now(),
            shutdown: CancellationToken::new(),
        });

        Self::spawn_outbound(transport, peer, rx, inner.shutdown.clone());
        Self::spawn_update(Arc::downgrade(&inner), interval, inner.shutdown.clone());

        debug!(conv = %conv, peer = %inner.peer, "Conversation created");
        Self { inner }
    }

    /// Open an outbound conversation with its own receive loop that feeds
    /// every datagram from `peer` into the engine.
    pub fn connect(transport: Arc<T>, peer: T::Addr, conv: ConvId, config: KcpConfig) -> Result<Self> {
        config.validate()?;
        let conversation = Self::new(transport.clone(), peer.clone(), conv, &config);

        let weak = Arc::downgrade(&conversation.inner);
        let shutdown = conversation.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = transport.recv_from(&mut buf) => received,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match received {
                    Ok((size, from)) if from == peer => {
                        if let Err(e) = inner.input(&buf[..size]) {
                            trace!(conv = %inner.conv, error = %e, "Dropped inbound packet");
                        }
                    }
                    Ok((_, from)) => {
                        trace!(conv = %inner.conv, from = %from, "Packet from unexpected endpoint");
                    }
                    Err(e) => {
                        warn!(conv = %inner.conv, error = %e, "Transport receive failed");
                        KcpConversation { inner }.set_transport_closed();
                        break;
                    }
                }
            }
        });

        info!(conv = %conv, peer = %conversation.inner.peer, "Conversation connected");
        Ok(conversation)
    }

    fn spawn_outbound(
        transport: Arc<T>,
        peer: T::Addr,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    packet = rx.recv() => match packet {
                        Some(packet) => packet,
                        None => break,
                    },
                };
                if let Err(e) = transport.send_to(&packet, &peer).await {
                    debug!(peer = %peer, error = %e, "Send failed");
                }
            }
        });
    }

    fn spawn_update(inner: Weak<Inner<T>>, interval: Duration, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if !inner.tick() {
                    break;
                }
            }
        });
    }

    /// Conversation ID
    pub fn conv(&self) -> ConvId {
        self.inner.conv
    }

    /// Remote endpoint
    pub fn peer(&self) -> &T::Addr {
        &self.inner.peer
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().is_active()
    }

    pub fn stats(&self) -> KcpStats {
        self.inner.lock().stats()
    }

    /// Whether both handles refer to the same conversation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Feed one inbound datagram into the engine.
    ///
    /// Malformed packets are reported and otherwise ignored.
    pub fn input_packet(&self, packet: &[u8]) -> Result<()> {
        self.inner.input(packet)
    }

    /// Size of the next complete message without consuming it.
    pub fn try_peek(&self) -> Option<usize> {
        self.inner.lock().peek_size()
    }

    /// Queue `data` for reliable delivery.
    ///
    /// Datagram mode sends `data` as one message; stream mode may split it
    /// and returns once every byte is queued. Suspends while the send queue
    /// is full.
    pub async fn send(&self, data: &[u8], cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(KcpError::Canceled);
        }
        let op = self.inner.lock().new_send_operation();
        let send = SendFuture {
            inner: &self.inner,
            op,
            data,
            written: 0,
        };
        cancellable(send, cancel).await
    }

    /// Copy the next message into `buf`.
    ///
    /// Returns `Ok(None)` once the transport closed and every queued message
    /// has been read.
    pub async fn receive(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<Option<usize>> {
        if cancel.is_cancelled() {
            return Err(KcpError::Canceled);
        }
        let op = self.inner.lock().new_receive_operation();
        let receive = ReceiveFuture {
            inner: &self.inner,
            op,
            buf: Some(buf),
        };
        cancellable(receive, cancel).await
    }

    /// Wait until a complete message is queued and return its size.
    pub async fn wait_to_receive(&self, cancel: &CancellationToken) -> Result<Option<usize>> {
        if cancel.is_cancelled() {
            return Err(KcpError::Canceled);
        }
        let op = self.inner.lock().new_receive_operation();
        let wait = ReceiveFuture {
            inner: &self.inner,
            op,
            buf: None,
        };
        cancellable(wait, cancel).await
    }

    /// Stop sending and let readers drain what is already queued.
    pub fn set_transport_closed(&self) {
        self.inner.lock().set_transport_closed();
        self.inner.shutdown.cancel();
    }

    /// Release every buffer. Pending calls complete, later calls fail with
    /// a disposed error.
    pub fn dispose(&self) {
        self.inner.lock().dispose();
        self.inner.shutdown.cancel();
    }
}

async fn cancellable<R>(
    operation: impl Future<Output = Result<R>>,
    cancel: &CancellationToken,
) -> Result<R> {
    tokio::select! {
        biased;
        result = operation => result,
        _ = cancel.cancelled() => Err(KcpError::Canceled),
    }
}

/// Pending write. Dropping it frees the send slot.
struct SendFuture<'a, T: Transport> {
    inner: &'a Arc<Inner<T>>,
    op: OperationId,
    data: &'a [u8],
    written: usize,
}

impl<T: Transport> Future for SendFuture<'_, T> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut engine = this.inner.lock();
        let before = this.written;
        let result = engine.poll_send(Some(cx.waker()), this.op, this.data, &mut this.written);
        if this.written > before {
            this.inner.flush(&mut engine);
        }
        result.map(|r| r.map_err(KcpError::from))
    }
}

impl<T: Transport> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        self.inner.lock().abandon_send(self.op);
    }
}

/// Pending read, or a wait for the next message when `buf` is `None`.
struct ReceiveFuture<'a, T: Transport> {
    inner: &'a Arc<Inner<T>>,
    op: OperationId,
    buf: Option<&'a mut [u8]>,
}

impl<T: Transport> Future for ReceiveFuture<'_, T> {
    type Output = Result<Option<usize>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let target = match this.buf.as_deref_mut() {
            Some(buf) => ReceiveTarget::Buffer(buf),
            None => ReceiveTarget::Peek,
        };
        let mut engine = this.inner.lock();
        let result = engine.poll_receive(Some(cx.waker()), this.op, target);
        // A read that reopened a full window announces it now
        if result.is_ready() && engine.needs_flush() {
            this.inner.flush(&mut engine);
        }
        result.map(|r| r.map_err(KcpError::from))
    }
}

impl<T: Transport> Drop for ReceiveFuture<'_, T> {
    fn drop(&mut self) {
        self.inner.lock().abandon_receive(self.op);
    }
}

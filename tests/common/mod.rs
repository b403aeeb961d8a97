//! Shared helpers for the async integration tests

#![allow(dead_code)]

use bytes::BytesMut;
use kcp::protocol::{Command, ConvId, KcpHeader, Segment};
use kcp::Transport;
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Endpoint address on a [`MemoryNetwork`]
pub type Port = u16;

type Datagram = (Vec<u8>, Port);

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<Port, mpsc::UnboundedSender<Datagram>>,
    loss: f64,
}

/// In-process datagram network. Delivery is immediate and in order unless a
/// loss rate is set.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop each datagram with probability `loss`.
    pub fn with_loss(loss: f64) -> Self {
        let network = Self::default();
        network.lock().loss = loss;
        network
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bind(&self, port: Port) -> Arc<MemoryTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(port, tx);
        Arc::new(MemoryTransport {
            port,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    /// Tear down an endpoint. Its pending receive fails.
    pub fn close(&self, port: Port) {
        self.lock().inboxes.remove(&port);
    }

    fn deliver(&self, packet: &[u8], from: Port, to: Port) {
        let state = self.lock();
        if state.loss > 0.0 && rand::thread_rng().gen_bool(state.loss) {
            return;
        }
        if let Some(inbox) = state.inboxes.get(&to) {
            let _ = inbox.send((packet.to_vec(), from));
        }
    }
}

pub struct MemoryTransport {
    port: Port,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl Transport for MemoryTransport {
    type Addr = Port;

    async fn send_to(&self, buf: &[u8], target: &Port) -> io::Result<usize> {
        self.network.deliver(buf, self.port, *target);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Port)> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((packet, from)) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok((n, from))
            }
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "endpoint closed",
            )),
        }
    }

    fn local_addr(&self) -> io::Result<Port> {
        Ok(self.port)
    }
}

/// Encode a single push segment carrying `payload` as a whole message.
pub fn push_packet(conv: ConvId, sn: u32, payload: &[u8]) -> Vec<u8> {
    let mut header = KcpHeader::new(conv, Command::Push);
    header.sn = sn;
    header.wnd = 128;
    let mut buf = BytesMut::new();
    Segment::new(header, payload).encode(&mut buf);
    buf.to_vec()
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

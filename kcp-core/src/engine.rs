//! KCP protocol engine: sliding-window ARQ over an unreliable datagram channel
//!
//! The engine is a synchronous state machine. Callers feed it inbound
//! packets with [`KcpEngine::input`], drive its clock with
//! [`KcpEngine::update`], and collect produced datagrams from
//! [`KcpEngine::drain_output`]. Application data enters through the send
//! queue and leaves through the receive queue, both of which park at most
//! one operation via a [`Waker`].

use crate::config::KcpCoreConfig;
use crate::error::{KcpCoreError, KcpCoreResult};
use crate::lease::BufferLease;
use crate::protocol::*;
use crate::receive_queue::{ReceiveQueue, ReceiveTarget};
use crate::send_queue::SendQueue;
use crate::slot::OperationId;

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::task::{Poll, Waker};
use tracing::{debug, info, trace, warn};

/// Lifecycle of a conversation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Exchanging data
    Active,
    /// Transport gone; queued received data can still be read
    TransportClosed,
    /// Retransmission limit exceeded
    Dead,
    /// Explicitly disposed; every lease has been released
    Disposed,
}

/// RTT calculation state
#[derive(Debug)]
struct RttState {
    avg: u32,     // Smoothed RTT
    var: u32,     // RTT variance
    rto: u32,     // Retransmission timeout
    min_rto: u32, // Minimum RTO
}

/// Window control state
#[derive(Debug)]
struct WindowState {
    snd: u32,      // Send window size
    rcv: u32,      // Receive window size
    rmt: u32,      // Remote window size
    cwnd: u32,     // Congestion window
    ssthresh: u32, // Slow start threshold
    incr: u32,     // Increment for congestion avoidance
}

/// Probe state for window probing
#[derive(Debug, Default)]
struct ProbeState {
    flags: u32,
    wait: u32,
    ts: Timestamp,
}

/// A segment waiting for acknowledgement
#[derive(Debug)]
struct SendEntry {
    sn: SeqNum,
    frg: u8,
    resendts: Timestamp,
    rto: u32,
    fastack: u32,
    xmit: u32,
    data: BufferLease,
}

/// An out-of-order segment waiting for the gap before it to fill
#[derive(Debug)]
struct RecvEntry {
    sn: SeqNum,
    frg: u8,
    data: BufferLease,
}

/// Packs consecutive segments into MTU-sized datagrams.
struct PacketWriter {
    buf: BytesMut,
    mtu: usize,
    packets: u64,
}

impl PacketWriter {
    fn new(mtu: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(mtu),
            mtu,
            packets: 0,
        }
    }

    fn push(&mut self, output: &mut Vec<Bytes>, segment: &Segment<'_>) {
        if !self.buf.is_empty() && self.buf.len() + segment.size() > self.mtu {
            self.emit(output);
        }
        segment.encode(&mut self.buf);
    }

    fn emit(&mut self, output: &mut Vec<Bytes>) {
        output.push(self.buf.split().freeze());
        self.packets += 1;
    }

    fn finish(mut self, output: &mut Vec<Bytes>) -> u64 {
        if !self.buf.is_empty() {
            self.emit(output);
        }
        self.packets
    }
}

/// KCP engine implementing the core protocol logic
#[derive(Debug)]
pub struct KcpEngine {
    // Core
    conv: ConvId,
    config: KcpCoreConfig,
    state: EngineState,

    // Sequence numbers
    snd_una: SeqNum,
    snd_nxt: SeqNum,
    rcv_nxt: SeqNum,

    // Timing and window
    rtt: RttState,
    wnd: WindowState,
    probe: ProbeState,
    current: Timestamp,
    ts_flush: Timestamp,
    updated: bool,

    // Buffers
    send_queue: SendQueue,
    snd_buf: VecDeque<SendEntry>,
    rcv_buf: VecDeque<RecvEntry>,
    receive_queue: ReceiveQueue,
    ack_list: Vec<(SeqNum, Timestamp)>,
    output: Vec<Bytes>,

    stats: KcpStats,
}

impl KcpEngine {
    /// Create a new KCP engine
    pub fn new(conv: ConvId, config: KcpCoreConfig) -> Self {
        let min_rto = if config.nodelay.nodelay {
            constants::IKCP_RTO_NDL
        } else {
            constants::IKCP_RTO_MIN
        };

        let send_queue = SendQueue::new(
            config.stream_mode,
            config.mss(),
            config.send_queue_size,
            config.message_limit(),
            config.buffer_pool.clone(),
        );

        Self {
            conv,
            state: EngineState::Active,

            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,

            rtt: RttState {
                avg: 0,
                var: 0,
                rto: constants::IKCP_RTO_DEF,
                min_rto,
            },

            wnd: WindowState {
                snd: config.snd_wnd,
                rcv: config.rcv_wnd.max(1),
                rmt: constants::IKCP_WND_RCV,
                cwnd: config.snd_wnd,
                ssthresh: constants::IKCP_THRESH_INIT,
                incr: 0,
            },

            probe: ProbeState::default(),
            current: 0,
            ts_flush: 0,
            updated: false,

            send_queue,
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            receive_queue: ReceiveQueue::new(config.stream_mode),
            ack_list: Vec::new(),
            output: Vec::new(),

            stats: KcpStats::default(),

            config,
        }
    }

    pub fn conv(&self) -> ConvId {
        self.conv
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == EngineState::Active
    }

    pub fn config(&self) -> &KcpCoreConfig {
        &self.config
    }

    /// Snapshot of the conversation statistics
    pub fn stats(&self) -> KcpStats {
        KcpStats {
            rtt: self.rtt.avg,
            rtt_var: self.rtt.var,
            rto: self.rtt.rto,
            cwnd: self.wnd.cwnd,
            snd_buf_size: self.snd_buf.len() as u32,
            rcv_buf_size: self.rcv_buf.len() as u32,
            ..self.stats
        }
    }

    /// Fragments queued or in flight
    pub fn waiting_segments(&self) -> usize {
        self.send_queue.len() + self.snd_buf.len()
    }

    /// Datagrams produced since the last drain, in transmission order.
    pub fn drain_output(&mut self) -> std::vec::Drain<'_, Bytes> {
        self.output.drain(..)
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Acknowledgements or a window reply are waiting for the next flush.
    pub fn needs_flush(&self) -> bool {
        !self.ack_list.is_empty() || self.probe.flags != 0
    }

    // Inbound path

    /// Process one inbound datagram.
    ///
    /// Packets for another conversation are ignored. A malformed segment
    /// stops processing of the rest of the datagram and is reported so the
    /// caller can log it; segments decoded before it are kept.
    pub fn input(&mut self, packet: &[u8], current: Timestamp) -> KcpCoreResult<()> {
        if self.state != EngineState::Active {
            trace!(conv = %self.conv, state = ?self.state, "Input ignored");
            return Ok(());
        }
        self.current = current;

        let prev_una = self.snd_una;
        let prev_in_flight = self.snd_buf.len();
        let mut accepted = false;
        let mut rest = packet;
        let mut max_ack: Option<SeqNum> = None;
        let mut outcome = Ok(());

        if rest.len() < KcpHeader::SIZE {
            self.stats.packets_malformed += 1;
            return Err(DecodeError::Truncated { len: rest.len() }.into());
        }

        while !rest.is_empty() {
            let segment = match Segment::decode(&mut rest) {
                Ok(segment) => segment,
                Err(e) => {
                    self.stats.packets_malformed += 1;
                    outcome = Err(e.into());
                    break;
                }
            };
            let header = segment.header;

            if header.conv != self.conv {
                trace!(
                    conv = %self.conv,
                    packet_conv = %header.conv,
                    "Conversation ID mismatch, dropping"
                );
                break;
            }
            accepted = true;

            self.wnd.rmt = header.wnd as u32;
            self.parse_una(header.una);
            self.shrink_buf();

            match header.cmd {
                Command::Ack => {
                    let rtt = time_diff(current, header.ts);
                    if rtt >= 0 {
                        self.update_ack(rtt as u32);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();

                    max_ack = match max_ack {
                        Some(max) if !seq_after(header.sn, max) => Some(max),
                        _ => Some(header.sn),
                    };
                }

                Command::Push => {
                    if seq_before(header.sn, self.rcv_nxt.wrapping_add(self.wnd.rcv)) {
                        self.ack_list.push((header.sn, header.ts));
                        if !seq_before(header.sn, self.rcv_nxt) {
                            self.parse_data(header.sn, header.frg, segment.payload);
                        }
                    } else {
                        trace!(conv = %self.conv, sn = header.sn, "Segment outside receive window");
                    }
                }

                Command::WindowAsk => {
                    self.probe.flags |= constants::IKCP_ASK_TELL;
                }

                Command::WindowTell => {}
            }
        }

        if accepted {
            self.stats.packets_received += 1;
        }

        if let Some(sn) = max_ack {
            self.parse_fastack(sn);
        }

        if seq_after(self.snd_una, prev_una) {
            self.update_cwnd();
        }
        // Selective acks free capacity without moving una
        if self.snd_buf.len() < prev_in_flight {
            self.send_queue.notify_space();
        }

        trace!(conv = %self.conv, size = packet.len(), "Packet processed");
        outcome
    }

    fn parse_una(&mut self, una: SeqNum) {
        while let Some(entry) = self.snd_buf.front() {
            if seq_before(entry.sn, una) {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn parse_ack(&mut self, sn: SeqNum) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }

        for (i, entry) in self.snd_buf.iter().enumerate() {
            if entry.sn == sn {
                self.snd_buf.remove(i);
                break;
            }
            if seq_before(sn, entry.sn) {
                break;
            }
        }
    }

    fn parse_fastack(&mut self, sn: SeqNum) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }

        for entry in &mut self.snd_buf {
            if seq_before(entry.sn, sn) {
                entry.fastack += 1;
            } else {
                break;
            }
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(entry) => entry.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_data(&mut self, sn: SeqNum, frg: u8, payload: &[u8]) {
        if !seq_before(sn, self.rcv_nxt.wrapping_add(self.wnd.rcv)) || seq_before(sn, self.rcv_nxt) {
            return;
        }

        // Insert in order
        let mut insert_pos = self.rcv_buf.len();
        for (i, entry) in self.rcv_buf.iter().enumerate().rev() {
            if entry.sn == sn {
                trace!(conv = %self.conv, sn, "Duplicate segment");
                return;
            }
            if seq_after(sn, entry.sn) {
                break;
            }
            insert_pos = i;
        }

        let data = BufferLease::copy_from_slice(&self.config.buffer_pool, payload);
        self.rcv_buf.insert(insert_pos, RecvEntry { sn, frg, data });

        self.move_to_receive_queue();
    }

    fn move_to_receive_queue(&mut self) {
        while let Some(entry) = self.rcv_buf.front() {
            if entry.sn != self.rcv_nxt || self.receive_queue.len() >= self.wnd.rcv as usize {
                break;
            }
            if let Some(entry) = self.rcv_buf.pop_front() {
                self.receive_queue.enqueue(entry.data, entry.frg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    fn update_ack(&mut self, rtt: u32) {
        if self.rtt.avg == 0 {
            self.rtt.avg = rtt;
            self.rtt.var = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.rtt.avg);
            self.rtt.var = (3 * self.rtt.var + delta) / 4;
            self.rtt.avg = ((7 * self.rtt.avg + rtt) / 8).max(1);
        }

        let rto = self
            .rtt
            .avg
            .saturating_add(4 * self.rtt.var.max(self.config.nodelay.interval));
        self.rtt.rto = rto.clamp(self.rtt.min_rto, constants::IKCP_RTO_MAX);
    }

    fn update_cwnd(&mut self) {
        if self.wnd.cwnd >= self.wnd.rmt {
            return;
        }

        let mss = self.mss();
        if self.wnd.cwnd < self.wnd.ssthresh {
            self.wnd.cwnd += 1;
            self.wnd.incr += mss;
        } else {
            if self.wnd.incr < mss {
                self.wnd.incr = mss;
            }
            self.wnd.incr += (mss * mss) / self.wnd.incr + (mss / 16);
            if (self.wnd.cwnd + 1) * mss <= self.wnd.incr {
                self.wnd.cwnd = self.wnd.incr.div_ceil(mss.max(1));
            }
        }
        if self.wnd.cwnd > self.wnd.rmt {
            self.wnd.cwnd = self.wnd.rmt;
            self.wnd.incr = self.wnd.rmt * mss;
        }
    }

    // Outbound path

    /// Advance the clock and flush when the update interval has elapsed.
    pub fn update(&mut self, current: Timestamp) -> KcpCoreResult<()> {
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = time_diff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap < 0 {
            self.current = current;
            return Ok(());
        }

        let interval = self.config.nodelay.interval;
        self.ts_flush = self.ts_flush.wrapping_add(interval);
        if time_diff(current, self.ts_flush) >= 0 {
            self.ts_flush = current.wrapping_add(interval);
        }
        self.flush(current)
    }

    /// Emit pending acknowledgements, window probes, and data segments.
    ///
    /// Returns [`KcpCoreError::MaxRetransmitExceeded`] the moment a segment
    /// crosses the retransmission limit; the engine is dead afterwards.
    pub fn flush(&mut self, current: Timestamp) -> KcpCoreResult<()> {
        if self.state != EngineState::Active {
            return Ok(());
        }
        self.current = current;

        let mut writer = PacketWriter::new(self.config.mtu as usize);
        let mut header = KcpHeader::new(self.conv, Command::Ack);
        header.wnd = self.wnd_unused();
        header.una = self.rcv_nxt;

        // Acknowledgements
        for (sn, ts) in self.ack_list.drain(..) {
            header.sn = sn;
            header.ts = ts;
            writer.push(&mut self.output, &Segment::new(header, &[]));
        }

        // Window probes
        self.update_probe(current);
        header.sn = 0;
        header.ts = 0;
        if self.probe.flags & constants::IKCP_ASK_SEND != 0 {
            header.cmd = Command::WindowAsk;
            writer.push(&mut self.output, &Segment::new(header, &[]));
        }
        if self.probe.flags & constants::IKCP_ASK_TELL != 0 {
            header.cmd = Command::WindowTell;
            writer.push(&mut self.output, &Segment::new(header, &[]));
        }
        self.probe.flags = 0;

        self.move_to_send_buf(current);

        // Data segments
        let resend = if self.config.nodelay.resend > 0 {
            self.config.nodelay.resend
        } else {
            u32::MAX
        };
        let rtomin = if self.config.nodelay.nodelay {
            0
        } else {
            self.rtt.rto >> 3
        };

        let mut lost = false;
        let mut change = false;
        let mut dead = false;
        header.cmd = Command::Push;

        for entry in &mut self.snd_buf {
            let needsend = if entry.xmit == 0 {
                entry.xmit = 1;
                entry.rto = self.rtt.rto;
                entry.resendts = current.wrapping_add(entry.rto + rtomin);
                true
            } else if time_diff(current, entry.resendts) >= 0 {
                entry.xmit += 1;
                if self.config.nodelay.nodelay {
                    entry.rto += entry.rto / 2;
                } else {
                    entry.rto += entry.rto.max(self.rtt.rto);
                }
                entry.rto = entry.rto.min(constants::IKCP_RTO_MAX);
                entry.resendts = current.wrapping_add(entry.rto);
                self.stats.retransmissions += 1;
                lost = true;
                true
            } else if entry.fastack >= resend && entry.xmit <= constants::IKCP_FASTACK_LIMIT {
                entry.xmit += 1;
                entry.fastack = 0;
                entry.resendts = current.wrapping_add(entry.rto);
                self.stats.fast_retransmissions += 1;
                change = true;
                true
            } else {
                false
            };

            if needsend {
                header.frg = entry.frg;
                header.ts = current;
                header.sn = entry.sn;
                writer.push(&mut self.output, &Segment::new(header, entry.data.data()));

                if entry.xmit >= self.config.max_retries {
                    dead = true;
                }
            }
        }

        self.stats.packets_sent += writer.finish(&mut self.output);

        if lost || change {
            self.on_loss();
        }

        if dead {
            self.enter_dead();
            return Err(KcpCoreError::MaxRetransmitExceeded);
        }
        Ok(())
    }

    fn update_probe(&mut self, current: Timestamp) {
        if self.wnd.rmt != 0 {
            self.probe.ts = 0;
            self.probe.wait = 0;
            return;
        }

        if self.probe.wait == 0 {
            self.probe.wait = constants::IKCP_PROBE_INIT;
            self.probe.ts = current.wrapping_add(self.probe.wait);
        } else if time_diff(current, self.probe.ts) >= 0 {
            if self.probe.wait < constants::IKCP_PROBE_INIT {
                self.probe.wait = constants::IKCP_PROBE_INIT;
            }
            self.probe.wait += self.probe.wait / 2;
            if self.probe.wait > constants::IKCP_PROBE_LIMIT {
                self.probe.wait = constants::IKCP_PROBE_LIMIT;
            }
            self.probe.ts = current.wrapping_add(self.probe.wait);
            self.probe.flags |= constants::IKCP_ASK_SEND;
        }
    }

    fn move_to_send_buf(&mut self, current: Timestamp) {
        let mut cwnd = self.wnd.snd.min(self.wnd.rmt);
        if !self.config.nodelay.no_congestion_control {
            cwnd = cwnd.min(self.wnd.cwnd);
        }

        while seq_before(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) {
            let Some(fragment) = self.send_queue.pop_front() else {
                break;
            };
            self.snd_buf.push_back(SendEntry {
                sn: self.snd_nxt,
                frg: fragment.fragment,
                resendts: current,
                rto: self.rtt.rto,
                fastack: 0,
                xmit: 0,
                data: fragment.data,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }
    }

    /// Multiplicative decrease: halve the window, never below one segment.
    fn on_loss(&mut self) {
        self.wnd.ssthresh = (self.wnd.cwnd / 2).max(constants::IKCP_THRESH_MIN);
        self.wnd.cwnd = (self.wnd.cwnd / 2).max(1);
        self.wnd.incr = self.wnd.cwnd * self.mss();
        debug!(
            conv = %self.conv,
            cwnd = self.wnd.cwnd,
            ssthresh = self.wnd.ssthresh,
            "Loss detected, window reduced"
        );
    }

    fn wnd_unused(&self) -> u16 {
        let used = self.receive_queue.len() as u32;
        self.wnd.rcv.saturating_sub(used).min(u16::MAX as u32) as u16
    }

    /// Maximum segment size (MTU - overhead)
    #[inline]
    fn mss(&self) -> u32 {
        self.config.mss() as u32
    }

    // Application side

    /// Allocate an id for a new send call.
    pub fn new_send_operation(&mut self) -> OperationId {
        self.send_queue.new_operation()
    }

    /// Allocate an id for a new receive call.
    pub fn new_receive_operation(&mut self) -> OperationId {
        self.receive_queue.new_operation()
    }

    /// Drive a send. See [`SendQueue::poll_send`].
    pub fn poll_send(
        &mut self,
        waker: Option<&Waker>,
        op: OperationId,
        data: &[u8],
        written: &mut usize,
    ) -> Poll<KcpCoreResult<()>> {
        let before = *written;
        let in_flight = self.snd_buf.len();
        let result = self.send_queue.poll_send(waker, op, data, written, in_flight);
        if *written > before {
            self.stats.bytes_sent += (*written - before) as u64;
            trace!(conv = %self.conv, bytes = *written - before, "Data queued for sending");
        }
        result
    }

    /// Drive a receive. See [`ReceiveQueue::poll_receive`].
    pub fn poll_receive(
        &mut self,
        waker: Option<&Waker>,
        op: OperationId,
        target: ReceiveTarget<'_>,
    ) -> Poll<KcpCoreResult<Option<usize>>> {
        let consuming = matches!(target, ReceiveTarget::Buffer(_));
        let window_full = self.receive_queue.len() >= self.wnd.rcv as usize;

        let result = self.receive_queue.poll_receive(waker, op, target);
        if let Poll::Ready(Ok(Some(n))) = &result {
            if consuming && self.state == EngineState::Active {
                self.stats.bytes_received += *n as u64;
                self.move_to_receive_queue();
                // Tell the peer the window reopened
                if window_full && self.receive_queue.len() < self.wnd.rcv as usize {
                    self.probe.flags |= constants::IKCP_ASK_TELL;
                }
            }
        }
        result
    }

    pub fn abandon_send(&mut self, op: OperationId) {
        self.send_queue.abandon(op);
    }

    pub fn abandon_receive(&mut self, op: OperationId) {
        self.receive_queue.abandon(op);
    }

    /// Queue `data` without waiting. Returns the bytes accepted, which is
    /// 0 for a datagram that does not fit yet.
    pub fn try_send(&mut self, data: &[u8]) -> KcpCoreResult<usize> {
        let op = self.new_send_operation();
        let mut written = 0;
        match self.poll_send(None, op, data, &mut written) {
            Poll::Ready(result) => result.map(|()| written),
            Poll::Pending => Ok(written),
        }
    }

    /// Read the next message without waiting. `Ok(None)` when nothing is
    /// ready yet or the transport closed and the queue is drained.
    pub fn try_receive(&mut self, buf: &mut [u8]) -> KcpCoreResult<Option<usize>> {
        let op = self.new_receive_operation();
        match self.poll_receive(None, op, ReceiveTarget::Buffer(buf)) {
            Poll::Ready(result) => result,
            Poll::Pending => Ok(None),
        }
    }

    /// Size of the next complete message, if any.
    pub fn peek_size(&self) -> Option<usize> {
        self.receive_queue.try_peek()
    }

    // Lifecycle

    /// Stop sending. Received data stays readable; writes fail with
    /// [`KcpCoreError::ConnectionClosed`].
    pub fn set_transport_closed(&mut self) {
        if self.state != EngineState::Active {
            return;
        }
        self.state = EngineState::TransportClosed;
        self.release_protocol_buffers();
        self.send_queue.close(KcpCoreError::ConnectionClosed);
        self.receive_queue.set_transport_closed();
        info!(conv = %self.conv, "Transport closed");
    }

    fn enter_dead(&mut self) {
        self.state = EngineState::Dead;
        self.release_protocol_buffers();
        self.send_queue.close(KcpCoreError::MaxRetransmitExceeded);
        self.receive_queue.fail(KcpCoreError::MaxRetransmitExceeded);
        warn!(conv = %self.conv, "Retransmission limit exceeded, connection lost");
    }

    /// Release every buffer and fail all pending and future operations.
    pub fn dispose(&mut self) {
        if self.state == EngineState::Disposed {
            return;
        }
        self.state = EngineState::Disposed;
        self.release_protocol_buffers();
        self.send_queue.dispose();
        self.receive_queue.dispose();
        debug!(conv = %self.conv, "Engine disposed");
    }

    fn release_protocol_buffers(&mut self) {
        self.snd_buf = VecDeque::new();
        self.rcv_buf = VecDeque::new();
        self.ack_list.clear();
        self.output.clear();
    }
}

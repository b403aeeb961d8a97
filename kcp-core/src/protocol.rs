//! KCP protocol types, constants, and the segment wire codec

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// KCP protocol constants
pub mod constants {
    pub const IKCP_RTO_NDL: u32 = 30; // no delay min rto
    pub const IKCP_RTO_MIN: u32 = 100; // normal min rto
    pub const IKCP_RTO_DEF: u32 = 200; // default rto
    pub const IKCP_RTO_MAX: u32 = 60000; // max rto
    pub const IKCP_CMD_PUSH: u8 = 81; // cmd: push data
    pub const IKCP_CMD_ACK: u8 = 82; // cmd: ack
    pub const IKCP_CMD_WASK: u8 = 83; // cmd: window probe (ask)
    pub const IKCP_CMD_WINS: u8 = 84; // cmd: window size (tell)
    pub const IKCP_ASK_SEND: u32 = 1; // need to send IKCP_CMD_WASK
    pub const IKCP_ASK_TELL: u32 = 2; // need to send IKCP_CMD_WINS
    pub const IKCP_WND_SND: u32 = 32; // default send window
    pub const IKCP_WND_RCV: u32 = 128; // default receive window
    pub const IKCP_MTU_DEF: u32 = 1400; // default mtu
    pub const IKCP_ACK_FAST: u32 = 3; // fast ack threshold
    pub const IKCP_INTERVAL: u32 = 100; // default update interval
    pub const IKCP_OVERHEAD: u32 = 24; // kcp header overhead
    pub const IKCP_DEADLINK: u32 = 20; // max dead link count
    pub const IKCP_THRESH_INIT: u32 = 2; // initial slow start threshold
    pub const IKCP_THRESH_MIN: u32 = 2; // min slow start threshold
    pub const IKCP_PROBE_INIT: u32 = 7000; // 7 secs to probe window size
    pub const IKCP_PROBE_LIMIT: u32 = 120000; // up to 120 secs to probe window
    pub const IKCP_FASTACK_LIMIT: u32 = 5; // max times to trigger fastack
    pub const IKCP_MAX_FRAGMENTS: usize = 256; // frg is a single byte
    pub const IKCP_SEND_QUEUE_SIZE: usize = 1024; // default send queue capacity
}

/// Conversation ID type
pub type ConvId = u32;

/// Sequence number type
pub type SeqNum = u32;

/// Timestamp type (milliseconds on the engine clock)
pub type Timestamp = u32;

/// Segment command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Push,
    Ack,
    WindowAsk,
    WindowTell,
}

impl Command {
    pub fn as_u8(self) -> u8 {
        match self {
            Command::Push => constants::IKCP_CMD_PUSH,
            Command::Ack => constants::IKCP_CMD_ACK,
            Command::WindowAsk => constants::IKCP_CMD_WASK,
            Command::WindowTell => constants::IKCP_CMD_WINS,
        }
    }

    /// Get command type as string for debugging
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Push => "PUSH",
            Command::Ack => "ACK",
            Command::WindowAsk => "WASK",
            Command::WindowTell => "WINS",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            constants::IKCP_CMD_PUSH => Ok(Command::Push),
            constants::IKCP_CMD_ACK => Ok(Command::Ack),
            constants::IKCP_CMD_WASK => Ok(Command::WindowAsk),
            constants::IKCP_CMD_WINS => Ok(Command::WindowTell),
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a packet could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than a segment header
    Truncated { len: usize },
    /// Declared payload length runs past the end of the packet
    PayloadOverrun { declared: u32, remaining: usize },
    /// Command byte outside the known range
    UnknownCommand(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { len } => {
                write!(f, "packet of {len} bytes is shorter than the {} byte header", KcpHeader::SIZE)
            }
            DecodeError::PayloadOverrun { declared, remaining } => {
                write!(f, "payload length {declared} exceeds remaining {remaining} bytes")
            }
            DecodeError::UnknownCommand(cmd) => write!(f, "unknown command {cmd}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// KCP segment header structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcpHeader {
    pub conv: ConvId,
    pub cmd: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: Timestamp,
    pub sn: SeqNum,
    pub una: SeqNum,
    pub len: u32,
}

impl KcpHeader {
    /// Size of KCP header in bytes
    pub const SIZE: usize = 24;

    /// Create a new header
    pub fn new(conv: ConvId, cmd: Command) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            len: 0,
        }
    }

    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd.as_u8());
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    /// Decode header from the front of `buf`, advancing it past the header.
    pub fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::SIZE {
            return Err(DecodeError::Truncated { len: buf.len() });
        }

        let conv = buf.get_u32_le();
        let cmd = buf.get_u8();
        let header = Self {
            conv,
            cmd: Command::try_from(cmd)?,
            frg: buf.get_u8(),
            wnd: buf.get_u16_le(),
            ts: buf.get_u32_le(),
            sn: buf.get_u32_le(),
            una: buf.get_u32_le(),
            len: buf.get_u32_le(),
        };
        Ok(header)
    }

    /// Decode the first header of a packet without consuming it.
    pub fn peek(packet: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = packet;
        Self::decode(&mut buf)
    }
}

/// A decoded segment borrowing its payload from the packet it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub header: KcpHeader,
    pub payload: &'a [u8],
}

impl<'a> Segment<'a> {
    pub fn new(mut header: KcpHeader, payload: &'a [u8]) -> Self {
        header.len = payload.len() as u32;
        Self { header, payload }
    }

    /// Encode segment into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());
        self.header.encode(buf);
        buf.extend_from_slice(self.payload);
    }

    /// Decode one segment from the front of `buf`, advancing it past the
    /// segment so consecutive calls walk a batched datagram.
    pub fn decode(buf: &mut &'a [u8]) -> Result<Self, DecodeError> {
        let header = KcpHeader::decode(buf)?;
        let len = header.len as usize;
        if buf.len() < len {
            return Err(DecodeError::PayloadOverrun {
                declared: header.len,
                remaining: buf.len(),
            });
        }

        let (payload, rest) = buf.split_at(len);
        *buf = rest;
        Ok(Self { header, payload })
    }

    /// Get total segment size
    pub fn size(&self) -> usize {
        KcpHeader::SIZE + self.payload.len()
    }
}

/// Statistics for a KCP conversation
#[derive(Debug, Default, Clone, Copy)]
pub struct KcpStats {
    /// Total payload bytes accepted from the application
    pub bytes_sent: u64,
    /// Total payload bytes delivered to the application
    pub bytes_received: u64,
    /// Total datagrams produced
    pub packets_sent: u64,
    /// Total datagrams accepted
    pub packets_received: u64,
    /// Datagrams dropped as malformed
    pub packets_malformed: u64,
    /// Timeout retransmissions
    pub retransmissions: u64,
    /// Fast retransmissions
    pub fast_retransmissions: u64,
    /// Current RTT in milliseconds
    pub rtt: u32,
    /// RTT variance
    pub rtt_var: u32,
    /// Current RTO
    pub rto: u32,
    /// Congestion window size
    pub cwnd: u32,
    /// Segments in send buffer
    pub snd_buf_size: u32,
    /// Segments in receive buffer
    pub rcv_buf_size: u32,
}

/// Calculate time difference handling wrapping
#[inline]
pub fn time_diff(later: Timestamp, earlier: Timestamp) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Check if a sequence number is before another (handling wrapping)
#[inline]
pub fn seq_before(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// Check if a sequence number is after another (handling wrapping)
#[inline]
pub fn seq_after(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

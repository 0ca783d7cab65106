//! Wire format shared between the in-kernel probes and the userspace agent.
//!
//! All multi-byte fields are little-endian, except the address/port fields
//! inside the embedded sockaddr block, which keep their kernel (network
//! order) layout. Layouts are fixed; the decoders below are the single
//! source of truth for field offsets.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::fmt;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Maximum payload bytes the probes ship per data event; anything longer is
/// truncated in the kernel and `orig_len` carries the untruncated size.
pub const MAX_EVENT_PAYLOAD: usize = 30720;

/// Size of a control event on the wire.
pub const CONTROL_EVENT_SIZE: usize = 60;

/// Size of a data event header; the payload follows immediately.
pub const DATA_EVENT_HEADER_SIZE: usize = 52;

/// Size of the embedded sockaddr block (sockaddr_in6-compatible).
pub const SOCKADDR_SIZE: usize = 28;

/// Names of the pinned perf buffers the agent drains.
pub const CONTROL_EVENTS_MAP: &str = "socket_control_events";
pub const DATA_EVENTS_MAP: &str = "socket_data_events";

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

/// Packs a `(tgid, fd)` pair into the demux key used by the agent.
#[inline]
pub const fn stream_key(tgid: u32, fd: u32) -> u64 {
    ((tgid as u64) << 32) | fd as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    Truncated { need: usize, got: usize },
    BadKind(u32),
    BadDirection(u8),
    PayloadOverrun { declared: usize, got: usize },
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Truncated { need, got } => {
                write!(f, "event truncated: need {need} bytes, got {got}")
            }
            EventError::BadKind(k) => write!(f, "unknown control event kind {k}"),
            EventError::BadDirection(d) => write!(f, "unknown traffic direction {d}"),
            EventError::PayloadOverrun { declared, got } => {
                write!(f, "payload_len {declared} exceeds remaining {got} bytes")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EventError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlKind {
    Open = 0,
    Close = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrafficDirection {
    Egress = 0,
    Ingress = 1,
}

impl TrafficDirection {
    pub fn flip(self) -> Self {
        match self {
            TrafficDirection::Egress => TrafficDirection::Ingress,
            TrafficDirection::Ingress => TrafficDirection::Egress,
        }
    }
}

/// Raw sockaddr block as shipped by the probes. Zeroed for `Close` events.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SockAddrBytes(pub [u8; SOCKADDR_SIZE]);

impl SockAddrBytes {
    pub const ZERO: SockAddrBytes = SockAddrBytes([0u8; SOCKADDR_SIZE]);

    /// Interprets the block as sockaddr_in / sockaddr_in6. Returns `None`
    /// for unknown families (including the zeroed Close block).
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let b = &self.0;
        let family = u16::from_le_bytes([b[0], b[1]]);
        let port = u16::from_be_bytes([b[2], b[3]]);
        match family {
            AF_INET => {
                let ip = Ipv4Addr::new(b[4], b[5], b[6], b[7]);
                Some(SocketAddr::new(IpAddr::V4(ip), port))
            }
            AF_INET6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[8..24]);
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => None,
        }
    }

    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        let mut b = [0u8; SOCKADDR_SIZE];
        match addr {
            SocketAddr::V4(v4) => {
                b[0..2].copy_from_slice(&AF_INET.to_le_bytes());
                b[2..4].copy_from_slice(&v4.port().to_be_bytes());
                b[4..8].copy_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                b[0..2].copy_from_slice(&AF_INET6.to_le_bytes());
                b[2..4].copy_from_slice(&v6.port().to_be_bytes());
                b[8..24].copy_from_slice(&v6.ip().octets());
            }
        }
        SockAddrBytes(b)
    }
}

impl fmt::Debug for SockAddrBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "SockAddrBytes({addr})"),
            None => write!(f, "SockAddrBytes(<none>)"),
        }
    }
}

/// Fixed-size control event: socket open/close.
///
/// Layout (little-endian):
/// ```text
/// offset  field
/// 0       kind: u32          (0=Open, 1=Close)
/// 4       pad:  u32
/// 8       ts_ns: u64
/// 16      tgid: u32
/// 20      fd:   u32
/// 24      generation: u64
/// 32      remote_addr: [u8; 28]
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlEvent {
    pub kind: ControlKind,
    pub ts_ns: u64,
    pub tgid: u32,
    pub fd: u32,
    pub generation: u64,
    pub remote_addr: SockAddrBytes,
}

impl ControlEvent {
    pub fn parse(buf: &[u8]) -> Result<ControlEvent, EventError> {
        if buf.len() < CONTROL_EVENT_SIZE {
            return Err(EventError::Truncated {
                need: CONTROL_EVENT_SIZE,
                got: buf.len(),
            });
        }
        let kind = match read_u32(buf, 0) {
            0 => ControlKind::Open,
            1 => ControlKind::Close,
            k => return Err(EventError::BadKind(k)),
        };
        let mut remote = [0u8; SOCKADDR_SIZE];
        remote.copy_from_slice(&buf[32..32 + SOCKADDR_SIZE]);
        Ok(ControlEvent {
            kind,
            ts_ns: read_u64(buf, 8),
            tgid: read_u32(buf, 16),
            fd: read_u32(buf, 20),
            generation: read_u64(buf, 24),
            remote_addr: SockAddrBytes(remote),
        })
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, EventError> {
        if out.len() < CONTROL_EVENT_SIZE {
            return Err(EventError::Truncated {
                need: CONTROL_EVENT_SIZE,
                got: out.len(),
            });
        }
        write_u32(out, 0, self.kind as u32);
        write_u32(out, 4, 0);
        write_u64(out, 8, self.ts_ns);
        write_u32(out, 16, self.tgid);
        write_u32(out, 20, self.fd);
        write_u64(out, 24, self.generation);
        out[32..32 + SOCKADDR_SIZE].copy_from_slice(&self.remote_addr.0);
        Ok(CONTROL_EVENT_SIZE)
    }

    #[inline]
    pub fn stream_key(&self) -> u64 {
        stream_key(self.tgid, self.fd)
    }
}

/// Header of a variable-size data event.
///
/// Layout (little-endian):
/// ```text
/// offset  field
/// 0       ts_ns: u64
/// 8       tgid: u32
/// 12      fd:   u32
/// 16      generation: u64
/// 24      direction: u8      (0=Egress, 1=Ingress)
/// 25      pad: [u8; 3]
/// 28      seq: u64           (byte position of payload[0] in the stream)
/// 36      payload_len: u32
/// 40      pad2: u32
/// 44      orig_len: u64      (untruncated length; > payload_len if truncated)
/// 52      payload: [u8; payload_len]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub ts_ns: u64,
    pub tgid: u32,
    pub fd: u32,
    pub generation: u64,
    pub direction: TrafficDirection,
    pub seq: u64,
    pub payload_len: u32,
    pub orig_len: u64,
}

impl DataHeader {
    #[inline]
    pub fn stream_key(&self) -> u64 {
        stream_key(self.tgid, self.fd)
    }

    /// True when the kernel shipped fewer bytes than the syscall moved.
    #[inline]
    pub fn truncated(&self) -> bool {
        self.orig_len > self.payload_len as u64
    }
}

/// A decoded data event borrowing its payload from the receive buffer.
/// Payload bytes are only valid for the duration of the poll callback and
/// must be copied before they are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEvent<'a> {
    pub header: DataHeader,
    pub payload: &'a [u8],
}

impl<'a> DataEvent<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<DataEvent<'a>, EventError> {
        if buf.len() < DATA_EVENT_HEADER_SIZE {
            return Err(EventError::Truncated {
                need: DATA_EVENT_HEADER_SIZE,
                got: buf.len(),
            });
        }
        let direction = match buf[24] {
            0 => TrafficDirection::Egress,
            1 => TrafficDirection::Ingress,
            d => return Err(EventError::BadDirection(d)),
        };
        let payload_len = read_u32(buf, 36) as usize;
        let rest = &buf[DATA_EVENT_HEADER_SIZE..];
        if payload_len > rest.len() || payload_len > MAX_EVENT_PAYLOAD {
            return Err(EventError::PayloadOverrun {
                declared: payload_len,
                got: rest.len(),
            });
        }
        Ok(DataEvent {
            header: DataHeader {
                ts_ns: read_u64(buf, 0),
                tgid: read_u32(buf, 8),
                fd: read_u32(buf, 12),
                generation: read_u64(buf, 16),
                direction,
                seq: read_u64(buf, 28),
                payload_len: payload_len as u32,
                orig_len: read_u64(buf, 44),
            },
            payload: &rest[..payload_len],
        })
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, EventError> {
        let total = DATA_EVENT_HEADER_SIZE + self.payload.len();
        if out.len() < total {
            return Err(EventError::Truncated {
                need: total,
                got: out.len(),
            });
        }
        let h = &self.header;
        write_u64(out, 0, h.ts_ns);
        write_u32(out, 8, h.tgid);
        write_u32(out, 12, h.fd);
        write_u64(out, 16, h.generation);
        out[24] = h.direction as u8;
        out[25..28].fill(0);
        write_u64(out, 28, h.seq);
        write_u32(out, 36, self.payload.len() as u32);
        write_u32(out, 40, 0);
        write_u64(out, 44, h.orig_len);
        out[DATA_EVENT_HEADER_SIZE..total].copy_from_slice(self.payload);
        Ok(total)
    }
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

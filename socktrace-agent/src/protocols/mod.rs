//! Protocol classification and parser/matcher dispatch. The protocol set
//! is closed, so everything dispatches over a tagged enum.

pub mod core;
pub mod http;
pub mod http2;
pub mod mysql;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use socktrace_common::TrafficDirection;

use crate::config::Config;
use crate::protocols::core::parse::{Frame, ParseOutcome};
use crate::protocols::http::{HttpState, HttpRecord};
use crate::protocols::http2::{Http2Record, Http2State};
use crate::protocols::mysql::{MysqlRecord, MysqlState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Unknown,
    Http,
    Http2,
    Mysql,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Unknown => "unknown",
            Protocol::Http => "http",
            Protocol::Http2 => "http2",
            Protocol::Mysql => "mysql",
        }
    }
}

fn le24(buf: &[u8]) -> usize {
    u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize
}

fn looks_like_http(buf: &[u8]) -> bool {
    if buf.starts_with(b"HTTP/1.") {
        return true;
    }
    http::METHODS
        .iter()
        .any(|m| buf.len() > m.len() && buf.starts_with(m.as_bytes()) && buf[m.len()] == b' ')
}

/// HTTP/2 without preface knowledge: the server's first frame must be a
/// SETTINGS frame on stream 0 with a payload that is a multiple of six.
fn looks_like_http2_settings(buf: &[u8]) -> bool {
    if buf.len() < 9 {
        return false;
    }
    let len = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
    let typ = buf[3];
    let sid = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
    typ == 0x4 && sid == 0 && len % 6 == 0 && len <= 1024
}

/// MySQL server greeting: packet header with sequence 0 whose payload
/// starts with protocol version 10.
fn looks_like_mysql_greeting(buf: &[u8]) -> bool {
    buf.len() >= 5 && buf[3] == 0 && buf[4] == 0x0a && le24(buf) >= 1 && le24(buf) + 4 <= buf.len()
}

/// MySQL client command stream: starts with a packet carrying sequence 0
/// and a known command byte, and every packet boundary after it lines up.
fn looks_like_mysql_command(buf: &[u8]) -> bool {
    if buf.len() < 5 || buf[3] != 0 || buf[4] > 0x1f {
        return false;
    }
    if mysql::command_name(buf[4]) == "COM_UNKNOWN" {
        return false;
    }
    let mut pos = 0usize;
    let mut complete = 0usize;
    while pos + 4 <= buf.len() && complete < 4 {
        let len = le24(&buf[pos..]);
        if len == 0 {
            return false;
        }
        if pos + 4 + len > buf.len() {
            // Partial tail; what we have so far must have aligned.
            break;
        }
        pos += 4 + len;
        complete += 1;
    }
    complete >= 1
}

/// Inspects the first bytes of both directions and picks a protocol.
/// Returns `Unknown` until something definite shows up; the caller gives
/// up once the classify window is exhausted.
pub fn classify(egress: &[u8], ingress: &[u8]) -> Protocol {
    if egress.starts_with(http2::PREFACE) || looks_like_http2_settings(ingress) {
        return Protocol::Http2;
    }
    if looks_like_http(egress) || looks_like_http(ingress) {
        return Protocol::Http;
    }
    if looks_like_mysql_greeting(ingress) || looks_like_mysql_command(egress) {
        return Protocol::Mysql;
    }
    Protocol::Unknown
}

/// Per-connection protocol memory: matcher queues, HPACK tables, prepared
/// statements. Owned by exactly one tracker.
pub enum ProtocolState {
    Http(HttpState),
    Http2(Http2State),
    Mysql(MysqlState),
}

impl ProtocolState {
    pub fn new(protocol: Protocol, cfg: &Config) -> Option<ProtocolState> {
        match protocol {
            Protocol::Http => Some(ProtocolState::Http(HttpState::default())),
            Protocol::Http2 => Some(ProtocolState::Http2(Http2State::new(
                cfg.hpack_max_table_size,
            ))),
            Protocol::Mysql => Some(ProtocolState::Mysql(MysqlState::default())),
            Protocol::Unknown => None,
        }
    }
}

/// Runs the protocol parser over one direction's contiguous view.
pub fn parse_frames(
    state: &mut ProtocolState,
    direction: TrafficDirection,
    buf: &[u8],
    base_seq: u64,
    ts_at: &dyn Fn(u64) -> u64,
) -> ParseOutcome {
    match state {
        ProtocolState::Http(http_state) => {
            let dir_state = match direction {
                TrafficDirection::Egress => &mut http_state.egress,
                TrafficDirection::Ingress => &mut http_state.ingress,
            };
            http::parse(buf, dir_state, base_seq, ts_at)
        }
        ProtocolState::Http2(h2_state) => {
            http2::parse(buf, direction, h2_state.dir_mut(direction), base_seq, ts_at)
        }
        ProtocolState::Mysql(_) => mysql::parse(buf, direction, base_seq, ts_at),
    }
}

/// A request/response pair ready for table append.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Http(HttpRecord),
    Http2(Http2Record),
    Mysql(MysqlRecord),
}

impl Record {
    pub fn time_ns(&self) -> u64 {
        match self {
            Record::Http(r) => r.time_ns(),
            Record::Http2(r) => r.time_ns(),
            Record::Mysql(r) => r.req_ts_ns,
        }
    }
}

#[derive(Debug, Default)]
pub struct MatchSummary {
    pub records: Vec<Record>,
    pub expired_requests: u64,
    pub stitch_failures: u64,
}

/// Drains parsed frames from both directions, in timestamp order, through
/// the protocol matcher.
pub fn match_records(
    state: &mut ProtocolState,
    egress: &mut VecDeque<Frame>,
    ingress: &mut VecDeque<Frame>,
    now: Instant,
    req_timeout: Duration,
) -> MatchSummary {
    let merged = merge_by_time(egress, ingress);
    let mut summary = MatchSummary::default();
    match state {
        ProtocolState::Http(http_state) => {
            let messages = merged.into_iter().filter_map(|f| match f {
                Frame::Http(m) => Some(m),
                _ => None,
            });
            let out = http_state.match_frames(messages, now, req_timeout);
            summary.records = out.records.into_iter().map(Record::Http).collect();
            summary.expired_requests = out.expired_requests;
        }
        ProtocolState::Http2(h2_state) => {
            let halves = merged.into_iter().filter_map(|f| match f {
                Frame::Http2(h) => Some(h),
                _ => None,
            });
            let out = h2_state.match_frames(halves, now, req_timeout);
            summary.records = out.records.into_iter().map(Record::Http2).collect();
            summary.expired_requests = out.expired_streams;
            summary.stitch_failures = out.stitch_failures;
        }
        ProtocolState::Mysql(mysql_state) => {
            let packets = merged.into_iter().filter_map(|f| match f {
                Frame::Mysql(p) => Some(p),
                _ => None,
            });
            let out = mysql_state.match_frames(packets, now, req_timeout);
            summary.records = out.records.into_iter().map(Record::Mysql).collect();
            summary.expired_requests = out.expired_requests;
            summary.stitch_failures = out.stitch_failures;
        }
    }
    summary
}

/// Merges two per-direction (already time-ordered) frame queues into one
/// time-ordered sequence. Ties go to egress, so a request observed in the
/// same instant as its response is matched, not orphaned.
fn merge_by_time(egress: &mut VecDeque<Frame>, ingress: &mut VecDeque<Frame>) -> Vec<Frame> {
    let mut merged = Vec::with_capacity(egress.len() + ingress.len());
    while !egress.is_empty() || !ingress.is_empty() {
        let take_egress = match (egress.front(), ingress.front()) {
            (Some(e), Some(i)) => e.timestamp_ns() <= i.timestamp_ns(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        let frame = if take_egress {
            egress.pop_front()
        } else {
            ingress.pop_front()
        };
        merged.extend(frame);
    }
    merged
}

//! HTTP/2 framing, stream assembly, and gRPC stream pairing.

pub mod hpack;
pub mod protobuf;

use std::time::{Duration, Instant};

use ahash::AHashMap;

use socktrace_common::TrafficDirection;

use crate::protocols::core::parse::{Frame, ParseOutcome};

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_RST_STREAM: u8 = 0x3;
const FRAME_PUSH_PROMISE: u8 = 0x5;
const FRAME_CONTINUATION: u8 = 0x9;
const FRAME_TYPE_MAX: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// Frames longer than this are treated as a framing error rather than
/// buffered; well beyond the default SETTINGS_MAX_FRAME_SIZE.
const MAX_FRAME_LEN: usize = 1 << 20;

/// One direction of an HTTP/2 stream, emitted once END_STREAM (or a
/// reset) is observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Http2HalfStream {
    pub stream_id: u32,
    pub direction: Option<TrafficDirection>,
    pub headers: Vec<(String, String)>,
    pub trailers: Vec<(String, String)>,
    pub data: Vec<u8>,
    pub reset: bool,
    pub first_ts_ns: u64,
    pub end_ts_ns: u64,
}

impl Http2HalfStream {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        find_header(&self.trailers, name)
    }

    pub fn path(&self) -> Option<&str> {
        self.header(":path")
    }

    pub fn status(&self) -> Option<u16> {
        self.header(":status").and_then(|s| s.parse().ok())
    }

    pub fn is_request(&self) -> bool {
        self.header(":method").is_some()
    }

    pub fn is_grpc(&self) -> bool {
        self.header("content-type")
            .map(|ct| ct.starts_with("application/grpc"))
            .unwrap_or(false)
    }

    pub fn headers_text(&self) -> String {
        let mut out = String::new();
        for (n, v) in self.headers.iter().chain(self.trailers.iter()) {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(n);
            out.push_str(": ");
            out.push_str(v);
        }
        out
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Http2HalfStream>()
            + self.data.len()
            + self
                .headers
                .iter()
                .chain(self.trailers.iter())
                .map(|(n, v)| n.len() + v.len())
                .sum::<usize>()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[derive(Debug, Default)]
struct StreamAssembly {
    headers: Vec<(String, String)>,
    trailers: Vec<(String, String)>,
    data: Vec<u8>,
    have_headers: bool,
    first_ts_ns: u64,
}

#[derive(Debug)]
struct PartialHeaders {
    stream_id: u32,
    end_stream: bool,
    fragment: Vec<u8>,
    /// PUSH_PROMISE blocks are decoded for table consistency but not kept.
    discard: bool,
}

/// Per-direction parser state; the HPACK table is owned here and never
/// shared across connections or directions.
pub struct Http2DirState {
    preface_checked: bool,
    hpack: hpack::Decoder,
    continuation: Option<PartialHeaders>,
    streams: AHashMap<u32, StreamAssembly>,
}

impl Http2DirState {
    pub fn new(hpack_cap: usize) -> Self {
        Self {
            preface_checked: false,
            hpack: hpack::Decoder::new(hpack_cap),
            continuation: None,
            streams: AHashMap::new(),
        }
    }

    fn complete(&mut self, out: &mut ParseOutcome, sid: u32, direction: TrafficDirection, ts: u64, reset: bool) {
        let Some(asm) = self.streams.remove(&sid) else {
            return;
        };
        out.frames.push(Frame::Http2(Http2HalfStream {
            stream_id: sid,
            direction: Some(direction),
            headers: asm.headers,
            trailers: asm.trailers,
            data: asm.data,
            reset,
            first_ts_ns: asm.first_ts_ns,
            end_ts_ns: ts,
        }));
    }

    fn apply_header_block(
        &mut self,
        out: &mut ParseOutcome,
        sid: u32,
        direction: TrafficDirection,
        fragment: &[u8],
        end_stream: bool,
        discard: bool,
        ts: u64,
    ) {
        match self.hpack.decode_block(fragment) {
            Ok(headers) => {
                if !discard {
                    let asm = self.streams.entry(sid).or_insert_with(|| StreamAssembly {
                        first_ts_ns: ts,
                        ..Default::default()
                    });
                    if asm.have_headers {
                        asm.trailers = headers;
                    } else {
                        asm.headers = headers;
                        asm.have_headers = true;
                    }
                }
            }
            // A rejected table-size update leaves the decoder out of sync
            // with the peer's encoder for good; every later block would be
            // garbage.
            Err(hpack::HpackError::TableSizeExceeded) => {
                out.fatal = Some("hpack table size exceeded");
                return;
            }
            Err(_) => {
                out.recoverable_errors += 1;
            }
        }
        if end_stream && !discard {
            self.complete(out, sid, direction, ts, false);
        }
    }
}

/// Parses HTTP/2 frames from a contiguous view. Misaligned input resyncs
/// by scanning forward for the next plausible frame header.
pub fn parse(
    buf: &[u8],
    direction: TrafficDirection,
    dir_state: &mut Http2DirState,
    base_seq: u64,
    ts_at: &dyn Fn(u64) -> u64,
) -> ParseOutcome {
    let mut out = ParseOutcome::default();
    let mut off = 0usize;

    if !dir_state.preface_checked {
        if direction == TrafficDirection::Egress {
            let n = buf.len().min(PREFACE.len());
            if buf[..n] == PREFACE[..n] {
                if n < PREFACE.len() {
                    out.needs_more = true;
                    return out;
                }
                off = PREFACE.len();
            }
        }
        dir_state.preface_checked = true;
    }

    while off < buf.len() {
        let input = &buf[off..];
        if input.len() < 9 {
            out.needs_more = true;
            break;
        }
        let len = u32::from_be_bytes([0, input[0], input[1], input[2]]) as usize;
        let typ = input[3];
        let flags = input[4];
        let sid = u32::from_be_bytes([input[5], input[6], input[7], input[8]]) & 0x7fff_ffff;
        if typ > FRAME_TYPE_MAX || len > MAX_FRAME_LEN {
            off += 1;
            out.recoverable_errors += 1;
            continue;
        }
        if input.len() < 9 + len {
            out.needs_more = true;
            break;
        }
        let payload = &input[9..9 + len];
        let ts = ts_at(base_seq + off as u64);

        // An unfinished header block must be continued before any other
        // frame; a violation drops the partial block.
        if dir_state.continuation.is_some() && typ != FRAME_CONTINUATION {
            dir_state.continuation = None;
            out.recoverable_errors += 1;
        }

        match typ {
            FRAME_DATA => {
                if let Some(body) = strip_padding(payload, flags, false) {
                    let asm = dir_state
                        .streams
                        .entry(sid)
                        .or_insert_with(|| StreamAssembly {
                            first_ts_ns: ts,
                            ..Default::default()
                        });
                    asm.data.extend_from_slice(body);
                    if flags & FLAG_END_STREAM != 0 {
                        dir_state.complete(&mut out, sid, direction, ts, false);
                    }
                } else {
                    out.recoverable_errors += 1;
                }
            }
            FRAME_HEADERS => {
                if let Some(fragment) = strip_padding(payload, flags, true) {
                    let end_stream = flags & FLAG_END_STREAM != 0;
                    if flags & FLAG_END_HEADERS != 0 {
                        dir_state.apply_header_block(
                            &mut out, sid, direction, fragment, end_stream, false, ts,
                        );
                    } else {
                        dir_state.continuation = Some(PartialHeaders {
                            stream_id: sid,
                            end_stream,
                            fragment: fragment.to_vec(),
                            discard: false,
                        });
                    }
                } else {
                    out.recoverable_errors += 1;
                }
            }
            FRAME_CONTINUATION => match dir_state.continuation.take() {
                Some(mut partial) if partial.stream_id == sid => {
                    partial.fragment.extend_from_slice(payload);
                    if flags & FLAG_END_HEADERS != 0 {
                        dir_state.apply_header_block(
                            &mut out,
                            sid,
                            direction,
                            &partial.fragment,
                            partial.end_stream,
                            partial.discard,
                            ts,
                        );
                    } else {
                        dir_state.continuation = Some(partial);
                    }
                }
                _ => {
                    out.recoverable_errors += 1;
                }
            },
            FRAME_PUSH_PROMISE => {
                // The promised header block still mutates the HPACK table.
                if let Some(rest) = strip_padding(payload, flags, false) {
                    if rest.len() >= 4 {
                        let fragment = &rest[4..];
                        if flags & FLAG_END_HEADERS != 0 {
                            dir_state
                                .apply_header_block(&mut out, sid, direction, fragment, false, true, ts);
                        } else {
                            dir_state.continuation = Some(PartialHeaders {
                                stream_id: sid,
                                end_stream: false,
                                fragment: fragment.to_vec(),
                                discard: true,
                            });
                        }
                    }
                }
            }
            FRAME_RST_STREAM => {
                dir_state.complete(&mut out, sid, direction, ts, true);
            }
            // SETTINGS, PING, GOAWAY, WINDOW_UPDATE, PRIORITY carry no
            // stream payload we reconstruct.
            _ => {}
        }
        off += 9 + len;
        if out.fatal.is_some() {
            break;
        }
    }
    out.consumed = off;
    out
}

fn strip_padding(payload: &[u8], flags: u8, has_priority: bool) -> Option<&[u8]> {
    let mut p = payload;
    let pad_len = if flags & FLAG_PADDED != 0 {
        let n = *p.first()? as usize;
        p = &p[1..];
        n
    } else {
        0
    };
    if has_priority && flags & FLAG_PRIORITY != 0 {
        if p.len() < 5 {
            return None;
        }
        p = &p[5..];
    }
    if pad_len > p.len() {
        return None;
    }
    Some(&p[..p.len() - pad_len])
}

/// A request/response stream pair, matched by stream id.
#[derive(Debug, Clone, PartialEq)]
pub struct Http2Record {
    pub req: Http2HalfStream,
    pub resp: Http2HalfStream,
    pub latency_ns: u64,
}

impl Http2Record {
    pub fn time_ns(&self) -> u64 {
        self.req.first_ts_ns
    }

    pub fn is_grpc(&self) -> bool {
        self.req.is_grpc() || self.resp.is_grpc()
    }
}

#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub records: Vec<Http2Record>,
    pub expired_streams: u64,
    pub stitch_failures: u64,
}

/// Connection-level HTTP/2 state: one parser per direction plus pending
/// halves waiting for their peer.
pub struct Http2State {
    pub egress: Http2DirState,
    pub ingress: Http2DirState,
    pending: AHashMap<u32, (Http2HalfStream, Instant)>,
}

impl Http2State {
    pub fn new(hpack_cap: usize) -> Self {
        Self {
            egress: Http2DirState::new(hpack_cap),
            ingress: Http2DirState::new(hpack_cap),
            pending: AHashMap::new(),
        }
    }

    pub fn dir_mut(&mut self, direction: TrafficDirection) -> &mut Http2DirState {
        match direction {
            TrafficDirection::Egress => &mut self.egress,
            TrafficDirection::Ingress => &mut self.ingress,
        }
    }

    /// Pairs half-streams by stream id.
    pub fn match_frames(
        &mut self,
        halves: impl Iterator<Item = Http2HalfStream>,
        now: Instant,
        req_timeout: Duration,
    ) -> MatchOutcome {
        let mut out = MatchOutcome::default();
        for half in halves {
            let sid = half.stream_id;
            match self.pending.remove(&sid) {
                Some((peer, _)) if peer.direction != half.direction => {
                    let (req, resp) = if peer.is_request() || half.header(":status").is_some() {
                        (peer, half)
                    } else {
                        (half, peer)
                    };
                    let latency_ns = resp.end_ts_ns.saturating_sub(req.first_ts_ns);
                    out.records.push(Http2Record {
                        req,
                        resp,
                        latency_ns,
                    });
                }
                Some((_peer, since)) => {
                    // Same direction twice: stream ids wrapped or were
                    // reused; keep the newer one.
                    out.stitch_failures += 1;
                    self.pending.insert(sid, (half, since));
                }
                None => {
                    self.pending.insert(sid, (half, now));
                }
            }
        }
        self.pending.retain(|_, (_, since)| {
            if now.duration_since(*since) >= req_timeout {
                out.expired_streams += 1;
                false
            } else {
                true
            }
        });
        out
    }

    pub fn outstanding_streams(&self) -> usize {
        self.pending.len()
    }
}

/// Splits a gRPC message body into `(compressed, message)` chunks.
pub fn decode_grpc_messages(data: &[u8]) -> Vec<(bool, &[u8])> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while data.len() >= pos + 5 {
        let compressed = data[pos] != 0;
        let len = u32::from_be_bytes([data[pos + 1], data[pos + 2], data[pos + 3], data[pos + 4]])
            as usize;
        if data.len() < pos + 5 + len {
            break;
        }
        out.push((compressed, &data[pos + 5..pos + 5 + len]));
        pos += 5 + len;
    }
    out
}

//! HTTP/1.x stream parsing and request/response pairing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::protocols::core::parse::{Frame, MessageKind, ParseOutcome};

const MAX_HEADER_BYTES: usize = 8192;

pub const METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// One parsed HTTP/1.x message, request or response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpMessage {
    pub kind: MessageKind,
    pub minor_version: u8,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub reason: String,
    /// Headers in wire order, names lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub ts_ns: u64,
    /// Byte position of the message's first byte within its stream.
    pub stream_pos: u64,
}

impl HttpMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_text(&self) -> String {
        let mut out = String::new();
        for (n, v) in &self.headers {
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
        std::mem::size_of::<HttpMessage>()
            + self.body.len()
            + self
                .headers
                .iter()
                .map(|(n, v)| n.len() + v.len())
                .sum::<usize>()
    }
}

/// Per-direction parser memory: once a stream has produced a request or a
/// response, the direction's message kind is fixed.
#[derive(Debug, Default)]
pub struct HttpDirState {
    pub kind: MessageKind,
}

/// Connection-level matcher state.
#[derive(Debug, Default)]
pub struct HttpState {
    pub egress: HttpDirState,
    pub ingress: HttpDirState,
    outstanding: VecDeque<PendingRequest>,
}

#[derive(Debug)]
struct PendingRequest {
    msg: HttpMessage,
    since: Instant,
}

/// A matched pair, or an orphan response with no surviving request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRecord {
    pub req: Option<HttpMessage>,
    pub resp: HttpMessage,
    pub orphan: bool,
    pub latency_ns: u64,
}

impl HttpRecord {
    pub fn time_ns(&self) -> u64 {
        self.req.as_ref().map(|r| r.ts_ns).unwrap_or(self.resp.ts_ns)
    }
}

enum Sniff {
    Request,
    Response,
    NeedsMore,
    Neither,
}

/// Scans past junk for the next plausible message start: a request line
/// method or a status line. Returns the offset to skip to and whether the
/// match is only a prefix cut off at the end of the view.
fn resync(input: &[u8]) -> (usize, bool) {
    for i in 1..input.len() {
        match sniff_kind(&input[i..]) {
            Sniff::Request | Sniff::Response => return (i, false),
            Sniff::NeedsMore => return (i, true),
            Sniff::Neither => {}
        }
    }
    (input.len(), false)
}

fn sniff_kind(input: &[u8]) -> Sniff {
    const RESP_PREFIX: &[u8] = b"HTTP/";
    let n = input.len().min(RESP_PREFIX.len());
    if input[..n] == RESP_PREFIX[..n] {
        return if n == RESP_PREFIX.len() {
            Sniff::Response
        } else {
            Sniff::NeedsMore
        };
    }
    for m in METHODS {
        let mb = m.as_bytes();
        let n = input.len().min(mb.len() + 1);
        let mut with_space = [0u8; 16];
        with_space[..mb.len()].copy_from_slice(mb);
        with_space[mb.len()] = b' ';
        if input[..n] == with_space[..n] {
            return if n == mb.len() + 1 {
                Sniff::Request
            } else {
                Sniff::NeedsMore
            };
        }
    }
    Sniff::Neither
}

enum BodyFraming {
    Length(usize),
    Chunked,
    None,
}

fn body_framing(headers: &[(String, String)], kind: MessageKind, status: u16) -> BodyFraming {
    if kind == MessageKind::Response && (status / 100 == 1 || status == 204 || status == 304) {
        return BodyFraming::None;
    }
    let mut framing = BodyFraming::None;
    for (n, v) in headers {
        if n.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
        {
            return BodyFraming::Chunked;
        }
        if n.eq_ignore_ascii_case("content-length") {
            if let Ok(len) = v.trim().parse::<usize>() {
                framing = BodyFraming::Length(len);
            }
        }
    }
    framing
}

enum ChunkedResult {
    Complete { body: Vec<u8>, consumed: usize },
    Partial,
    Invalid,
}

/// Decodes a chunked transfer-coding body, including optional trailers.
fn decode_chunked(buf: &[u8]) -> ChunkedResult {
    let mut body = Vec::new();
    let mut pos = 0usize;
    loop {
        let line_end = match find(&buf[pos..], b"\r\n") {
            Some(i) => pos + i,
            None => {
                return if buf.len() - pos > 18 {
                    // A chunk-size line cannot be this long.
                    ChunkedResult::Invalid
                } else {
                    ChunkedResult::Partial
                };
            }
        };
        let size_text = &buf[pos..line_end];
        let size_hex = size_text
            .split(|&b| b == b';')
            .next()
            .unwrap_or(size_text);
        let size_str = match std::str::from_utf8(size_hex) {
            Ok(s) => s.trim(),
            Err(_) => return ChunkedResult::Invalid,
        };
        let size = match usize::from_str_radix(size_str, 16) {
            Ok(s) => s,
            Err(_) => return ChunkedResult::Invalid,
        };
        pos = line_end + 2;
        if size == 0 {
            // Optional trailer section, terminated by an empty line.
            if buf[pos..].starts_with(b"\r\n") {
                return ChunkedResult::Complete {
                    body,
                    consumed: pos + 2,
                };
            }
            return match find(&buf[pos..], b"\r\n\r\n") {
                Some(i) => ChunkedResult::Complete {
                    body,
                    consumed: pos + i + 4,
                },
                None => ChunkedResult::Partial,
            };
        }
        if buf.len() < pos + size + 2 {
            return ChunkedResult::Partial;
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return ChunkedResult::Invalid;
        }
        pos += size + 2;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Parses as many complete messages as the contiguous view holds.
/// Malformed input is skipped one byte at a time, mirroring how a human
/// reader would hunt for the next request line.
pub fn parse(
    buf: &[u8],
    dir_state: &mut HttpDirState,
    base_seq: u64,
    ts_at: &dyn Fn(u64) -> u64,
) -> ParseOutcome {
    let mut out = ParseOutcome::default();
    let mut off = 0usize;

    while off < buf.len() {
        let input = &buf[off..];
        let kind = match dir_state.kind {
            MessageKind::Request => MessageKind::Request,
            MessageKind::Response => MessageKind::Response,
            MessageKind::Unknown => match sniff_kind(input) {
                Sniff::Request => MessageKind::Request,
                Sniff::Response => MessageKind::Response,
                Sniff::NeedsMore => {
                    out.needs_more = true;
                    break;
                }
                Sniff::Neither => {
                    let (skip, _) = resync(input);
                    off += skip;
                    out.recoverable_errors += 1;
                    continue;
                }
            },
        };

        let parsed = match kind {
            MessageKind::Request => parse_request(input),
            MessageKind::Response => parse_response(input),
            MessageKind::Unknown => unreachable!("kind sniffed above"),
        };

        match parsed {
            Parsed::Complete(mut msg, consumed) => {
                msg.ts_ns = ts_at(base_seq + off as u64);
                msg.stream_pos = base_seq + off as u64;
                dir_state.kind = msg.kind;
                out.frames.push(Frame::Http(msg));
                off += consumed;
            }
            Parsed::HeaderPartial => {
                if input.len() > MAX_HEADER_BYTES {
                    // Header section refuses to terminate; treat as junk.
                    let (skip, _) = resync(input);
                    off += skip;
                    out.recoverable_errors += 1;
                } else {
                    out.needs_more = true;
                    break;
                }
            }
            Parsed::BodyPartial => {
                out.needs_more = true;
                break;
            }
            Parsed::Invalid => {
                let (skip, _) = resync(input);
                off += skip;
                out.recoverable_errors += 1;
            }
        }
    }

    out.consumed = off;
    out
}

enum Parsed {
    Complete(HttpMessage, usize),
    /// The header section has not terminated yet.
    HeaderPartial,
    /// Headers are complete but the framed body has not fully arrived.
    BodyPartial,
    Invalid,
}

fn lower_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

fn finish_body(
    input: &[u8],
    header_len: usize,
    headers: &[(String, String)],
    kind: MessageKind,
    status: u16,
) -> Option<(Vec<u8>, usize)> {
    match body_framing(headers, kind, status) {
        BodyFraming::None => Some((Vec::new(), header_len)),
        BodyFraming::Length(len) => {
            if input.len() < header_len + len {
                None
            } else {
                Some((input[header_len..header_len + len].to_vec(), header_len + len))
            }
        }
        BodyFraming::Chunked => match decode_chunked(&input[header_len..]) {
            ChunkedResult::Complete { body, consumed } => Some((body, header_len + consumed)),
            // Invalid chunking surfaces as a stuck partial body; the parse
            // error budget catches streams that never recover.
            ChunkedResult::Partial | ChunkedResult::Invalid => None,
        },
    }
}

fn parse_request(input: &[u8]) -> Parsed {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(input) {
        Ok(httparse::Status::Complete(header_len)) => {
            let header_vec = lower_headers(req.headers);
            let (method, path, version) = match (req.method, req.path, req.version) {
                (Some(m), Some(p), Some(v)) => (m, p, v),
                _ => return Parsed::Invalid,
            };
            match finish_body(input, header_len, &header_vec, MessageKind::Request, 0) {
                Some((body, consumed)) => Parsed::Complete(
                    HttpMessage {
                        kind: MessageKind::Request,
                        minor_version: version,
                        method: method.to_string(),
                        path: path.to_string(),
                        headers: header_vec,
                        body,
                        ..Default::default()
                    },
                    consumed,
                ),
                None => Parsed::BodyPartial,
            }
        }
        Ok(httparse::Status::Partial) => Parsed::HeaderPartial,
        Err(_) => Parsed::Invalid,
    }
}

fn parse_response(input: &[u8]) -> Parsed {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(input) {
        Ok(httparse::Status::Complete(header_len)) => {
            let header_vec = lower_headers(resp.headers);
            let (status, version) = match (resp.code, resp.version) {
                (Some(c), Some(v)) => (c, v),
                _ => return Parsed::Invalid,
            };
            match finish_body(input, header_len, &header_vec, MessageKind::Response, status) {
                Some((body, consumed)) => Parsed::Complete(
                    HttpMessage {
                        kind: MessageKind::Response,
                        minor_version: version,
                        status,
                        reason: resp.reason.unwrap_or("").to_string(),
                        headers: header_vec,
                        body,
                        ..Default::default()
                    },
                    consumed,
                ),
                None => Parsed::BodyPartial,
            }
        }
        Ok(httparse::Status::Partial) => Parsed::HeaderPartial,
        Err(_) => Parsed::Invalid,
    }
}

/// Outcome of draining one tick's worth of frames through the matcher.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub records: Vec<HttpRecord>,
    /// Requests dropped after waiting longer than the request timeout.
    pub expired_requests: u64,
}

impl HttpState {
    /// Feeds parsed frames into the FIFO matcher. Responses drain the
    /// oldest outstanding request; responses with no candidate become
    /// orphan records.
    pub fn match_frames(
        &mut self,
        frames: impl Iterator<Item = HttpMessage>,
        now: Instant,
        req_timeout: Duration,
    ) -> MatchOutcome {
        let mut out = MatchOutcome::default();
        for msg in frames {
            match msg.kind {
                MessageKind::Request => {
                    self.outstanding.push_back(PendingRequest { msg, since: now });
                }
                MessageKind::Response | MessageKind::Unknown => {
                    let candidate = self
                        .outstanding
                        .front()
                        .map(|p| p.msg.ts_ns <= msg.ts_ns)
                        .unwrap_or(false);
                    if candidate {
                        let req = self.outstanding.pop_front().map(|p| p.msg);
                        let latency_ns =
                            msg.ts_ns - req.as_ref().map(|r| r.ts_ns).unwrap_or(msg.ts_ns);
                        out.records.push(HttpRecord {
                            req,
                            resp: msg,
                            orphan: false,
                            latency_ns,
                        });
                    } else {
                        out.records.push(HttpRecord {
                            req: None,
                            resp: msg,
                            orphan: true,
                            latency_ns: 0,
                        });
                    }
                }
            }
        }
        while let Some(front) = self.outstanding.front() {
            if now.duration_since(front.since) >= req_timeout {
                self.outstanding.pop_front();
                out.expired_requests += 1;
            } else {
                break;
            }
        }
        out
    }

    pub fn outstanding_requests(&self) -> usize {
        self.outstanding.len()
    }
}

/// Allow/deny substring filters over response headers, in the
/// `Name:substr,-Name:substr` form.
#[derive(Debug, Default, Clone)]
pub struct HttpHeaderFilter {
    inclusions: Vec<(String, String)>,
    exclusions: Vec<(String, String)>,
}

impl HttpHeaderFilter {
    pub fn parse(filters: &str) -> Self {
        let mut filter = HttpHeaderFilter::default();
        for entry in filters.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (target, entry) = match entry.strip_prefix('-') {
                Some(rest) => (&mut filter.exclusions, rest),
                None => (&mut filter.inclusions, entry),
            };
            if let Some((name, value)) = entry.split_once(':') {
                target.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }
        filter
    }

    /// True when the record passes: some inclusion matches (or none are
    /// configured) and no exclusion matches.
    pub fn selects(&self, resp: &HttpMessage) -> bool {
        let hit = |(name, substr): &(String, String)| {
            resp.header(name).map(|v| v.contains(substr.as_str())).unwrap_or(false)
        };
        if !self.inclusions.is_empty() && !self.inclusions.iter().any(hit) {
            return false;
        }
        !self.exclusions.iter().any(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_ts(_: u64) -> u64 {
        0
    }

    #[test]
    fn parses_request_with_body() {
        let mut state = HttpDirState::default();
        let buf = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let out = parse(buf, &mut state, 0, &zero_ts);
        assert_eq!(out.consumed, buf.len());
        assert_eq!(out.frames.len(), 1);
        let Frame::Http(msg) = &out.frames[0] else {
            panic!("expected http frame");
        };
        assert_eq!(msg.method, "POST");
        assert_eq!(msg.path, "/submit");
        assert_eq!(msg.body, b"hello");
        assert_eq!(state.kind, MessageKind::Request);
    }

    #[test]
    fn waits_for_full_body() {
        let mut state = HttpDirState::default();
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nhel";
        let out = parse(buf, &mut state, 0, &zero_ts);
        assert_eq!(out.consumed, 0);
        assert!(out.needs_more);
        assert!(out.frames.is_empty());
    }

    #[test]
    fn parses_pipelined_requests() {
        let mut state = HttpDirState::default();
        let buf = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let out = parse(buf, &mut state, 0, &zero_ts);
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.consumed, buf.len());
    }

    #[test]
    fn chunked_response_reassembles() {
        let mut state = HttpDirState::default();
        let buf = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let out = parse(buf, &mut state, 0, &zero_ts);
        assert_eq!(out.frames.len(), 1);
        let Frame::Http(msg) = &out.frames[0] else {
            panic!("expected http frame");
        };
        assert_eq!(msg.status, 200);
        assert_eq!(msg.body, b"hello world");
        assert_eq!(out.consumed, buf.len());
    }

    #[test]
    fn garbage_is_skipped_until_next_message() {
        let mut state = HttpDirState::default();
        let mut buf = b"\x00\x01\x02junk".to_vec();
        buf.extend_from_slice(b"GET /ok HTTP/1.1\r\n\r\n");
        let out = parse(&buf, &mut state, 0, &zero_ts);
        assert_eq!(out.frames.len(), 1);
        assert!(out.recoverable_errors > 0);
        assert_eq!(out.consumed, buf.len());
    }

    #[test]
    fn fifo_matching_pairs_in_order() {
        let mut state = HttpState::default();
        let now = Instant::now();
        let req = |ts| HttpMessage {
            kind: MessageKind::Request,
            ts_ns: ts,
            ..Default::default()
        };
        let resp = |ts, status| HttpMessage {
            kind: MessageKind::Response,
            status,
            ts_ns: ts,
            ..Default::default()
        };
        let out = state.match_frames(
            vec![req(10), req(20), resp(30, 200), resp(40, 404)].into_iter(),
            now,
            Duration::from_secs(10),
        );
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].resp.status, 200);
        assert_eq!(out.records[0].req.as_ref().unwrap().ts_ns, 10);
        assert_eq!(out.records[0].latency_ns, 20);
        assert_eq!(out.records[1].resp.status, 404);
        assert_eq!(out.records[1].latency_ns, 20);
    }

    #[test]
    fn orphan_response_flagged() {
        let mut state = HttpState::default();
        let resp = HttpMessage {
            kind: MessageKind::Response,
            status: 500,
            ts_ns: 5,
            ..Default::default()
        };
        let out = state.match_frames(
            vec![resp].into_iter(),
            Instant::now(),
            Duration::from_secs(10),
        );
        assert_eq!(out.records.len(), 1);
        assert!(out.records[0].orphan);
        assert!(out.records[0].req.is_none());
    }

    #[test]
    fn stale_requests_expire_without_records() {
        let mut state = HttpState::default();
        let t0 = Instant::now();
        let req = HttpMessage {
            kind: MessageKind::Request,
            ts_ns: 1,
            ..Default::default()
        };
        let out = state.match_frames(vec![req].into_iter(), t0, Duration::from_secs(10));
        assert!(out.records.is_empty());
        let out = state.match_frames(
            std::iter::empty(),
            t0 + Duration::from_secs(11),
            Duration::from_secs(10),
        );
        assert!(out.records.is_empty());
        assert_eq!(out.expired_requests, 1);
        assert_eq!(state.outstanding_requests(), 0);
    }

    #[test]
    fn header_filter_allow_and_deny() {
        let filter = HttpHeaderFilter::parse("Content-Type:json,-Content-Type:text");
        let resp = |ct: &str| HttpMessage {
            kind: MessageKind::Response,
            headers: vec![("content-type".into(), ct.into())],
            ..Default::default()
        };
        assert!(filter.selects(&resp("application/json")));
        assert!(!filter.selects(&resp("text/html")));
        assert!(!filter.selects(&resp("application/grpc")));
        let empty = HttpHeaderFilter::parse("");
        assert!(empty.selects(&resp("anything")));
    }
}

//! MySQL wire protocol: packet framing, command/response stitching, and
//! prepared-statement tracking.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use log::debug;

use socktrace_common::TrafficDirection;

use crate::protocols::core::parse::{Frame, ParseOutcome};

pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_FIELD_LIST: u8 = 0x04;
pub const COM_PING: u8 = 0x0e;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
pub const COM_STMT_CLOSE: u8 = 0x19;
pub const COM_STMT_RESET: u8 = 0x1a;

const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

pub fn command_name(code: u8) -> &'static str {
    match code {
        0x00 => "COM_SLEEP",
        COM_QUIT => "COM_QUIT",
        COM_INIT_DB => "COM_INIT_DB",
        COM_QUERY => "COM_QUERY",
        COM_FIELD_LIST => "COM_FIELD_LIST",
        0x05 => "COM_CREATE_DB",
        0x06 => "COM_DROP_DB",
        0x07 => "COM_REFRESH",
        0x08 => "COM_SHUTDOWN",
        0x09 => "COM_STATISTICS",
        0x0a => "COM_PROCESS_INFO",
        0x0c => "COM_PROCESS_KILL",
        0x0d => "COM_DEBUG",
        COM_PING => "COM_PING",
        COM_STMT_PREPARE => "COM_STMT_PREPARE",
        COM_STMT_EXECUTE => "COM_STMT_EXECUTE",
        COM_STMT_SEND_LONG_DATA => "COM_STMT_SEND_LONG_DATA",
        COM_STMT_CLOSE => "COM_STMT_CLOSE",
        COM_STMT_RESET => "COM_STMT_RESET",
        0x1f => "COM_RESET_CONNECTION",
        _ => "COM_UNKNOWN",
    }
}

/// One framed packet: 3-byte little-endian length + sequence id + payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MysqlPacket {
    pub seq_id: u8,
    pub payload: Vec<u8>,
    pub ts_ns: u64,
    pub stream_pos: u64,
    pub direction: TrafficDirection,
}

/// Splits a contiguous view into packets. Zero-length frames are treated
/// as misalignment; re-alignment walks forward one byte at a time until a
/// plausible length-tagged header is found.
pub fn parse(
    buf: &[u8],
    direction: TrafficDirection,
    base_seq: u64,
    ts_at: &dyn Fn(u64) -> u64,
) -> ParseOutcome {
    let mut out = ParseOutcome::default();
    let mut off = 0usize;
    while off < buf.len() {
        let input = &buf[off..];
        if input.len() < 4 {
            out.needs_more = true;
            break;
        }
        let len = u32::from_le_bytes([input[0], input[1], input[2], 0]) as usize;
        if len == 0 {
            off += 1;
            out.recoverable_errors += 1;
            continue;
        }
        if input.len() < 4 + len {
            out.needs_more = true;
            break;
        }
        out.frames.push(Frame::Mysql(MysqlPacket {
            seq_id: input[3],
            payload: input[4..4 + len].to_vec(),
            ts_ns: ts_at(base_seq + off as u64),
            stream_pos: base_seq + off as u64,
            direction,
        }));
        off += 4 + len;
    }
    out.consumed = off;
    out
}

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub query: String,
    pub num_params: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MysqlCommand {
    pub code: u8,
    /// Rendered request text; for `COM_STMT_EXECUTE` the prepared query
    /// with arguments substituted.
    pub text: String,
    pub stmt_id: Option<u32>,
    pub ts_ns: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MysqlRecord {
    pub cmd: String,
    pub body: String,
    pub resp_status: u16,
    pub resp_body: String,
    pub req_ts_ns: u64,
    pub resp_ts_ns: u64,
    pub latency_ns: u64,
}

#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub records: Vec<MysqlRecord>,
    pub expired_requests: u64,
    pub stitch_failures: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
enum RespPhase {
    #[default]
    First,
    /// Remaining parameter-definition packets of a prepare response, then
    /// the column-definition count to expect after them.
    PrepareParams {
        left: u16,
        cols: u16,
    },
    PrepareCols {
        left: u16,
    },
    Columns {
        left: u64,
    },
    Rows {
        rows: u64,
    },
}

#[derive(Debug, Default)]
struct ResponseAccumulator {
    phase: RespPhase,
    first_ts_ns: u64,
    resultsets: u32,
    rows_total: u64,
}

#[derive(Debug)]
struct PendingCommand {
    cmd: MysqlCommand,
    since: Instant,
}

/// Connection-level stitcher. Stateful across packets: prepared-statement
/// ids live here, as do multi-resultset boundaries.
#[derive(Debug, Default)]
pub struct MysqlState {
    stmts: AHashMap<u32, PreparedStatement>,
    pending: VecDeque<PendingCommand>,
    resp: ResponseAccumulator,
    handshake_done: bool,
}

impl MysqlState {
    /// Consumes packets from both directions in timestamp order and emits
    /// completed command/response records.
    pub fn match_frames(
        &mut self,
        packets: impl Iterator<Item = MysqlPacket>,
        now: Instant,
        req_timeout: Duration,
    ) -> MatchOutcome {
        let mut out = MatchOutcome::default();
        for packet in packets {
            match packet.direction {
                TrafficDirection::Egress => self.on_client_packet(packet, now, &mut out),
                TrafficDirection::Ingress => self.on_server_packet(packet, &mut out),
            }
        }
        while let Some(front) = self.pending.front() {
            if now.duration_since(front.since) >= req_timeout {
                self.pending.pop_front();
                self.resp = ResponseAccumulator::default();
                out.expired_requests += 1;
            } else {
                break;
            }
        }
        out
    }

    pub fn outstanding_requests(&self) -> usize {
        self.pending.len()
    }

    fn on_client_packet(&mut self, packet: MysqlPacket, now: Instant, out: &mut MatchOutcome) {
        if packet.seq_id != 0 {
            // Handshake response or a continuation packet; nothing to stitch.
            return;
        }
        let Some(&code) = packet.payload.first() else {
            out.stitch_failures += 1;
            return;
        };
        self.handshake_done = true;
        let cmd = self.decode_command(code, &packet);
        match code {
            COM_STMT_CLOSE | COM_STMT_SEND_LONG_DATA | COM_QUIT => {
                if code == COM_STMT_CLOSE {
                    if let Some(id) = cmd.stmt_id {
                        self.stmts.remove(&id);
                    }
                }
                // The server sends no response to these.
                out.records.push(MysqlRecord {
                    cmd: command_name(code).to_string(),
                    body: cmd.text,
                    resp_status: 0,
                    resp_body: String::new(),
                    req_ts_ns: cmd.ts_ns,
                    resp_ts_ns: cmd.ts_ns,
                    latency_ns: 0,
                });
            }
            _ => {
                self.pending.push_back(PendingCommand { cmd, since: now });
            }
        }
    }

    fn decode_command(&self, code: u8, packet: &MysqlPacket) -> MysqlCommand {
        let body = &packet.payload[1..];
        let (text, stmt_id) = match code {
            COM_QUERY | COM_STMT_PREPARE | COM_INIT_DB | COM_FIELD_LIST => {
                (String::from_utf8_lossy(body).into_owned(), None)
            }
            COM_STMT_EXECUTE => {
                let stmt_id = read_u32(body, 0);
                let text = match stmt_id.and_then(|id| self.stmts.get(&id).map(|s| (id, s))) {
                    Some((_, stmt)) => {
                        match decode_execute_args(&packet.payload, stmt.num_params) {
                            Some(args) => substitute_params(&stmt.query, &args),
                            None => stmt.query.clone(),
                        }
                    }
                    None => format!("stmt_id={}", stmt_id.unwrap_or(0)),
                };
                (text, stmt_id)
            }
            COM_STMT_CLOSE | COM_STMT_RESET | COM_STMT_SEND_LONG_DATA => {
                let stmt_id = read_u32(body, 0);
                (format!("stmt_id={}", stmt_id.unwrap_or(0)), stmt_id)
            }
            _ => (String::new(), None),
        };
        MysqlCommand {
            code,
            text,
            stmt_id,
            ts_ns: packet.ts_ns,
        }
    }

    fn on_server_packet(&mut self, packet: MysqlPacket, out: &mut MatchOutcome) {
        if !self.handshake_done {
            // Greeting / auth exchange before the first command.
            return;
        }
        let Some(front) = self.pending.front() else {
            self.on_orphan_server_packet(packet, out);
            return;
        };
        if self.resp.first_ts_ns == 0 {
            self.resp.first_ts_ns = packet.ts_ns;
        }
        let first = packet.payload.first().copied().unwrap_or(0);
        let is_prepare = front.cmd.code == COM_STMT_PREPARE;
        let done: Option<(u16, String)> = match self.resp.phase {
            RespPhase::First => {
                if first == 0xff {
                    let (code, msg) = parse_err(&packet.payload);
                    Some((code, format!("ERR {msg}")))
                } else if is_prepare {
                    self.on_prepare_ok(&packet, out)
                } else if first == 0x00 {
                    let (affected, status) = parse_ok(&packet.payload);
                    if status & SERVER_MORE_RESULTS_EXISTS != 0 {
                        self.resp.resultsets += 1;
                        self.resp.phase = RespPhase::First;
                        None
                    } else {
                        Some((0, format!("OK, {affected} rows affected")))
                    }
                } else {
                    match lenenc_int(&packet.payload) {
                        Some((count, _)) => {
                            self.resp.phase = RespPhase::Columns { left: count };
                            None
                        }
                        None => {
                            out.stitch_failures += 1;
                            None
                        }
                    }
                }
            }
            RespPhase::PrepareParams { left, cols } => {
                if is_eof(&packet.payload) {
                    if cols > 0 {
                        self.resp.phase = RespPhase::PrepareCols { left: cols };
                        None
                    } else {
                        Some((0, "prepared".to_string()))
                    }
                } else {
                    let left = left.saturating_sub(1);
                    self.resp.phase = RespPhase::PrepareParams { left, cols };
                    None
                }
            }
            RespPhase::PrepareCols { left } => {
                if is_eof(&packet.payload) {
                    Some((0, "prepared".to_string()))
                } else {
                    self.resp.phase = RespPhase::PrepareCols {
                        left: left.saturating_sub(1),
                    };
                    None
                }
            }
            // Classic protocol: column definitions are terminated by an EOF
            // packet before the rows begin.
            RespPhase::Columns { left } => {
                if is_eof(&packet.payload) {
                    self.resp.phase = RespPhase::Rows { rows: 0 };
                } else {
                    self.resp.phase = RespPhase::Columns {
                        left: left.saturating_sub(1),
                    };
                }
                None
            }
            RespPhase::Rows { rows } => {
                if is_eof(&packet.payload) {
                    self.resp.rows_total += rows;
                    self.resp.resultsets += 1;
                    let status = eof_status_flags(&packet.payload);
                    if status & SERVER_MORE_RESULTS_EXISTS != 0 {
                        self.resp.phase = RespPhase::First;
                        None
                    } else {
                        let total = self.resp.rows_total;
                        let body = if self.resp.resultsets > 1 {
                            format!("Resultsets: {}, {} rows", self.resp.resultsets, total)
                        } else {
                            format!("Resultset: {total} rows")
                        };
                        Some((0, body))
                    }
                } else {
                    self.resp.phase = RespPhase::Rows { rows: rows + 1 };
                    None
                }
            }
        };

        if let Some((status, body)) = done {
            let front = self.pending.pop_front().expect("pending front checked");
            let resp_ts = if self.resp.first_ts_ns != 0 {
                self.resp.first_ts_ns
            } else {
                packet.ts_ns
            };
            out.records.push(MysqlRecord {
                cmd: command_name(front.cmd.code).to_string(),
                body: front.cmd.text,
                resp_status: status,
                resp_body: body,
                req_ts_ns: front.cmd.ts_ns,
                resp_ts_ns: resp_ts,
                latency_ns: resp_ts.saturating_sub(front.cmd.ts_ns),
            });
            self.resp = ResponseAccumulator::default();
        }
    }

    /// Prepare-response OK: register the statement id announced by the
    /// server against the query text of the pending prepare.
    fn on_prepare_ok(&mut self, packet: &MysqlPacket, out: &mut MatchOutcome) -> Option<(u16, String)> {
        let p = &packet.payload;
        if p.first() != Some(&0x00) || p.len() < 12 {
            out.stitch_failures += 1;
            return None;
        }
        let stmt_id = read_u32(p, 1).unwrap_or(0);
        let num_cols = u16::from_le_bytes([p[5], p[6]]);
        let num_params = u16::from_le_bytes([p[7], p[8]]);
        if let Some(front) = self.pending.front() {
            self.stmts.insert(
                stmt_id,
                PreparedStatement {
                    query: front.cmd.text.clone(),
                    num_params,
                },
            );
        }
        debug!("prepared stmt_id={stmt_id} params={num_params} cols={num_cols}");
        if num_params == 0 && num_cols == 0 {
            Some((0, "prepared".to_string()))
        } else if num_params > 0 {
            self.resp.phase = RespPhase::PrepareParams {
                left: num_params,
                cols: num_cols,
            };
            None
        } else {
            self.resp.phase = RespPhase::PrepareCols { left: num_cols };
            None
        }
    }

    fn on_orphan_server_packet(&mut self, packet: MysqlPacket, out: &mut MatchOutcome) {
        let first = packet.payload.first().copied().unwrap_or(0);
        if first == 0x00 || first == 0xff || is_eof(&packet.payload) {
            let (status, body) = if first == 0xff {
                let (code, msg) = parse_err(&packet.payload);
                (code, format!("ERR {msg}"))
            } else {
                (0, "OK".to_string())
            };
            out.records.push(MysqlRecord {
                cmd: String::new(),
                body: String::new(),
                resp_status: status,
                resp_body: body,
                req_ts_ns: packet.ts_ns,
                resp_ts_ns: packet.ts_ns,
                latency_ns: 0,
            });
        } else {
            out.stitch_failures += 1;
        }
    }
}

fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() < 9
}

fn eof_status_flags(payload: &[u8]) -> u16 {
    if payload.len() >= 5 {
        u16::from_le_bytes([payload[3], payload[4]])
    } else {
        0
    }
}

fn parse_ok(payload: &[u8]) -> (u64, u16) {
    let mut pos = 1usize;
    let affected = match lenenc_int(&payload[pos..]) {
        Some((v, n)) => {
            pos += n;
            v
        }
        None => return (0, 0),
    };
    if let Some((_, n)) = lenenc_int(&payload[pos..]) {
        pos += n;
    }
    let status = if payload.len() >= pos + 2 {
        u16::from_le_bytes([payload[pos], payload[pos + 1]])
    } else {
        0
    };
    (affected, status)
}

fn parse_err(payload: &[u8]) -> (u16, String) {
    if payload.len() < 3 {
        return (0, String::new());
    }
    let code = u16::from_le_bytes([payload[1], payload[2]]);
    // Skip the '#' + 5-byte sql state marker when present.
    let msg_start = if payload.get(3) == Some(&b'#') && payload.len() >= 9 {
        9
    } else {
        3
    };
    (
        code,
        String::from_utf8_lossy(&payload[msg_start..]).into_owned(),
    )
}

/// Length-encoded integer: value and bytes consumed.
pub fn lenenc_int(buf: &[u8]) -> Option<(u64, usize)> {
    match *buf.first()? {
        v @ 0..=0xfa => Some((v as u64, 1)),
        0xfc if buf.len() >= 3 => Some((u16::from_le_bytes([buf[1], buf[2]]) as u64, 3)),
        0xfd if buf.len() >= 4 => Some((
            u32::from_le_bytes([buf[1], buf[2], buf[3], 0]) as u64,
            4,
        )),
        0xfe if buf.len() >= 9 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[1..9]);
            Some((u64::from_le_bytes(b), 9))
        }
        _ => None,
    }
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    if buf.len() < off + 4 {
        return None;
    }
    Some(u32::from_le_bytes([
        buf[off],
        buf[off + 1],
        buf[off + 2],
        buf[off + 3],
    ]))
}

/// Renders the bound arguments of a `COM_STMT_EXECUTE` payload.
fn decode_execute_args(payload: &[u8], num_params: u16) -> Option<Vec<String>> {
    if num_params == 0 {
        return Some(Vec::new());
    }
    let n = num_params as usize;
    let mut pos = 1 + 4 + 1 + 4; // cmd + stmt_id + flags + iteration count
    let bitmap_len = (n + 7) / 8;
    if payload.len() < pos + bitmap_len + 1 {
        return None;
    }
    let null_bitmap = &payload[pos..pos + bitmap_len];
    pos += bitmap_len;
    let new_params_bound = payload[pos];
    pos += 1;
    if new_params_bound != 1 {
        // Types from a previous execution are not retained here.
        return None;
    }
    if payload.len() < pos + 2 * n {
        return None;
    }
    let types: Vec<u8> = (0..n).map(|i| payload[pos + 2 * i]).collect();
    pos += 2 * n;

    let mut args = Vec::with_capacity(n);
    for (i, &ty) in types.iter().enumerate() {
        if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
            args.push("NULL".to_string());
            continue;
        }
        let rest = &payload[pos..];
        let (text, used) = decode_binary_value(ty, rest)?;
        args.push(text);
        pos += used;
    }
    Some(args)
}

fn decode_binary_value(ty: u8, buf: &[u8]) -> Option<(String, usize)> {
    match ty {
        0x01 => buf.first().map(|&v| ((v as i8).to_string(), 1)),
        0x02 | 0x0d => {
            if buf.len() < 2 {
                return None;
            }
            Some((i16::from_le_bytes([buf[0], buf[1]]).to_string(), 2))
        }
        0x03 | 0x09 => {
            if buf.len() < 4 {
                return None;
            }
            Some((
                i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]).to_string(),
                4,
            ))
        }
        0x08 => {
            if buf.len() < 8 {
                return None;
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[..8]);
            Some((i64::from_le_bytes(b).to_string(), 8))
        }
        0x04 => {
            if buf.len() < 4 {
                return None;
            }
            Some((
                f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]).to_string(),
                4,
            ))
        }
        0x05 => {
            if buf.len() < 8 {
                return None;
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[..8]);
            Some((f64::from_le_bytes(b).to_string(), 8))
        }
        0x0f | 0xfc | 0xfd | 0xfe => {
            let (len, n) = lenenc_int(buf)?;
            let len = len as usize;
            if buf.len() < n + len {
                return None;
            }
            Some((
                format!("'{}'", String::from_utf8_lossy(&buf[n..n + len])),
                n + len,
            ))
        }
        _ => None,
    }
}

fn substitute_params(query: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(query.len());
    let mut args_iter = args.iter();
    for ch in query.chars() {
        if ch == '?' {
            match args_iter.next() {
                Some(arg) => out.push_str(arg),
                None => out.push('?'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

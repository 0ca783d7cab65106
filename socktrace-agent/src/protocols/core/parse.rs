//! Contracts between the reassembly layer and the per-protocol parsers.

use crate::protocols::http::HttpMessage;
use crate::protocols::http2::Http2HalfStream;
use crate::protocols::mysql::MysqlPacket;

/// One protocol-level message lifted out of a byte stream. The set is
/// closed; dispatch is by variant, not trait objects.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Http(HttpMessage),
    Http2(Http2HalfStream),
    Mysql(MysqlPacket),
}

impl Frame {
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Frame::Http(m) => m.ts_ns,
            Frame::Http2(s) => s.first_ts_ns,
            Frame::Mysql(p) => p.ts_ns,
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            Frame::Http(m) => m.byte_size(),
            Frame::Http2(s) => s.byte_size(),
            Frame::Mysql(p) => p.payload.len() + std::mem::size_of::<MysqlPacket>(),
        }
    }
}

/// Whether a stream carries requests or responses. Decided per direction
/// from content, so both client-side and server-side traces reconstruct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Unknown,
    Request,
    Response,
}

/// Result of one parser invocation over a contiguous view.
///
/// `consumed` bytes are removed from the stream whatever the rest of the
/// outcome says; parsers express resynchronization by consuming the bytes
/// they skipped and counting `recoverable_errors`.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub consumed: usize,
    pub frames: Vec<Frame>,
    /// The head of the remaining input is a partial message; stop until
    /// more bytes arrive.
    pub needs_more: bool,
    pub recoverable_errors: u32,
    /// Unrecoverable: the tracker should be disabled.
    pub fatal: Option<&'static str>,
}

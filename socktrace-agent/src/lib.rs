//! Userspace engine of the socktrace socket tracer.
//!
//! Kernel probes stream control and data events through perf buffers; the
//! engine demultiplexes them onto per-connection trackers, reassembles
//! each direction's byte stream, parses HTTP/1.x, HTTP/2 (gRPC) and MySQL
//! out of them, pairs requests with responses, and appends the matched
//! records to typed columnar tables.

pub mod config;
pub mod errors;
pub mod metrics;
pub mod protocols;
pub mod server;
pub mod source;
pub mod tables;
pub mod tracer;
pub mod utils;

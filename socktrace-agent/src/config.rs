use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration. Assembled from CLI flags in `main`, defaulted for
/// tests.
#[derive(Debug, Clone)]
pub struct Config {
    /// Allow/deny substring filters applied to HTTP response headers, e.g.
    /// `Content-Type:json,-Content-Type:text`.
    pub http_response_header_filters: String,
    /// Decode gRPC payloads through the service descriptor database.
    pub enable_parsing_protobufs: bool,
    /// Cadence at which the perf buffers are drained.
    pub sampling_period: Duration,
    /// Cadence of the transfer stage (frame processing, matching, table
    /// appends, cleanup).
    pub push_period: Duration,
    /// If set, every raw event is appended length-prefixed to this file.
    pub perf_buffer_events_output_path: Option<PathBuf>,
    pub enable_http_tracing: bool,
    pub enable_grpc_tracing: bool,
    pub enable_mysql_tracing: bool,
    /// Drop records whose tgid is the agent's own.
    pub disable_self_tracing: bool,

    /// How long a reassembly hole may block a stream before it is skipped.
    pub gap_timeout: Duration,
    /// How long an unmatched request waits for its response.
    pub req_timeout: Duration,
    /// Trackers idle longer than this are torn down.
    pub inactivity_ttl: Duration,
    /// Reassembly bound per stream direction.
    pub max_stream_bytes: usize,
    /// Parsed frames buffered per stream direction.
    pub max_frames_buffered: usize,
    /// Tracker population bound; oldest-inactive evicted beyond it.
    pub max_trackers: usize,
    /// Bytes of either direction shown to the protocol classifier before the
    /// connection is given up on.
    pub classify_window: usize,
    /// Recoverable parse errors tolerated per tracker before it is disabled.
    pub parse_error_budget: u32,
    /// HPACK dynamic table cap per direction.
    pub hpack_max_table_size: usize,
    /// Events drained per poll call.
    pub max_event_batch: usize,
    /// Check `/proc/<tgid>/fd/<fd>` liveness for idle trackers. Off in tests.
    pub check_proc_liveness: bool,
    /// The agent's own tgid, for the self-tracing guard.
    pub self_tgid: u32,
    /// Protobuf `FileDescriptorSet` backing gRPC payload rendering.
    pub descriptor_set_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_response_header_filters: String::new(),
            enable_parsing_protobufs: false,
            sampling_period: Duration::from_millis(100),
            push_period: Duration::from_millis(1000),
            perf_buffer_events_output_path: None,
            enable_http_tracing: true,
            enable_grpc_tracing: true,
            enable_mysql_tracing: true,
            disable_self_tracing: true,
            gap_timeout: Duration::from_secs(1),
            req_timeout: Duration::from_secs(10),
            inactivity_ttl: Duration::from_secs(300),
            max_stream_bytes: 1024 * 1024,
            max_frames_buffered: 256,
            max_trackers: 100_000,
            classify_window: 1024,
            parse_error_budget: 32,
            hpack_max_table_size: 4096,
            max_event_batch: 1024,
            check_proc_liveness: true,
            self_tgid: std::process::id(),
            descriptor_set_path: None,
        }
    }
}

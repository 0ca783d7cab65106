#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use socktrace_agent::config::Config;
use socktrace_agent::metrics::TracerMetrics;
use socktrace_agent::tables::{shared_tables, HttpRow, MysqlRow, SharedTables};
use socktrace_agent::tracer::SocketTracer;
use socktrace_common::{
    ControlEvent, ControlKind, DataEvent, DataHeader, SockAddrBytes, TrafficDirection,
};

/// Drives a `SocketTracer` with synthesized events and explicit time.
pub struct Harness {
    pub tracer: SocketTracer,
    pub tables: SharedTables,
    pub metrics: TracerMetrics,
    pub t0: Instant,
}

impl Harness {
    pub fn new(cfg: Config) -> Self {
        let metrics = TracerMetrics::unregistered();
        let tables = shared_tables();
        let t0 = Instant::now();
        let mut tracer = SocketTracer::new(cfg, metrics.clone(), tables.clone())
            .expect("engine construction");
        tracer.set_now(t0);
        Harness {
            tracer,
            tables,
            metrics,
            t0,
        }
    }

    pub fn test_config() -> Config {
        Config {
            check_proc_liveness: false,
            ..Config::default()
        }
    }

    /// Moves the engine clock without running a transfer tick.
    pub fn at(&mut self, offset: Duration) {
        self.tracer.set_now(self.t0 + offset);
    }

    pub fn open(&mut self, tgid: u32, fd: u32, generation: u64, ts_ns: u64, remote: &str) {
        let addr: SocketAddr = remote.parse().expect("remote address");
        self.tracer.accept_control(&ControlEvent {
            kind: ControlKind::Open,
            ts_ns,
            tgid,
            fd,
            generation,
            remote_addr: SockAddrBytes::from_socket_addr(&addr),
        });
    }

    pub fn close(&mut self, tgid: u32, fd: u32, generation: u64, ts_ns: u64) {
        self.tracer.accept_control(&ControlEvent {
            kind: ControlKind::Close,
            ts_ns,
            tgid,
            fd,
            generation,
            remote_addr: SockAddrBytes::ZERO,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn data(
        &mut self,
        tgid: u32,
        fd: u32,
        generation: u64,
        direction: TrafficDirection,
        seq: u64,
        ts_ns: u64,
        payload: &[u8],
    ) {
        self.data_truncated(
            tgid,
            fd,
            generation,
            direction,
            seq,
            ts_ns,
            payload,
            payload.len() as u64,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn data_truncated(
        &mut self,
        tgid: u32,
        fd: u32,
        generation: u64,
        direction: TrafficDirection,
        seq: u64,
        ts_ns: u64,
        payload: &[u8],
        orig_len: u64,
    ) {
        self.tracer.accept_data(&DataEvent {
            header: DataHeader {
                ts_ns,
                tgid,
                fd,
                generation,
                direction,
                seq,
                payload_len: payload.len() as u32,
                orig_len,
            },
            payload,
        });
    }

    /// Runs a transfer tick at `t0 + offset`.
    pub fn tick(&mut self, offset: Duration) {
        self.tracer.transfer(self.t0 + offset);
    }

    pub fn http_rows(&self) -> usize {
        self.tables.lock().http.len()
    }

    pub fn http_row(&self, i: usize) -> HttpRow {
        self.tables.lock().http.row(i)
    }

    pub fn mysql_rows(&self) -> usize {
        self.tables.lock().mysql.len()
    }

    pub fn mysql_row(&self, i: usize) -> MysqlRow {
        self.tables.lock().mysql.row(i)
    }
}

/// Frames a MySQL packet.
pub fn mysql_packet(seq_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
    out.push(seq_id);
    out.extend_from_slice(payload);
    out
}

/// Frames an HTTP/2 frame.
pub fn h2_frame(typ: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    out.push(typ);
    out.push(flags);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// HPACK literal-with-incremental-indexing for a name/value pair.
pub fn h2_literal(name: &str, value: &str) -> Vec<u8> {
    let mut out = vec![0x40];
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out
}

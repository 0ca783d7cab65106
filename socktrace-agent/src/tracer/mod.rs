//! The engine: demultiplexes kernel events onto connection trackers and
//! runs the periodic transfer stage that turns matched records into table
//! rows.

pub mod manager;
pub mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use anyhow::Result;
use log::{debug, info, warn};

use socktrace_common::{ControlEvent, ControlKind, DataEvent};

use crate::config::Config;
use crate::errors::DropReason;
use crate::metrics::TracerMetrics;
use crate::protocols::http::{HttpHeaderFilter, HttpRecord};
use crate::protocols::http2::protobuf::ServiceDescriptorDatabase;
use crate::protocols::http2::{decode_grpc_messages, Http2HalfStream, Http2Record};
use crate::protocols::mysql::MysqlRecord;
use crate::protocols::Record;
use crate::source::{EventSink, EventSource};
use crate::tables::{HttpRow, MysqlRow, SharedTables};

use self::manager::TrackerGenerations;
use self::tracker::ConnTracker;

pub struct SocketTracer {
    cfg: Config,
    metrics: TracerMetrics,
    header_filter: HttpHeaderFilter,
    descriptors: Option<Arc<ServiceDescriptorDatabase>>,
    /// Outer demux map keyed by packed `(tgid, fd)`; inner map by
    /// generation.
    trackers: AHashMap<u64, TrackerGenerations>,
    tables: SharedTables,
    /// Iteration time; every deadline in the engine is evaluated against
    /// this, never against wall clocks read mid-event.
    now: Instant,
}

impl SocketTracer {
    pub fn new(cfg: Config, metrics: TracerMetrics, tables: SharedTables) -> Result<Self> {
        let header_filter = HttpHeaderFilter::parse(&cfg.http_response_header_filters);
        let descriptors = match (&cfg.descriptor_set_path, cfg.enable_parsing_protobufs) {
            (Some(path), true) => {
                let db = ServiceDescriptorDatabase::load(path)?;
                info!("loaded descriptor set from {}", path.display());
                Some(Arc::new(db))
            }
            _ => None,
        };
        Ok(Self {
            cfg,
            metrics,
            header_filter,
            descriptors,
            trackers: AHashMap::new(),
            tables,
            now: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Pins the engine's notion of "now"; tests drive time through this
    /// and `transfer`.
    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.values().map(|g| g.len()).sum()
    }

    pub fn generations(&self, tgid: u32, fd: u32) -> Option<&TrackerGenerations> {
        self.trackers.get(&socktrace_common::stream_key(tgid, fd))
    }

    pub fn accept_control(&mut self, ev: &ControlEvent) {
        let key = ev.stream_key();
        if ev.kind == ControlKind::Close && !self.trackers.contains_key(&key) {
            // A close for a connection never seen; nothing to attribute
            // it to.
            self.metrics.ingest_drop(DropReason::UnknownPid);
            return;
        }
        let generations = self.trackers.entry(key).or_default();
        match generations.get_or_create(ev.tgid, ev.fd, ev.generation, self.now, &self.metrics) {
            Ok(tracker) => tracker.accept_control(ev, self.now),
            Err(reason) => self.metrics.ingest_drop(reason),
        }
    }

    pub fn accept_data(&mut self, ev: &DataEvent<'_>) {
        let header = &ev.header;
        let generations = self.trackers.entry(header.stream_key()).or_default();
        match generations.get_or_create(
            header.tgid,
            header.fd,
            header.generation,
            self.now,
            &self.metrics,
        ) {
            Ok(tracker) => {
                if let Err(reason) = tracker.accept_data(header, ev.payload, self.now, &self.metrics)
                {
                    self.metrics.ingest_drop(reason);
                }
            }
            Err(reason) => self.metrics.ingest_drop(reason),
        }
    }

    /// One transfer tick: parse, match, filter, append, clean up, evict.
    pub fn transfer(&mut self, now: Instant) {
        self.now = now;
        let mut http_rows: Vec<HttpRow> = Vec::new();
        let mut mysql_rows: Vec<MysqlRow> = Vec::new();
        let mut filtered = 0u64;
        let mut expired = 0u64;

        for generations in self.trackers.values_mut() {
            for tracker in generations.trackers_mut() {
                tracker.process_frames(&self.cfg, &self.metrics, now);
                let summary = tracker.match_records(&self.cfg, now);
                expired += summary.expired_requests;
                for record in summary.records {
                    match record_to_row(
                        &self.cfg,
                        &self.header_filter,
                        self.descriptors.as_deref(),
                        tracker,
                        record,
                    ) {
                        RowOutcome::Http(row) => http_rows.push(*row),
                        RowOutcome::Mysql(row) => mysql_rows.push(row),
                        RowOutcome::Filtered => filtered += 1,
                    }
                }
                tracker.cleanup(&self.cfg, now);
            }
        }

        self.trackers.retain(|_, generations| {
            generations.remove_destroyed(&self.metrics);
            !generations.is_empty()
        });
        self.enforce_tracker_cap();
        self.metrics
            .active_trackers
            .set(self.tracker_count() as i64);

        self.metrics.records_filtered.inc_by(filtered);
        self.metrics.requests_expired.inc_by(expired);
        if !http_rows.is_empty() || !mysql_rows.is_empty() {
            self.metrics.records_emitted("http", http_rows.len() as u64);
            self.metrics.records_emitted("mysql", mysql_rows.len() as u64);
            let mut tables = self.tables.lock();
            for row in http_rows {
                tables.http.append(row);
            }
            for row in mysql_rows {
                tables.mysql.append(row);
            }
        }
    }

    /// LRU pressure valve: beyond `max_trackers`, the oldest-inactive
    /// trackers are destroyed outright.
    fn enforce_tracker_cap(&mut self) {
        let total = self.tracker_count();
        if total <= self.cfg.max_trackers {
            return;
        }
        let mut excess = total - self.cfg.max_trackers;
        let mut candidates: Vec<(Instant, u64, u64)> = Vec::with_capacity(total);
        for (&key, generations) in &self.trackers {
            for tracker in generations.trackers() {
                candidates.push((tracker.last_activity(), key, tracker.id().generation));
            }
        }
        candidates.sort_by_key(|&(at, _, _)| at);
        let mut evicted = 0u64;
        for (_, key, generation) in candidates {
            if excess == 0 {
                break;
            }
            if let Some(generations) = self.trackers.get_mut(&key) {
                if generations.remove_generation(generation) {
                    excess -= 1;
                    evicted += 1;
                    if generations.is_empty() {
                        self.trackers.remove(&key);
                    }
                }
            }
        }
        self.metrics.trackers_evicted_inc("lru", evicted);
        warn!("tracker cap exceeded; evicted {evicted} oldest-inactive trackers");
    }

    /// Engine main loop. Owns the source and every tracker; the only
    /// suspension points are the poll and the inter-poll sleep.
    pub fn run(&mut self, source: &mut dyn EventSource, shutdown: &AtomicBool) -> Result<()> {
        info!(
            "engine running: sampling every {:?}, transfer every {:?}",
            self.cfg.sampling_period, self.cfg.push_period
        );
        let mut last_push = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            self.now = Instant::now();
            let drained = source.poll(self.cfg.max_event_batch, self)?;
            if drained > 0 {
                debug!("drained {drained} events");
            }
            if last_push.elapsed() >= self.cfg.push_period {
                let now = Instant::now();
                self.transfer(now);
                last_push = now;
            }
            std::thread::sleep(self.cfg.sampling_period);
        }
        // Final drain and tick so close events observed just before
        // shutdown still produce records.
        self.now = Instant::now();
        source.poll(self.cfg.max_event_batch, self)?;
        self.transfer(Instant::now());
        info!("engine stopped");
        Ok(())
    }
}

impl EventSink for SocketTracer {
    fn control_event(&mut self, bytes: &[u8]) {
        match ControlEvent::parse(bytes) {
            Ok(ev) => self.accept_control(&ev),
            Err(e) => {
                debug!("malformed control event: {e}");
                self.metrics.ingest_drop(DropReason::Malformed);
            }
        }
    }

    fn data_event(&mut self, bytes: &[u8]) {
        match DataEvent::parse(bytes) {
            Ok(ev) => self.accept_data(&ev),
            Err(e) => {
                debug!("malformed data event: {e}");
                self.metrics.ingest_drop(DropReason::Malformed);
            }
        }
    }

    fn events_lost(&mut self, buffer: &'static str, count: u64) {
        warn!("kernel reported {count} lost events on {buffer}");
        self.metrics
            .events_lost
            .get_or_create(&crate::metrics::BufferLabels {
                buffer: buffer.to_string(),
            })
            .inc_by(count);
    }
}

enum RowOutcome {
    Http(Box<HttpRow>),
    Mysql(MysqlRow),
    Filtered,
}

fn remote_parts(tracker: &ConnTracker) -> (String, u16) {
    match tracker.remote() {
        Some(addr) => (addr.ip().to_string(), addr.port()),
        None => (String::new(), 0),
    }
}

fn record_to_row(
    cfg: &Config,
    filter: &HttpHeaderFilter,
    descriptors: Option<&ServiceDescriptorDatabase>,
    tracker: &ConnTracker,
    record: Record,
) -> RowOutcome {
    if cfg.disable_self_tracing && tracker.id().tgid == cfg.self_tgid {
        return RowOutcome::Filtered;
    }
    match record {
        Record::Http(r) => {
            if !cfg.enable_http_tracing || !filter.selects(&r.resp) {
                return RowOutcome::Filtered;
            }
            RowOutcome::Http(Box::new(http_record_row(tracker, r)))
        }
        Record::Http2(r) => {
            let grpc = r.is_grpc();
            if grpc && !cfg.enable_grpc_tracing {
                return RowOutcome::Filtered;
            }
            if !grpc && !cfg.enable_http_tracing {
                return RowOutcome::Filtered;
            }
            RowOutcome::Http(Box::new(http2_record_row(
                tracker,
                r,
                descriptors,
                cfg.enable_parsing_protobufs,
            )))
        }
        Record::Mysql(r) => {
            if !cfg.enable_mysql_tracing {
                return RowOutcome::Filtered;
            }
            RowOutcome::Mysql(mysql_record_row(tracker, r))
        }
    }
}

fn http_record_row(tracker: &ConnTracker, r: HttpRecord) -> HttpRow {
    let (remote_addr, remote_port) = remote_parts(tracker);
    let id = tracker.id();
    let req = r.req.as_ref();
    HttpRow {
        time_ns: r.time_ns(),
        tgid: id.tgid,
        fd: id.fd,
        remote_addr,
        remote_port,
        http_major_version: 1,
        http_minor_version: r.resp.minor_version,
        http_req_method: req.map(|m| m.method.clone()).unwrap_or_default(),
        http_req_path: req.map(|m| m.path.clone()).unwrap_or_default(),
        http_req_headers: req.map(|m| m.headers_text()).unwrap_or_default(),
        http_req_body: req
            .map(|m| String::from_utf8_lossy(&m.body).into_owned())
            .unwrap_or_default(),
        http_resp_status: r.resp.status,
        http_resp_message: r.resp.reason.clone(),
        http_resp_headers: r.resp.headers_text(),
        http_resp_body: String::from_utf8_lossy(&r.resp.body).into_owned(),
        http_resp_latency_ns: r.latency_ns,
    }
}

fn http2_record_row(
    tracker: &ConnTracker,
    r: Http2Record,
    descriptors: Option<&ServiceDescriptorDatabase>,
    parse_protobufs: bool,
) -> HttpRow {
    let (remote_addr, remote_port) = remote_parts(tracker);
    let id = tracker.id();
    let path = r.req.path().map(str::to_string).unwrap_or_default();
    let resp_message = match (r.resp.trailer("grpc-status"), r.resp.trailer("grpc-message")) {
        (Some(status), Some(message)) => format!("grpc-status {status}: {message}"),
        (Some(status), None) => format!("grpc-status {status}"),
        _ => String::new(),
    };
    let grpc = r.is_grpc();
    HttpRow {
        time_ns: r.time_ns(),
        tgid: id.tgid,
        fd: id.fd,
        remote_addr,
        remote_port,
        http_major_version: 2,
        http_minor_version: 0,
        http_req_method: r
            .req
            .header(":method")
            .map(str::to_string)
            .unwrap_or_default(),
        http_req_path: path.clone(),
        http_req_headers: r.req.headers_text(),
        http_req_body: body_text(&r.req, &path, true, grpc, descriptors, parse_protobufs),
        http_resp_status: r.resp.status().unwrap_or(0),
        http_resp_message: resp_message,
        http_resp_headers: r.resp.headers_text(),
        http_resp_body: body_text(&r.resp, &path, false, grpc, descriptors, parse_protobufs),
        http_resp_latency_ns: r.latency_ns,
    }
}

/// Renders one half-stream's payload: decoded protobuf fields when the
/// descriptor database covers the method, a message/byte summary
/// otherwise.
fn body_text(
    half: &Http2HalfStream,
    path: &str,
    request: bool,
    grpc: bool,
    descriptors: Option<&ServiceDescriptorDatabase>,
    parse_protobufs: bool,
) -> String {
    if half.data.is_empty() {
        return String::new();
    }
    if !grpc {
        return String::from_utf8_lossy(&half.data).into_owned();
    }
    let messages = decode_grpc_messages(&half.data);
    if messages.is_empty() {
        return format!("<{} bytes>", half.data.len());
    }
    if parse_protobufs {
        if let Some(db) = descriptors {
            let msg_type = if request {
                db.method_input_type(path)
            } else {
                db.method_output_type(path)
            };
            if let Some(msg_type) = msg_type {
                return messages
                    .iter()
                    .map(|&(compressed, bytes)| {
                        if compressed {
                            format!("<compressed {} bytes>", bytes.len())
                        } else {
                            db.render(msg_type, bytes)
                                .unwrap_or_else(|| format!("<{} bytes>", bytes.len()))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("; ")
            }
        }
    }
    let total: usize = messages.iter().map(|&(_, b)| b.len()).sum();
    format!("{} message(s), {} bytes", messages.len(), total)
}

fn mysql_record_row(tracker: &ConnTracker, r: MysqlRecord) -> MysqlRow {
    let (remote_addr, remote_port) = remote_parts(tracker);
    let id = tracker.id();
    MysqlRow {
        time_ns: r.req_ts_ns,
        tgid: id.tgid,
        fd: id.fd,
        remote_addr,
        remote_port,
        mysql_cmd: r.cmd,
        mysql_body: r.body,
        mysql_resp_body: r.resp_body,
        mysql_resp_status: r.resp_status,
        mysql_resp_latency_ns: r.latency_ns,
    }
}

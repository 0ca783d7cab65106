//! Per-connection state: reassembly streams, protocol memory, lifecycle.

use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, info};

use socktrace_common::{ControlEvent, ControlKind, DataHeader, TrafficDirection};

use crate::config::Config;
use crate::errors::DropReason;
use crate::metrics::TracerMetrics;
use crate::protocols::core::datastream::{AddOutcome, DataStream};
use crate::protocols::{self, MatchSummary, Protocol, ProtocolState};
use crate::utils::proc_fd_gone;

/// Idle transfer ticks before the tracker consults /proc for liveness.
const PROC_CHECK_IDLE_TICKS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub tgid: u32,
    pub fd: u32,
    pub generation: u64,
    /// Kernel timestamp observed at accept/connect return; first event
    /// timestamp when the open event was lost.
    pub creation_ts_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Collecting,
    ReadyForDestruction,
    Disabled,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TrackerStats {
    pub data_events: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub valid_records: u64,
    pub invalid_records: u64,
}

pub struct ConnTracker {
    id: ConnectionId,
    remote: Option<SocketAddr>,
    protocol: Protocol,
    state: TrackerState,
    disable_reason: Option<&'static str>,
    send_data: DataStream,
    recv_data: DataStream,
    proto_state: Option<ProtocolState>,
    close_observed: bool,
    dead_proc_observed: bool,
    /// Transfer ticks left in the destruction grace period; -1 when not
    /// marked.
    death_countdown: i32,
    last_activity: Instant,
    last_bpf_ts_ns: u64,
    parse_errors: u32,
    active_since_tick: bool,
    idle_ticks: u32,
    pub stats: TrackerStats,
}

impl ConnTracker {
    pub fn new(id: ConnectionId, now: Instant) -> Self {
        Self {
            id,
            remote: None,
            protocol: Protocol::Unknown,
            state: TrackerState::Collecting,
            disable_reason: None,
            send_data: DataStream::new(),
            recv_data: DataStream::new(),
            proto_state: None,
            close_observed: false,
            dead_proc_observed: false,
            death_countdown: -1,
            last_activity: now,
            last_bpf_ts_ns: 0,
            parse_errors: 0,
            active_since_tick: true,
            idle_ticks: 0,
            stats: TrackerStats::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn disable_reason(&self) -> Option<&'static str> {
        self.disable_reason
    }

    pub fn stream(&self, direction: TrafficDirection) -> &DataStream {
        match direction {
            TrafficDirection::Egress => &self.send_data,
            TrafficDirection::Ingress => &self.recv_data,
        }
    }

    fn touch(&mut self, now: Instant, bpf_ts_ns: u64) {
        self.last_activity = now;
        self.last_bpf_ts_ns = self.last_bpf_ts_ns.max(bpf_ts_ns);
        self.active_since_tick = true;
    }

    /// Open/close control events. Duplicates are tolerated.
    pub fn accept_control(&mut self, ev: &ControlEvent, now: Instant) {
        self.touch(now, ev.ts_ns);
        match ev.kind {
            ControlKind::Open => {
                if self.id.creation_ts_ns != 0 && self.id.creation_ts_ns != ev.ts_ns {
                    debug!("tracker {:?}: clobbering open event", self.id);
                }
                self.id.creation_ts_ns = ev.ts_ns;
                if self.remote.is_none() {
                    self.remote = ev.remote_addr.to_socket_addr();
                    if let Some(addr) = self.remote {
                        debug!("tracker {:?}: remote {}", self.id, addr);
                    }
                }
            }
            ControlKind::Close => {
                self.close_observed = true;
            }
        }
    }

    /// Stream payload. The payload is copied out of the receive buffer
    /// here; nothing borrowed from the source outlives this call.
    pub fn accept_data(
        &mut self,
        header: &DataHeader,
        payload: &[u8],
        now: Instant,
        metrics: &TracerMetrics,
    ) -> Result<(), DropReason> {
        match self.state {
            TrackerState::Disabled => return Err(DropReason::TrackerDisabled),
            TrackerState::ReadyForDestruction => return Err(DropReason::TooOldGeneration),
            TrackerState::Collecting => {}
        }
        self.touch(now, header.ts_ns);
        if self.id.creation_ts_ns == 0 {
            self.id.creation_ts_ns = header.ts_ns;
        }
        self.stats.data_events += 1;
        match header.direction {
            TrafficDirection::Egress => self.stats.bytes_sent += header.orig_len,
            TrafficDirection::Ingress => self.stats.bytes_recv += header.orig_len,
        }

        let stream = match header.direction {
            TrafficDirection::Egress => &mut self.send_data,
            TrafficDirection::Ingress => &mut self.recv_data,
        };
        match stream.add(header.seq, payload, header.ts_ns) {
            AddOutcome::Added | AddOutcome::Duplicate => {}
            AddOutcome::Conflict => {
                self.disable("conflicting bytes on retransmitted range");
                metrics.tracker_disabled("conflicting bytes on retransmitted range");
                return Ok(());
            }
        }
        if header.truncated() {
            let stream = match header.direction {
                TrafficDirection::Egress => &mut self.send_data,
                TrafficDirection::Ingress => &mut self.recv_data,
            };
            stream.note_hole(header.seq + header.payload_len as u64, header.seq + header.orig_len);
        }
        Ok(())
    }

    /// Runs classification and the protocol parser over both streams.
    /// Gap deadlines and stream capacity are evaluated here, i.e. only at
    /// transfer ticks.
    pub fn process_frames(&mut self, cfg: &Config, metrics: &TracerMetrics, now: Instant) {
        if self.state == TrackerState::Disabled {
            return;
        }
        if self.protocol == Protocol::Unknown && !self.try_classify(cfg, metrics) {
            return;
        }

        for direction in [TrafficDirection::Egress, TrafficDirection::Ingress] {
            if let Some(reason) = self.process_direction(direction, cfg, metrics, now) {
                self.disable(reason);
                metrics.tracker_disabled(reason);
                return;
            }
        }
        if self.parse_errors > cfg.parse_error_budget {
            self.disable("parse error budget exhausted");
            metrics.tracker_disabled("parse error budget exhausted");
        }
    }

    /// Returns a disable reason on fatal parse outcomes.
    fn process_direction(
        &mut self,
        direction: TrafficDirection,
        cfg: &Config,
        metrics: &TracerMetrics,
        now: Instant,
    ) -> Option<&'static str> {
        let proto = self.protocol.as_str();
        let stream = match direction {
            TrafficDirection::Egress => &mut self.send_data,
            TrafficDirection::Ingress => &mut self.recv_data,
        };
        let proto_state = self
            .proto_state
            .as_mut()
            .expect("protocol state exists once classified");

        let mut progressed_this_tick = false;
        loop {
            let skipped = stream.skip_gaps(now, cfg.gap_timeout);
            metrics.reassembly_gaps.inc_by(skipped);
            let dropped = stream.enforce_capacity(cfg.max_stream_bytes);
            metrics.stream_bytes_dropped.inc_by(dropped as u64);

            let head_len = stream.contiguous_head().len();
            if head_len == 0 {
                break;
            }
            let outcome = {
                let head = stream.contiguous_head();
                let base = stream.next_seq();
                let ts_fn = |seq: u64| stream.ts_at(seq);
                protocols::parse_frames(proto_state, direction, head, base, &ts_fn)
            };
            self.parse_errors += outcome.recoverable_errors;
            metrics.parse_errors_inc(proto, outcome.recoverable_errors as u64);
            for frame in outcome.frames {
                stream.push_frame(frame, cfg.max_frames_buffered);
            }
            if outcome.fatal.is_some() {
                return outcome.fatal;
            }
            debug_assert!(outcome.consumed <= head_len);
            stream.consume(outcome.consumed.min(head_len));
            if outcome.consumed > 0 {
                progressed_this_tick = true;
                continue;
            }
            // A head blocked by a kernel-truncated suffix can never
            // complete; skip it like a gap and keep going.
            if outcome.needs_more && stream.discard_blocked_head() {
                metrics.reassembly_gaps.inc();
                continue;
            }
            // A partial head with data waiting beyond a hole is given one
            // gap-timeout's worth of ticks before it is abandoned.
            let stalled = stream.check_stall(now, cfg.gap_timeout, progressed_this_tick);
            if stalled > 0 {
                metrics.reassembly_gaps.inc_by(stalled);
                continue;
            }
            break;
        }
        None
    }

    /// Shows the head of either stream to the classifier. True once the
    /// protocol is known.
    fn try_classify(&mut self, cfg: &Config, metrics: &TracerMetrics) -> bool {
        let protocol = protocols::classify(
            window(self.send_data.contiguous_head(), cfg.classify_window),
            window(self.recv_data.contiguous_head(), cfg.classify_window),
        );
        if protocol != Protocol::Unknown {
            info!("tracker {:?}: classified as {}", self.id, protocol.as_str());
            self.protocol = protocol;
            self.proto_state = ProtocolState::new(protocol, cfg);
            return true;
        }
        // The window is per direction: the connection is only given up on
        // once one direction has shown a full window's worth of bytes
        // without a verdict.
        if self.stats.bytes_sent.max(self.stats.bytes_recv) >= cfg.classify_window as u64 {
            self.disable("no known protocol within classify window");
            metrics.tracker_disabled("no known protocol within classify window");
        }
        false
    }

    /// Drains matched records. Pairing state survives across ticks.
    pub fn match_records(&mut self, cfg: &Config, now: Instant) -> MatchSummary {
        let Some(proto_state) = self.proto_state.as_mut() else {
            return MatchSummary::default();
        };
        let summary = protocols::match_records(
            proto_state,
            self.send_data.frames_mut(),
            self.recv_data.frames_mut(),
            now,
            cfg.req_timeout,
        );
        self.stats.valid_records += summary.records.len() as u64;
        self.stats.invalid_records += summary.stitch_failures;
        summary
    }

    /// Lifecycle evaluation, run once per transfer tick after matching.
    pub fn cleanup(&mut self, cfg: &Config, now: Instant) {
        if self.state == TrackerState::ReadyForDestruction {
            // Burn down the grace period granted when the mark was set.
            if self.death_countdown > 0 {
                self.death_countdown -= 1;
            }
            return;
        }
        // A disabled tracker must keep its generation slot: removing it
        // would let a late event for the same generation materialize a
        // fresh Collecting tracker on a connection that was shut off.
        // Only generation supersession retires it.
        if self.state == TrackerState::Disabled {
            return;
        }

        if self.active_since_tick {
            self.idle_ticks = 0;
        } else {
            self.idle_ticks += 1;
        }
        self.active_since_tick = false;

        if self.close_observed && self.send_data.drained() && self.recv_data.drained() {
            self.mark_ready_for_destruction("connection closed");
            return;
        }
        if cfg.check_proc_liveness
            && !self.dead_proc_observed
            && self.idle_ticks >= PROC_CHECK_IDLE_TICKS
            && proc_fd_gone(self.id.tgid, self.id.fd)
        {
            self.dead_proc_observed = true;
        }
        if self.dead_proc_observed {
            self.mark_ready_for_destruction("process dead");
            return;
        }
        if now.duration_since(self.last_activity) >= cfg.inactivity_ttl {
            self.mark_ready_for_destruction("inactive");
        }
    }

    pub fn mark_ready_for_destruction(&mut self, reason: &'static str) {
        if self.state != TrackerState::ReadyForDestruction {
            debug!("tracker {:?}: ready for destruction ({reason})", self.id);
            self.state = TrackerState::ReadyForDestruction;
            self.death_countdown = 1;
        }
    }

    /// True once the grace period after the destruction mark has elapsed.
    pub fn ready_for_removal(&self) -> bool {
        self.state == TrackerState::ReadyForDestruction && self.death_countdown <= 0
    }

    /// Stops collection and releases buffered memory. The tracker object
    /// stays behind so late events are accounted as drops, not new
    /// connections.
    pub fn disable(&mut self, reason: &'static str) {
        if self.state == TrackerState::Disabled {
            return;
        }
        info!("tracker {:?}: disabled ({reason})", self.id);
        self.state = TrackerState::Disabled;
        self.disable_reason = Some(reason);
        self.send_data.reset();
        self.recv_data.reset();
        self.proto_state = None;
    }
}

fn window(buf: &[u8], max: usize) -> &[u8] {
    &buf[..buf.len().min(max)]
}

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::errors::DropReason;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    pub reason: DropReasonLabel,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum DropReasonLabel {
    UnknownPid,
    TooOldGeneration,
    TrackerDisabled,
    Malformed,
}

impl From<DropReason> for DropLabels {
    fn from(reason: DropReason) -> Self {
        let reason = match reason {
            DropReason::UnknownPid => DropReasonLabel::UnknownPid,
            DropReason::TooOldGeneration => DropReasonLabel::TooOldGeneration,
            DropReason::TrackerDisabled => DropReasonLabel::TrackerDisabled,
            DropReason::Malformed => DropReasonLabel::Malformed,
        };
        DropLabels { reason }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BufferLabels {
    pub buffer: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProtocolLabels {
    pub protocol: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

/// Counter handles shared between the engine thread and the metrics
/// endpoint. All handles are cheap atomics; cloning is free.
#[derive(Clone)]
pub struct TracerMetrics {
    pub events_lost: Family<BufferLabels, Counter>,
    pub ingest_drops: Family<DropLabels, Counter>,
    pub reassembly_gaps: Counter,
    pub stream_bytes_dropped: Counter,
    pub frames_dropped: Counter,
    pub parse_errors: Family<ProtocolLabels, Counter>,
    pub trackers_created: Counter,
    pub trackers_disabled: Family<ReasonLabels, Counter>,
    pub trackers_evicted: Family<ReasonLabels, Counter>,
    pub records_emitted: Family<ProtocolLabels, Counter>,
    pub records_filtered: Counter,
    pub requests_expired: Counter,
    pub active_trackers: Gauge,
}

impl TracerMetrics {
    pub fn new_registered(registry: &mut Registry) -> Self {
        let metrics = Self::unregistered();
        registry.register(
            "socktrace_events_lost",
            "Events the kernel reported lost per perf buffer",
            metrics.events_lost.clone(),
        );
        registry.register(
            "socktrace_ingest_drops",
            "Events dropped at the demultiplexer",
            metrics.ingest_drops.clone(),
        );
        registry.register(
            "socktrace_reassembly_gaps",
            "Byte ranges skipped in stream reassembly",
            metrics.reassembly_gaps.clone(),
        );
        registry.register(
            "socktrace_stream_bytes_dropped",
            "Buffered stream bytes dropped to honor the per-stream bound",
            metrics.stream_bytes_dropped.clone(),
        );
        registry.register(
            "socktrace_frames_dropped",
            "Parsed frames dropped to honor the per-stream frame bound",
            metrics.frames_dropped.clone(),
        );
        registry.register(
            "socktrace_parse_errors",
            "Recoverable protocol parse errors",
            metrics.parse_errors.clone(),
        );
        registry.register(
            "socktrace_trackers_created",
            "Connection trackers materialized",
            metrics.trackers_created.clone(),
        );
        registry.register(
            "socktrace_trackers_disabled",
            "Connection trackers disabled",
            metrics.trackers_disabled.clone(),
        );
        registry.register(
            "socktrace_trackers_evicted",
            "Connection trackers destroyed",
            metrics.trackers_evicted.clone(),
        );
        registry.register(
            "socktrace_records_emitted",
            "Records appended to output tables",
            metrics.records_emitted.clone(),
        );
        registry.register(
            "socktrace_records_filtered",
            "Matched records dropped by filters before table append",
            metrics.records_filtered.clone(),
        );
        registry.register(
            "socktrace_requests_expired",
            "Unmatched requests dropped after the request timeout",
            metrics.requests_expired.clone(),
        );
        registry.register(
            "socktrace_active_trackers",
            "Live connection trackers",
            metrics.active_trackers.clone(),
        );
        metrics
    }

    /// Handles not wired to any registry; used by tests.
    pub fn unregistered() -> Self {
        Self {
            events_lost: Family::default(),
            ingest_drops: Family::default(),
            reassembly_gaps: Counter::default(),
            stream_bytes_dropped: Counter::default(),
            frames_dropped: Counter::default(),
            parse_errors: Family::default(),
            trackers_created: Counter::default(),
            trackers_disabled: Family::default(),
            trackers_evicted: Family::default(),
            records_emitted: Family::default(),
            records_filtered: Counter::default(),
            requests_expired: Counter::default(),
            active_trackers: Gauge::default(),
        }
    }

    pub fn ingest_drop(&self, reason: DropReason) {
        self.ingest_drops.get_or_create(&reason.into()).inc();
    }

    pub fn parse_errors_inc(&self, protocol: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.parse_errors
            .get_or_create(&ProtocolLabels {
                protocol: protocol.to_string(),
            })
            .inc_by(count);
    }

    pub fn tracker_disabled(&self, reason: &str) {
        self.trackers_disabled
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn trackers_evicted_inc(&self, reason: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.trackers_evicted
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc_by(count);
    }

    pub fn records_emitted(&self, protocol: &str, count: u64) {
        self.records_emitted
            .get_or_create(&ProtocolLabels {
                protocol: protocol.to_string(),
            })
            .inc_by(count);
    }
}

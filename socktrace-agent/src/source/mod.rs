//! Event sources: drivers that drain kernel (or recorded) event streams
//! and hand raw bytes to the engine.

#[cfg(target_os = "linux")]
pub mod perf;
pub mod replay;

use anyhow::Result;

/// Receives raw events during a poll call. Byte slices are only valid for
/// the duration of the callback and must be copied to be retained.
pub trait EventSink {
    fn control_event(&mut self, bytes: &[u8]);
    fn data_event(&mut self, bytes: &[u8]);
    fn events_lost(&mut self, buffer: &'static str, count: u64);
}

/// A drainable stream of socket events. `poll` invokes the sink
/// synchronously, preserving per-buffer kernel order; ordering across
/// buffers is not guaranteed. Not safe for concurrent polling — the
/// engine thread is the only caller.
pub trait EventSource {
    /// Drains up to `max_batch` events; returns how many were dispatched.
    fn poll(&mut self, max_batch: usize, sink: &mut dyn EventSink) -> Result<usize>;
}

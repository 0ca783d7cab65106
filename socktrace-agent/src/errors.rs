use std::path::PathBuf;

use thiserror::Error;

/// Why an event was refused at the demultiplexer. Surfaced as counters,
/// never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    UnknownPid,
    TooOldGeneration,
    TrackerDisabled,
    Malformed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UnknownPid => "unknown_pid",
            DropReason::TooOldGeneration => "too_old_generation",
            DropReason::TrackerDisabled => "tracker_disabled",
            DropReason::Malformed => "malformed",
        }
    }
}

/// Startup-only failures. Everything after startup is recovered locally and
/// reported through metrics.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to open pinned map {name} under {dir}: {reason}")]
    MapOpen {
        name: &'static str,
        dir: PathBuf,
        reason: String,
    },
    #[error("failed to open event dump {path}: {source}")]
    DumpOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load descriptor set {path}: {reason}")]
    DescriptorLoad { path: PathBuf, reason: String },
    #[error("event source io: {0}")]
    SourceIo(#[from] std::io::Error),
}

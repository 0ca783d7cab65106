//! Length-prefixed event dump files: a tee writer for live capture and a
//! source that replays a dump through the engine offline.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::Result;
use log::info;

use crate::errors::AgentError;

use super::{EventSink, EventSource};

pub const TAG_CONTROL: u8 = 0;
pub const TAG_DATA: u8 = 1;

/// Appends each raw event as `tag(u8) | len(u32 LE) | bytes`.
pub struct DumpWriter {
    out: BufWriter<File>,
}

impl DumpWriter {
    pub fn create(path: &Path) -> Result<Self, AgentError> {
        let file = File::create(path).map_err(|source| AgentError::DumpOpen {
            path: path.to_path_buf(),
            source,
        })?;
        info!("recording raw events to {}", path.display());
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    pub fn record(&mut self, tag: u8, bytes: &[u8]) -> std::io::Result<()> {
        self.out.write_all(&[tag])?;
        self.out.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.out.write_all(bytes)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

impl Drop for DumpWriter {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

/// Replays a recorded dump. Exhausted sources keep returning zero drained
/// events.
pub struct ReplaySource {
    events: Vec<(u8, Vec<u8>)>,
    pos: usize,
}

impl ReplaySource {
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        let mut bytes = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|source| AgentError::DumpOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_bytes(&bytes))
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Self {
        let mut events = Vec::new();
        while bytes.len() >= 5 {
            let tag = bytes[0];
            let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
            if bytes.len() < 5 + len {
                break;
            }
            events.push((tag, bytes[5..5 + len].to_vec()));
            bytes = &bytes[5 + len..];
        }
        Self { events, pos: 0 }
    }

    pub fn from_events(events: Vec<(u8, Vec<u8>)>) -> Self {
        Self { events, pos: 0 }
    }

    pub fn exhausted(&self) -> bool {
        self.pos >= self.events.len()
    }
}

impl EventSource for ReplaySource {
    fn poll(&mut self, max_batch: usize, sink: &mut dyn EventSink) -> Result<usize> {
        let mut drained = 0;
        while drained < max_batch && self.pos < self.events.len() {
            let (tag, bytes) = &self.events[self.pos];
            self.pos += 1;
            match *tag {
                TAG_CONTROL => sink.control_event(bytes),
                TAG_DATA => sink.data_event(bytes),
                _ => continue,
            }
            drained += 1;
        }
        Ok(drained)
    }
}

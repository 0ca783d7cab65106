//! Perf-buffer driver over the pinned maps exported by the kernel probes.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use aya::maps::perf::PerfEventArrayBuffer;
use aya::maps::{Map, MapData, PerfEventArray};
use aya::util::online_cpus;
use bytes::BytesMut;
use log::info;

use socktrace_common::{CONTROL_EVENTS_MAP, DATA_EVENTS_MAP, MAX_EVENT_PAYLOAD};

use crate::errors::AgentError;
use crate::source::replay::{DumpWriter, TAG_CONTROL, TAG_DATA};
use crate::source::{EventSink, EventSource};

/// Events read per read_events call, per CPU buffer.
const READ_BATCH: usize = 64;

pub struct PerfEventSource {
    control_bufs: Vec<PerfEventArrayBuffer<MapData>>,
    data_bufs: Vec<PerfEventArrayBuffer<MapData>>,
    read_bufs: Vec<BytesMut>,
    dump: Option<DumpWriter>,
}

impl PerfEventSource {
    /// Opens the pinned perf maps under `maps_dir`. Failure here is fatal
    /// to startup, mirroring probe-attach failures.
    pub fn open(maps_dir: &Path, dump_path: Option<&Path>) -> Result<Self> {
        let cpus = online_cpus().map_err(|(op, e)| anyhow!("{op}: {e}"))?;
        let mut control_array = open_array(maps_dir, CONTROL_EVENTS_MAP)?;
        let mut data_array = open_array(maps_dir, DATA_EVENTS_MAP)?;

        let mut control_bufs = Vec::with_capacity(cpus.len());
        let mut data_bufs = Vec::with_capacity(cpus.len());
        for &cpu in &cpus {
            control_bufs.push(control_array.open(cpu, None)?);
            data_bufs.push(data_array.open(cpu, None)?);
        }
        info!(
            "perf source ready: {} cpus, maps under {}",
            cpus.len(),
            maps_dir.display()
        );

        let dump = match dump_path {
            Some(path) => Some(DumpWriter::create(path)?),
            None => None,
        };
        Ok(Self {
            control_bufs,
            data_bufs,
            read_bufs: (0..READ_BATCH)
                .map(|_| BytesMut::with_capacity(MAX_EVENT_PAYLOAD + 256))
                .collect(),
            dump,
        })
    }
}

fn open_array(dir: &Path, name: &'static str) -> Result<PerfEventArray<MapData>> {
    let path: PathBuf = dir.join(name);
    let map_data = MapData::from_pin(&path).map_err(|e| AgentError::MapOpen {
        name,
        dir: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    let map = Map::PerfEventArray(map_data);
    PerfEventArray::try_from(map)
        .map_err(|e| anyhow!("map {name} is not a perf event array: {e}"))
}

impl EventSource for PerfEventSource {
    fn poll(&mut self, max_batch: usize, sink: &mut dyn EventSink) -> Result<usize> {
        let mut drained = 0usize;

        for buf in &mut self.control_bufs {
            if drained >= max_batch {
                break;
            }
            let events = buf.read_events(&mut self.read_bufs)?;
            for read_buf in self.read_bufs.iter().take(events.read) {
                if let Some(dump) = &mut self.dump {
                    dump.record(TAG_CONTROL, read_buf)?;
                }
                sink.control_event(read_buf);
                drained += 1;
            }
            if events.lost > 0 {
                sink.events_lost(CONTROL_EVENTS_MAP, events.lost as u64);
            }
        }

        for buf in &mut self.data_bufs {
            if drained >= max_batch {
                break;
            }
            let events = buf.read_events(&mut self.read_bufs)?;
            for read_buf in self.read_bufs.iter().take(events.read) {
                if let Some(dump) = &mut self.dump {
                    dump.record(TAG_DATA, read_buf)?;
                }
                sink.data_event(read_buf);
                drained += 1;
            }
            if events.lost > 0 {
                sink.events_lost(DATA_EVENTS_MAP, events.lost as u64);
            }
        }

        Ok(drained)
    }
}

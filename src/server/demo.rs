//! Demo recording
//!
//! A demo is the sequence of snapshots the server produced, written through
//! a [`DemoSink`]. Where the bytes go is up to the [`DemoStore`].

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::net::protocol::Tick;
use crate::snapshot::Snapshot;

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("invalid demo name '{0}'")]
    InvalidName(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

/// First record of a demo file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoHeader {
    pub map: String,
}

/// One recorded snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoFrame {
    pub tick: Tick,
    pub snapshot: Snapshot,
}

/// Borrowing twin of [`DemoFrame`]; encodes identically
#[derive(Serialize)]
struct DemoFrameRef<'a> {
    tick: Tick,
    snapshot: &'a Snapshot,
}

fn write_record<T: Serialize, W: Write>(writer: &mut W, record: &T) -> Result<(), DemoError> {
    bincode::serde::encode_into_std_write(record, writer, bincode::config::legacy())
        .map_err(|e| DemoError::Encode(e.to_string()))?;
    Ok(())
}

fn read_record<T: for<'de> Deserialize<'de>, R: Read>(reader: &mut R) -> Result<T, DemoError> {
    bincode::serde::decode_from_std_read(reader, bincode::config::legacy())
        .map_err(|e| DemoError::Decode(e.to_string()))
}

/// Read back a demo written by [`DirectoryDemoStore`]
pub fn read_demo(path: &Path) -> Result<(DemoHeader, Vec<DemoFrame>), DemoError> {
    let bytes = std::fs::read(path)?;
    let mut reader = bytes.as_slice();
    let header = read_record(&mut reader)?;
    let mut frames = Vec::new();
    while !reader.is_empty() {
        frames.push(read_record(&mut reader)?);
    }
    Ok((header, frames))
}

pub trait DemoSink: Send {
    fn record(&mut self, tick: Tick, snapshot: &Snapshot) -> Result<(), DemoError>;
    fn finish(&mut self) -> Result<(), DemoError>;
}

pub trait DemoStore: Send {
    fn open(&mut self, name: &str, map: &str) -> Result<Box<dyn DemoSink>, DemoError>;
}

/// An optional active recording
#[derive(Default)]
pub struct DemoRecorder {
    sink: Option<Box<dyn DemoSink>>,
}

impl DemoRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.sink.is_some()
    }

    pub fn start(&mut self, sink: Box<dyn DemoSink>) {
        self.stop();
        self.sink = Some(sink);
    }

    /// Record one snapshot. A failing sink ends the recording.
    pub fn record(&mut self, tick: Tick, snapshot: &Snapshot) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.record(tick, snapshot) {
                tracing::warn!("demo recording stopped: {}", e);
                self.sink = None;
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.finish() {
                tracing::warn!("failed to finish demo: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for DemoRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoRecorder")
            .field("recording", &self.is_recording())
            .finish()
    }
}

/// Writes `<dir>/<name>.demo`: a bincode [`DemoHeader`] followed by one
/// [`DemoFrame`] per recorded snapshot
#[derive(Debug, Clone)]
pub struct DirectoryDemoStore {
    dir: PathBuf,
}

impl DirectoryDemoStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DemoStore for DirectoryDemoStore {
    fn open(&mut self, name: &str, map: &str) -> Result<Box<dyn DemoSink>, DemoError> {
        if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(DemoError::InvalidName(name.to_string()));
        }
        std::fs::create_dir_all(&self.dir)?;
        let mut writer = BufWriter::new(File::create(self.dir.join(format!("{}.demo", name)))?);
        write_record(&mut writer, &DemoHeader { map: map.to_string() })?;
        Ok(Box::new(FileDemoSink { writer }))
    }
}

struct FileDemoSink {
    writer: BufWriter<File>,
}

impl DemoSink for FileDemoSink {
    fn record(&mut self, tick: Tick, snapshot: &Snapshot) -> Result<(), DemoError> {
        write_record(&mut self.writer, &DemoFrameRef { tick, snapshot })
    }

    fn finish(&mut self) -> Result<(), DemoError> {
        self.writer.flush()?;
        Ok(())
    }
}

//! JSONL export of captured invocation history.
//!
//! Records are serialized where they are recorded; a writer thread appends
//! the finished lines to the file.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use crate::gateway::InvocationRecord;

use super::types::RerankOutcome;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("history file: {0}")]
    Io(#[from] io::Error),
    #[error("history record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("history writer already stopped")]
    Closed,
    #[error("history writer panicked")]
    WorkerPanicked,
}

pub trait TraceSink: Send + Sync {
    fn record(&self, record: &InvocationRecord) -> Result<(), TraceError>;

    /// Every captured attempt of one outcome, in call order.
    fn record_outcome(&self, outcome: &RerankOutcome) -> Result<usize, TraceError> {
        let history = outcome.history.as_deref().unwrap_or_default();
        for record in history {
            self.record(record)?;
        }
        Ok(history.len())
    }
}

/// Clonable handle feeding one history file.
#[derive(Clone)]
pub struct JsonlTraceSink {
    lines: mpsc::Sender<String>,
}

/// The writer thread. Joining waits for every sink clone to be dropped and
/// returns the number of lines written.
pub struct TraceWorker {
    handle: thread::JoinHandle<io::Result<usize>>,
}

impl TraceWorker {
    pub fn join(self) -> Result<usize, TraceError> {
        let written = self.handle.join().map_err(|_| TraceError::WorkerPanicked)??;
        Ok(written)
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = File::create(path)?;
        let (lines, incoming) = mpsc::channel();
        let handle = thread::spawn(move || append_lines(BufWriter::new(file), incoming));
        Ok((Self { lines }, TraceWorker { handle }))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, record: &InvocationRecord) -> Result<(), TraceError> {
        let line = serde_json::to_string(record)?;
        self.lines.send(line).map_err(|_| TraceError::Closed)
    }
}

fn append_lines(mut out: impl Write, incoming: mpsc::Receiver<String>) -> io::Result<usize> {
    let mut written = 0;
    for line in incoming {
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

use std::fs::File;
use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::error;

use crate::event::{IndexValue, TraceEvent, TraceEventWithIndex};
use crate::util::lock_unpoisoned;

/// Fixed-width record terminator for the file report format.
const RECORD_SEPARATOR: &str = "========================================================================================================";

/// Error text produced when a client with redirects disabled receives a
/// redirect response. The remote collector does not treat this as a failure,
/// so the network sink clears it before transmission.
const BENIGN_REDIRECT_ERROR: &str = "auto redirect is disabled";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SinkError {
    #[error("failed to open event sink target: {source}")]
    Open {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write trace event: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize trace event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("event sink connection lost: {source}")]
    ConnectionLost {
        #[source]
        source: std::io::Error,
    },
    #[error("event sink is closed")]
    Closed,
}

impl SinkError {
    /// Unrecoverable failures permanently disable the sink that produced
    /// them; subsequent pushes are rejected with [`SinkError::Closed`].
    pub const fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Serialize { .. } | Self::ConnectionLost { .. })
    }
}

/// A pluggable destination for completed-request trace events.
///
/// `push` must be safe to call concurrently from requests sharing one
/// client; implementations serialize writes behind their own lock so records
/// never interleave. A failed push is reported to the dispatcher, which logs
/// it; it never reaches the request path.
pub trait EventSink: Send + Sync {
    fn push(&self, index: &IndexValue, event: &TraceEvent) -> Result<(), SinkError>;

    fn name(&self) -> &'static str {
        "sink"
    }
}

/// Appends each event as a human-readable report block to one open file.
///
/// The target file is created (truncating) at construction. The owner is
/// responsible for calling [`FileSink::close`]; the dispatcher never closes
/// sinks.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = File::create(&path).map_err(|source| SinkError::Open { source })?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the file handle. Further pushes are rejected.
    pub fn close(&self) {
        lock_unpoisoned(&self.file).take();
    }
}

impl EventSink for FileSink {
    fn push(&self, index: &IndexValue, event: &TraceEvent) -> Result<(), SinkError> {
        let record = format!("Index:{index}\n\n{event}{RECORD_SEPARATOR}\n");
        let mut guard = lock_unpoisoned(&self.file);
        let Some(file) = guard.as_mut() else {
            return Err(SinkError::Closed);
        };
        file.write_all(record.as_bytes())
            .map_err(|source| SinkError::Io { source })
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Sends each event as one newline-terminated JSON record over a long-lived
/// connection to a remote collector.
///
/// A serialization failure or a write failure is unrecoverable for this
/// sink: the connection is dropped and later pushes are rejected. There is
/// no reconnect logic.
pub struct RemoteSink {
    peer: String,
    conn: Mutex<Option<TcpStream>>,
}

impl RemoteSink {
    pub fn connect(addr: &str) -> Result<Self, SinkError> {
        let conn = TcpStream::connect(addr).map_err(|source| SinkError::Open { source })?;
        Ok(Self {
            peer: addr.to_owned(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Releases the connection. Further pushes are rejected.
    pub fn close(&self) {
        lock_unpoisoned(&self.conn).take();
    }
}

impl EventSink for RemoteSink {
    fn push(&self, index: &IndexValue, event: &TraceEvent) -> Result<(), SinkError> {
        let mut event = event.clone();
        if event.error.contains(BENIGN_REDIRECT_ERROR) {
            event.error.clear();
        }
        let indexed = TraceEventWithIndex {
            event,
            index: index.clone(),
        };

        let mut guard = lock_unpoisoned(&self.conn);
        let Some(mut conn) = guard.take() else {
            return Err(SinkError::Closed);
        };
        // The connection is only put back on success: unrecoverable failures
        // leave the sink permanently closed.
        let mut line = match serde_json::to_vec(&indexed) {
            Ok(line) => line,
            Err(source) => return Err(SinkError::Serialize { source }),
        };
        line.push(b'\n');
        match conn.write_all(&line) {
            Ok(()) => {
                *guard = Some(conn);
                Ok(())
            }
            Err(source) => Err(SinkError::ConnectionLost { source }),
        }
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Fans one completed-request event out to every registered sink, in
/// registration order. Sink failures are logged and never interrupt the
/// remaining sinks or the request path.
pub(crate) fn dispatch_event(
    sinks: &[Arc<dyn EventSink>],
    index: &IndexValue,
    event: &TraceEvent,
) {
    for sink in sinks {
        if let Err(push_error) = sink.push(index, event) {
            error!(
                sink = sink.name(),
                error = %push_error,
                unrecoverable = push_error.is_unrecoverable(),
                "failed to push trace event"
            );
        }
    }
}

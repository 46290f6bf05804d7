//! Event channel reader
//!
//! The kernel side of a program writes fixed-layout records into a perf event
//! array. Whatever pumps that array (per-CPU tasks in the kernel backend, a
//! test harness otherwise) pushes into the sender half of [`channel`]; the
//! runtime's consumption task is the only reader.
//!
//! Closing is signalled out of band through a [`ReaderCloser`] so that a read
//! blocked on an empty channel returns [`ReadError::Closed`] right away.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// One item yielded by the event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A raw record in the program's fixed layout
    Sample(Vec<u8>),
    /// The kernel dropped this many records since the previous read
    Lost(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// The reader was closed; the only non-error end of a run
    #[error("event reader closed")]
    Closed,
    #[error("{0}")]
    Io(String),
}

/// Sending half used by whatever pumps records out of the kernel
pub type RecordSender = mpsc::Sender<Result<Record, ReadError>>;

/// Lazy, non-restartable sequence of records
pub struct EventReader {
    records: mpsc::Receiver<Result<Record, ReadError>>,
    closed: watch::Receiver<bool>,
}

/// Closes an [`EventReader`] from any task
#[derive(Clone)]
pub struct ReaderCloser {
    flag: Arc<watch::Sender<bool>>,
}

/// Create a reader with room for `capacity` buffered records.
pub fn channel(capacity: usize) -> (RecordSender, EventReader, ReaderCloser) {
    let (tx, rx) = mpsc::channel(capacity);
    let (flag, closed) = watch::channel(false);
    let reader = EventReader {
        records: rx,
        closed,
    };
    let closer = ReaderCloser {
        flag: Arc::new(flag),
    };
    (tx, reader, closer)
}

impl EventReader {
    /// Wait for the next record.
    ///
    /// Returns `Err(ReadError::Closed)` once the reader has been closed or
    /// every sender is gone, even if records are still buffered.
    pub async fn read(&mut self) -> Result<Record, ReadError> {
        if *self.closed.borrow() {
            return Err(ReadError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.changed() => Err(ReadError::Closed),
            item = self.records.recv() => item.unwrap_or(Err(ReadError::Closed)),
        }
    }
}

impl ReaderCloser {
    pub fn close(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.flag.borrow()
    }
}

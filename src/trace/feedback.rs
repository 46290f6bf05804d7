//! Operator-facing output
//!
//! Trace output goes to stdout, per-node feedback to stderr. Log lines go
//! through `tracing` and never through the console.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Process-wide output and error sinks
#[derive(Clone)]
pub struct Console {
    out: Sink,
    err: Sink,
}

/// In-memory buffer behind a captured console
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "buffer poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// What a captured console has written so far
#[derive(Clone)]
pub struct CapturedOutput {
    out: SharedBuffer,
    err: SharedBuffer,
}

impl CapturedOutput {
    pub fn stdout(&self) -> String {
        self.out.contents()
    }

    pub fn stderr(&self) -> String {
        self.err.contents()
    }
}

impl Console {
    pub fn stdio() -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(io::stdout()))),
            err: Arc::new(Mutex::new(Box::new(io::stderr()))),
        }
    }

    /// Console writing into memory, for tests and embedding
    pub fn capture() -> (Self, CapturedOutput) {
        let out = SharedBuffer::default();
        let err = SharedBuffer::default();
        let console = Self {
            out: Arc::new(Mutex::new(Box::new(out.clone()))),
            err: Arc::new(Mutex::new(Box::new(err.clone()))),
        };
        (console, CapturedOutput { out, err })
    }

    pub fn out_line(&self, line: &str) {
        write_line(&self.out, line);
    }

    pub fn err_line(&self, line: &str) {
        write_line(&self.err, line);
    }

    /// Print per-node feedback to the error sink
    pub fn node_feedback(&self, messages: &BTreeMap<String, String>, total_nodes: usize) {
        for line in feedback_lines(messages, total_nodes) {
            self.err_line(&line);
        }
    }
}

fn write_line(sink: &Sink, line: &str) {
    let Ok(mut w) = sink.lock() else {
        return;
    };
    // Output is best effort; a closed pipe is handled by the signal path
    let _ = writeln!(w, "{}", line);
    let _ = w.flush();
}

/// The value every entry shares, if there is exactly one
fn identical_value(messages: &BTreeMap<String, String>) -> Option<&str> {
    let mut values = messages.values();
    let first = values.next()?;
    values.all(|v| v == first).then_some(first.as_str())
}

/// Lines reporting per-node failures
///
/// When every node (and more than one) reported the same text, a single
/// aggregate line replaces the per-node ones.
pub fn feedback_lines(messages: &BTreeMap<String, String>, total_nodes: usize) -> Vec<String> {
    if messages.len() > 1 && messages.len() == total_nodes {
        if let Some(value) = identical_value(messages) {
            return vec![format!("Failed to run the gadget on all nodes: {}", value)];
        }
    }
    messages
        .iter()
        .map(|(node, msg)| format!("Failed to run the gadget on node {:?}: {}", node, msg))
        .collect()
}

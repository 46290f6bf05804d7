//! Stream aggregator
//!
//! Fans out one exec per node copy of a converged streaming trace and fans
//! every line into the console. Lines and completion travel on the same
//! channel, so a node's lines always precede its completion notice and keep
//! their order; nodes interleave freely.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::client::NodeExec;
use super::feedback::Console;
use super::resource::Trace;
use super::signals::interrupted;
use super::TraceError;
use crate::metrics;

/// Which remote stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub enum StreamMessage {
    Line {
        node: String,
        stream: OutputStream,
        line: String,
    },
    /// Exactly one per node, after all of its lines
    Done {
        node: String,
        result: Result<(), String>,
    },
}

/// Sink handed to [`NodeExec::exec`] for one node
#[derive(Clone)]
pub struct NodeOutput {
    node: String,
    tx: mpsc::UnboundedSender<StreamMessage>,
}

impl NodeOutput {
    pub fn new(node: impl Into<String>, tx: mpsc::UnboundedSender<StreamMessage>) -> Self {
        Self {
            node: node.into(),
            tx,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn stdout(&self, line: impl Into<String>) {
        self.send(OutputStream::Stdout, line.into());
    }

    pub fn stderr(&self, line: impl Into<String>) {
        self.send(OutputStream::Stderr, line.into());
    }

    fn send(&self, stream: OutputStream, line: String) {
        // A closed channel means the aggregation ended; the line is moot
        let _ = self.tx.send(StreamMessage::Line {
            node: self.node.clone(),
            stream,
            line,
        });
    }
}

/// Per-line transform applied in human-readable mode
pub type LineTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

pub struct StreamAggregator {
    exec: Arc<dyn NodeExec>,
    console: Console,
    command: String,
    node_filter: Option<String>,
    json: bool,
    transform: LineTransform,
}

impl StreamAggregator {
    pub fn new(
        exec: Arc<dyn NodeExec>,
        console: Console,
        command: impl Into<String>,
        transform: LineTransform,
    ) -> Self {
        Self {
            exec,
            console,
            command: command.into(),
            node_filter: None,
            json: false,
            transform,
        }
    }

    /// Only attach to copies on this node
    pub fn node_filter(mut self, node: Option<String>) -> Self {
        self.node_filter = node.filter(|n| !n.is_empty());
        self
    }

    /// Pass lines through untouched
    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Attach to every matching copy until all complete or `cancel` fires.
    ///
    /// Cancellation is not an error: a single "Terminating..." line is
    /// printed (outside JSON mode) and `Ok(())` is returned.
    pub async fn run(
        &self,
        traces: &[Trace],
        mut cancel: watch::Receiver<usize>,
    ) -> Result<(), TraceError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut branches = Vec::new();

        for trace in traces {
            let node = trace.spec.node.clone();
            if let Some(filter) = &self.node_filter {
                if &node != filter {
                    continue;
                }
            }
            in_flight.fetch_add(1, Ordering::SeqCst);

            let exec = Arc::clone(&self.exec);
            let command = format!("{} {}", self.command, trace.tracer_id());
            let tx = tx.clone();
            branches.push(tokio::spawn(async move {
                debug!(node = %node, command = %command, "attaching to node stream");
                let output = NodeOutput::new(node.clone(), tx.clone());
                let result = exec
                    .exec(&node, &command, output)
                    .await
                    .map_err(|e| e.to_string());
                let _ = tx.send(StreamMessage::Done { node, result });
            }));
        }
        drop(tx);

        if branches.is_empty() {
            return Ok(());
        }
        metrics::ACTIVE_STREAMS.add(branches.len() as f64);
        let attached = branches.len();

        loop {
            tokio::select! {
                biased;
                _ = interrupted(&mut cancel) => {
                    info!("stream aggregation cancelled");
                    if !self.json {
                        self.console.out_line("\nTerminating...");
                    }
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(StreamMessage::Line { stream, line, .. }) => self.write_line(stream, &line),
                    Some(StreamMessage::Done { node, result }) => {
                        match result {
                            Ok(()) => self.console.out_line(&format!("Trace completed on node {}", node)),
                            Err(e) => self.console.out_line(&format!("Error running command on node {}: {}", node, e)),
                        }
                        if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        for branch in &branches {
            branch.abort();
        }
        metrics::ACTIVE_STREAMS.sub(attached as f64);
        Ok(())
    }

    fn write_line(&self, stream: OutputStream, line: &str) {
        let rendered = if self.json {
            line.to_string()
        } else {
            let rendered = (self.transform)(line);
            // An empty rendering drops the line
            if rendered.is_empty() {
                return;
            }
            rendered
        };
        match stream {
            OutputStream::Stdout => self.console.out_line(&rendered),
            OutputStream::Stderr => self.console.err_line(&rendered),
        }
    }
}

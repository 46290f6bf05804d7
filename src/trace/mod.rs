//! Distributed trace orchestration
//!
//! A trace request is materialized as one Trace object per target node, all
//! sharing one random id. The orchestrator creates the copies (rolling back on
//! partial failure), waits for them to converge, changes their operation and
//! deletes them; the stream aggregator collects live output from every node.
//!
//! ## Flow
//!
//! ```text
//!  TraceConfig ──► create copies (1 per node) ──► wait for state
//!                                                    │
//!                     ┌──────────────────────────────┴────────┐
//!                     ▼                                       ▼
//!              stream aggregator                       status handler
//!      (exec on every node, fan-in lines)          (reads copy statuses)
//!                     │                                       │
//!                     └──────────────► delete copies ◄────────┘
//! ```
//!
//! Node failures are reported per node and only fail the request when no
//! copy converged.

pub mod client;
pub mod feedback;
pub mod kube;
pub mod orchestrator;
pub mod resource;
pub mod signals;
pub mod stream;

use std::collections::BTreeMap;

pub use client::{ClientError, ControlPlane, NodeExec};
pub use feedback::{CapturedOutput, Console};
pub use kube::{KubeProxyClient, KubectlExec};
pub use orchestrator::{TraceOrchestrator, TraceSummary};
pub use resource::{OutputMode, Trace};
pub use signals::{spawn_signal_listener, InterruptAction, InterruptState};
pub use stream::{LineTransform, NodeOutput, OutputStream, StreamAggregator};

/// Errors surfaced by the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("Error listing nodes: {0}")]
    ListNodes(#[source] ClientError),

    #[error("node {0:?} not found in the cluster")]
    NodeNotFound(String),

    #[error("Error creating trace on node {node:?}: {source}")]
    Create {
        node: String,
        #[source]
        source: ClientError,
    },

    #[error("Error getting traces: {0}")]
    List(#[source] ClientError),

    #[error("no traces found with id {0:?}")]
    NotFound(String),

    /// Zero copies reached the expected state
    #[error("Failed to run the gadget on all nodes: None of them succeeded")]
    NoneSucceeded,

    #[error("Error setting operation on trace {trace_id}: {}", failures.join("; "))]
    Operation {
        trace_id: String,
        failures: Vec<String>,
    },

    #[error("Error deleting traces: {0}")]
    Delete(#[source] ClientError),

    #[error("interrupted")]
    Interrupted,

    #[error("invalid trace config: {0}")]
    InvalidConfig(String),
}

/// How results are rendered to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Columns,
    Json,
}

/// Per-request filter and display flags
#[derive(Debug, Clone, Default)]
pub struct CommonFlags {
    /// Single target node; every node when empty
    pub node: String,
    pub namespace: String,
    pub podname: String,
    pub containername: String,
    pub labels: BTreeMap<String, String>,
    pub output_format: OutputFormat,
    pub verbose: bool,
}

/// Everything needed to create and drive one trace request
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    /// Program name, e.g. `tcpconnect`
    pub gadget: String,
    /// Operation annotated on creation, e.g. `start`
    pub operation: String,
    pub output_mode: OutputMode,
    /// State in which copies carry output
    pub output_state: String,
    /// File path or external resource name, depending on the mode
    pub output: String,
    /// State copies must reach before creation returns; no wait when empty
    pub initial_state: String,
    /// Program parameters forwarded to the node agent
    pub parameters: BTreeMap<String, String>,
    pub flags: CommonFlags,
}

impl TraceConfig {
    /// Streaming request started right away
    pub fn stream(gadget: &str) -> Self {
        Self {
            gadget: gadget.to_string(),
            operation: "start".to_string(),
            output_mode: OutputMode::Stream,
            output_state: "Started".to_string(),
            ..Default::default()
        }
    }
}

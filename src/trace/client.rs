//! Control-plane and node-exec seams
//!
//! The orchestrator only talks to the cluster through these two traits. Both
//! must be safe to share across concurrent calls without external locking.

use async_trait::async_trait;

use super::resource::Trace;
use super::stream::NodeOutput;

/// Errors from the control plane or the node exec channel
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("exec error: {0}")]
    Exec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Typed access to Trace objects and the node list
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Names of every node currently in the cluster
    async fn list_nodes(&self) -> Result<Vec<String>, ClientError>;

    /// Create one copy; the server assigns the name from `generateName`
    async fn create_trace(&self, trace: &Trace) -> Result<Trace, ClientError>;

    async fn list_traces(&self, namespace: &str, selector: &str)
        -> Result<Vec<Trace>, ClientError>;

    /// JSON merge patch of one object
    async fn patch_trace(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ClientError>;

    /// Delete every object matching the selector
    async fn delete_traces(&self, namespace: &str, selector: &str) -> Result<(), ClientError>;
}

/// Run a command in the agent on a given node
#[async_trait]
pub trait NodeExec: Send + Sync {
    /// Resolves when the remote command exits; lines are forwarded to
    /// `output` as they arrive, stdout and stderr separately.
    async fn exec(&self, node: &str, command: &str, output: NodeOutput)
        -> Result<(), ClientError>;
}

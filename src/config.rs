//! Configuration for the orchestrator (client side) and the node runtime
//!
//! Both configs carry sensible defaults and can be overridden from
//! `TRACEMESH_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Namespace holding Trace objects and the node agents
pub const DEFAULT_NAMESPACE: &str = "gadget";

/// Configuration for the trace orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Namespace where Trace copies are created
    pub namespace: String,
    /// How long copies get to reach the expected state
    pub state_timeout: Duration,
    /// Delay between two convergence rounds
    pub poll_interval: Duration,
    /// Base URL of the control-plane API (usually a local `kubectl proxy`)
    pub api_server: String,
    /// Label selector matching the node agent pods
    pub agent_selector: String,
    /// Command run inside the agent to receive a trace's stream; the
    /// tracer id is appended as the last argument
    pub stream_command: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            state_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            api_server: "http://127.0.0.1:8001".to_string(),
            agent_selector: "k8s-app=tracemesh".to_string(),
            stream_command: "tracemesh-agent receive-stream --tracer-id".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from defaults overridden by the environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ns) = env_string("TRACEMESH_NAMESPACE") {
            config.namespace = ns;
        }
        if let Some(ms) = env_u64("TRACEMESH_STATE_TIMEOUT_MS") {
            config.state_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("TRACEMESH_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(url) = env_string("TRACEMESH_API_SERVER") {
            config.api_server = url;
        }
        if let Some(selector) = env_string("TRACEMESH_AGENT_SELECTOR") {
            config.agent_selector = selector;
        }
        if let Some(cmd) = env_string("TRACEMESH_STREAM_COMMAND") {
            config.stream_command = cmd;
        }
        config
    }
}

/// Configuration for the per-node tracer runtime
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding pre-built BPF objects (`<program>.o`)
    pub bpf_object_dir: PathBuf,
    /// Pages per CPU for the perf event buffers
    pub perf_buffer_pages: usize,
    /// Name of the node this runtime runs on (used for enrichment)
    pub node_name: String,
    /// OTLP collector endpoint; console logging only when unset
    pub otlp_endpoint: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bpf_object_dir: PathBuf::from("target/bpf"),
            perf_buffer_pages: 64,
            node_name: String::new(),
            otlp_endpoint: None,
        }
    }
}

impl NodeConfig {
    /// Build a config from defaults overridden by the environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env_string("TRACEMESH_BPF_DIR") {
            config.bpf_object_dir = PathBuf::from(dir);
        }
        if let Some(pages) = env_u64("TRACEMESH_PERF_PAGES") {
            config.perf_buffer_pages = pages as usize;
        }
        if let Some(node) = env_string("TRACEMESH_NODE_NAME").or_else(|| env_string("NODE_NAME")) {
            config.node_name = node;
        }
        config.otlp_endpoint = env_string("TRACEMESH_OTLP_ENDPOINT");
        config
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring non-numeric environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.namespace, "gadget");
        assert_eq!(config.state_timeout, Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_node_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.perf_buffer_pages, 64);
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_env_u64_rejects_garbage() {
        std::env::set_var("TRACEMESH_TEST_GARBAGE", "soon");
        assert_eq!(env_u64("TRACEMESH_TEST_GARBAGE"), None);
        std::env::set_var("TRACEMESH_TEST_NUMBER", "250");
        assert_eq!(env_u64("TRACEMESH_TEST_NUMBER"), Some(250));
    }
}

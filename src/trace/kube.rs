//! Cluster adapters
//!
//! [`KubeProxyClient`] talks REST to the API server through an already
//! authenticated local proxy (`kubectl proxy`). [`KubectlExec`] reaches the
//! node agents with `kubectl exec`.

use std::process::Stdio;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::client::{ClientError, ControlPlane, NodeExec};
use super::resource::{ObjectMeta, Trace, TraceList, API_VERSION};
use super::stream::{NodeOutput, OutputStream};

#[derive(Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<NodeItem>,
}

#[derive(Deserialize)]
struct NodeItem {
    #[serde(default)]
    metadata: ObjectMeta,
}

/// REST client for Trace objects and nodes
#[derive(Clone)]
pub struct KubeProxyClient {
    base_url: String,
    client: reqwest::Client,
}

impl KubeProxyClient {
    /// # Arguments
    /// * `base_url` - Proxy address (e.g., "http://127.0.0.1:8001")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn traces_url(&self, namespace: &str) -> String {
        format!(
            "{}/apis/{}/namespaces/{}/traces",
            self.base_url, API_VERSION, namespace
        )
    }

    /// Map non-2xx responses to `ClientError::Api` with the server's message
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["message"].as_str().map(str::to_string))
            .unwrap_or(body);
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ControlPlane for KubeProxyClient {
    async fn list_nodes(&self) -> Result<Vec<String>, ClientError> {
        let url = format!("{}/api/v1/nodes", self.base_url);
        let response = Self::check(self.client.get(&url).send().await?).await?;
        let nodes: NodeList = response.json().await?;
        Ok(nodes.items.into_iter().map(|n| n.metadata.name).collect())
    }

    async fn create_trace(&self, trace: &Trace) -> Result<Trace, ClientError> {
        let url = self.traces_url(&trace.metadata.namespace);
        let response = Self::check(self.client.post(&url).json(trace).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn list_traces(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Trace>, ClientError> {
        let response = self
            .client
            .get(self.traces_url(namespace))
            .query(&[("labelSelector", selector)])
            .send()
            .await?;
        let list: TraceList = Self::check(response).await?.json().await?;
        Ok(list.items)
    }

    async fn patch_trace(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ClientError> {
        let url = format!("{}/{}", self.traces_url(namespace), name);
        let response = self
            .client
            .patch(&url)
            .header(CONTENT_TYPE, "application/merge-patch+json")
            .body(patch.to_string())
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_traces(&self, namespace: &str, selector: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .delete(self.traces_url(namespace))
            .query(&[("labelSelector", selector)])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Node exec through `kubectl exec` into the agent pod of a node
pub struct KubectlExec {
    kubectl: String,
    namespace: String,
    agent_selector: String,
}

impl KubectlExec {
    pub fn new(namespace: impl Into<String>, agent_selector: impl Into<String>) -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            namespace: namespace.into(),
            agent_selector: agent_selector.into(),
        }
    }

    async fn agent_pod(&self, node: &str) -> Result<String, ClientError> {
        let output = Command::new(&self.kubectl)
            .args(["get", "pods", "-n", &self.namespace, "-l", &self.agent_selector])
            .arg(format!("--field-selector=spec.nodeName={}", node))
            .args(["-o", "jsonpath={.items[0].metadata.name}"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(ClientError::Exec(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let pod = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if pod.is_empty() {
            return Err(ClientError::Exec(format!("no agent pod on node {}", node)));
        }
        Ok(pod)
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    output: &NodeOutput,
    stream: OutputStream,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        match stream {
            OutputStream::Stdout => output.stdout(line),
            OutputStream::Stderr => output.stderr(line),
        }
    }
    Ok(())
}

#[async_trait]
impl NodeExec for KubectlExec {
    async fn exec(
        &self,
        node: &str,
        command: &str,
        output: NodeOutput,
    ) -> Result<(), ClientError> {
        let pod = self.agent_pod(node).await?;
        debug!(node, pod = %pod, command, "exec in agent");

        let mut child = Command::new(&self.kubectl)
            .args(["exec", "-n", &self.namespace, &pod, "--", "sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Exec("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClientError::Exec("stderr not captured".into()))?;

        let (out, err) = tokio::join!(
            forward_lines(stdout, &output, OutputStream::Stdout),
            forward_lines(stderr, &output, OutputStream::Stderr),
        );
        out?;
        err?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(ClientError::Exec(format!("command exited with {}", status)));
        }
        Ok(())
    }
}

//! Trace resource model
//!
//! One [`Trace`] object per target node; all copies of one request share the
//! [`GLOBAL_TRACE_ID`] label. Status fields are written by the node agent
//! only, and state strings are opaque tokens compared for equality.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// API group/version of the Trace kind
pub const API_VERSION: &str = "tracemesh.io/v1alpha1";

pub const KIND: &str = "Trace";

/// Annotation carrying the operation directive for the node agent
pub const OPERATION_ANNOTATION: &str = "tracemesh.io/operation";

/// Label shared by every copy of one request
pub const GLOBAL_TRACE_ID: &str = "global-trace-id";

/// Length of generated trace ids
pub const TRACE_ID_LEN: usize = 16;

pub const LABEL_GADGET: &str = "gadgetName";
pub const LABEL_NODE: &str = "nodeName";
pub const LABEL_NAMESPACE: &str = "namespace";
pub const LABEL_POD: &str = "podName";
pub const LABEL_CONTAINER: &str = "containerName";
pub const LABEL_OUTPUT_MODE: &str = "outputMode";

/// Where a trace sends its results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputMode {
    /// Results are written into the status when the state changes
    #[default]
    Status,
    /// Events are streamed as they arrive
    Stream,
    /// Results go to a file on the node
    File,
    /// Results go to another resource (e.g. a generated policy)
    ExternalResource,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Status => "Status",
            OutputMode::Stream => "Stream",
            OutputMode::File => "File",
            OutputMode::ExternalResource => "ExternalResource",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Status" => Ok(OutputMode::Status),
            "Stream" => Ok(OutputMode::Stream),
            "File" => Ok(OutputMode::File),
            "ExternalResource" => Ok(OutputMode::ExternalResource),
            other => Err(format!("unknown output mode {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Which containers a trace applies to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFilter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub podname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpec {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub gadget: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ContainerFilter>,
    #[serde(default)]
    pub run_mode: String,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Observed per-node status, written by the node agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation_error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation_warning: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TraceSpec,
    #[serde(default)]
    pub status: TraceStatus,
}

impl Trace {
    /// Shared request id, empty if the label is missing
    pub fn trace_id(&self) -> &str {
        self.metadata
            .labels
            .get(GLOBAL_TRACE_ID)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Id under which the node agent registers this copy's tracer
    pub fn tracer_id(&self) -> String {
        format!("trace_{}_{}", self.metadata.namespace, self.metadata.name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceList {
    #[serde(default)]
    pub items: Vec<Trace>,
}

/// Fresh 16-character alphanumeric trace id
pub fn random_trace_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TRACE_ID_LEN)
        .map(char::from)
        .collect()
}

/// Selector matching every copy of one request
pub fn trace_id_selector(trace_id: &str) -> String {
    format!("{}={}", GLOBAL_TRACE_ID, trace_id)
}

/// Comma-joined selector over the non-empty labels, in key order
pub fn labels_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Check a `k=v,k2=v2` selector against a label set
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

//! Trace orchestrator
//!
//! Creates one copy of a trace per target node, waits for the copies to
//! converge, drives their operation and deletes them again.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::client::{ControlPlane, NodeExec};
use super::feedback::Console;
use super::resource::{
    self, ContainerFilter, ObjectMeta, OutputMode, Trace, TraceSpec, GLOBAL_TRACE_ID,
    LABEL_CONTAINER, LABEL_GADGET, LABEL_NAMESPACE, LABEL_NODE, LABEL_OUTPUT_MODE, LABEL_POD,
    OPERATION_ANNOTATION,
};
use super::signals::{interrupted, InterruptState};
use super::stream::{LineTransform, StreamAggregator};
use super::{OutputFormat, TraceConfig, TraceError};
use crate::config::OrchestratorConfig;
use crate::ebpf::GadgetParams;
use crate::metrics;

/// One row of the trace listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSummary {
    pub trace_id: String,
    pub namespace: String,
    /// Sorted node names
    pub nodes: Vec<String>,
    pub pod: String,
    pub container: String,
}

pub struct TraceOrchestrator {
    client: Arc<dyn ControlPlane>,
    exec: Arc<dyn NodeExec>,
    config: OrchestratorConfig,
    console: Console,
    interrupts: Arc<InterruptState>,
}

/// Outcome of one convergence round
#[derive(Default)]
struct Round {
    converged: usize,
    errors: BTreeMap<String, String>,
    warnings: BTreeMap<String, String>,
}

impl TraceOrchestrator {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        exec: Arc<dyn NodeExec>,
        config: OrchestratorConfig,
        console: Console,
        interrupts: Arc<InterruptState>,
    ) -> Self {
        Self {
            client,
            exec,
            config,
            console,
            interrupts,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Create the copies of a new trace and return its id.
    ///
    /// On any failure every copy created so far is deleted again.
    pub async fn create_trace(&self, config: &TraceConfig) -> Result<String, TraceError> {
        let trace_id = resource::random_trace_id();
        self.create_with_id(&trace_id, config).await?;
        Ok(trace_id)
    }

    async fn create_with_id(&self, trace_id: &str, config: &TraceConfig) -> Result<(), TraceError> {
        // Reject bad parameters here rather than as one error per node
        GadgetParams::from_pairs(
            config
                .parameters
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
        .map_err(|e| TraceError::InvalidConfig(e.to_string()))?;

        let mut trace = self.build_trace(trace_id, config);
        let nodes = self.target_nodes(&config.flags.node).await?;

        for node in nodes {
            trace.spec.node = node.clone();
            match self.client.create_trace(&trace).await {
                Ok(created) => {
                    metrics::TRACE_COPIES_CREATED.inc();
                    debug!(trace_id, node = %node, name = %created.metadata.name, "trace copy created");
                }
                Err(source) => {
                    warn!(trace_id, node = %node, error = %source, "create failed, rolling back");
                    metrics::TRACE_ROLLBACKS.inc();
                    self.delete_trace(trace_id).await;
                    return Err(TraceError::Create { node, source });
                }
            }
        }

        if !config.initial_state.is_empty() {
            if let Err(e) = self.wait_for_state(trace_id, &config.initial_state).await {
                metrics::TRACE_ROLLBACKS.inc();
                self.delete_trace(trace_id).await;
                return Err(e);
            }
        }

        crate::trace_log!(info, trace_id, gadget = %config.gadget, "trace created");
        Ok(())
    }

    async fn target_nodes(&self, explicit: &str) -> Result<Vec<String>, TraceError> {
        let nodes = self
            .client
            .list_nodes()
            .await
            .map_err(TraceError::ListNodes)?;
        if !explicit.is_empty() {
            return if nodes.iter().any(|n| n == explicit) {
                Ok(vec![explicit.to_string()])
            } else {
                Err(TraceError::NodeNotFound(explicit.to_string()))
            };
        }
        if nodes.is_empty() {
            return Err(TraceError::InvalidConfig("cluster has no nodes".into()));
        }
        Ok(nodes)
    }

    fn build_trace(&self, trace_id: &str, config: &TraceConfig) -> Trace {
        let flags = &config.flags;

        // Omit the filter entirely when nothing is filtered
        let filter = if flags.namespace.is_empty()
            && flags.podname.is_empty()
            && flags.containername.is_empty()
            && flags.labels.is_empty()
        {
            None
        } else {
            Some(ContainerFilter {
                namespace: flags.namespace.clone(),
                podname: flags.podname.clone(),
                container_name: flags.containername.clone(),
                labels: flags.labels.clone(),
            })
        };

        // The output target is never a label: it may contain '/'
        let labels = BTreeMap::from([
            (GLOBAL_TRACE_ID.to_string(), trace_id.to_string()),
            (LABEL_GADGET.to_string(), config.gadget.clone()),
            (LABEL_NODE.to_string(), flags.node.clone()),
            (LABEL_NAMESPACE.to_string(), flags.namespace.clone()),
            (LABEL_POD.to_string(), flags.podname.clone()),
            (LABEL_CONTAINER.to_string(), flags.containername.clone()),
            (LABEL_OUTPUT_MODE.to_string(), config.output_mode.to_string()),
        ]);

        Trace {
            api_version: resource::API_VERSION.to_string(),
            kind: resource::KIND.to_string(),
            metadata: ObjectMeta {
                generate_name: format!("{}-", config.gadget),
                namespace: self.config.namespace.clone(),
                labels,
                annotations: BTreeMap::from([(
                    OPERATION_ANNOTATION.to_string(),
                    config.operation.clone(),
                )]),
                ..Default::default()
            },
            spec: TraceSpec {
                node: flags.node.clone(),
                gadget: config.gadget.clone(),
                filter,
                run_mode: "Manual".to_string(),
                output_mode: config.output_mode,
                output: config.output.clone(),
                parameters: config.parameters.clone(),
            },
            status: Default::default(),
        }
    }

    async fn traces_by_id(&self, trace_id: &str) -> Result<Vec<Trace>, TraceError> {
        let traces = self
            .client
            .list_traces(&self.config.namespace, &resource::trace_id_selector(trace_id))
            .await
            .map_err(TraceError::List)?;
        if traces.is_empty() {
            return Err(TraceError::NotFound(trace_id.to_string()));
        }
        Ok(traces)
    }

    /// Poll the copies of a trace until they settle on `expected`.
    ///
    /// Succeeds when at least one copy converged. Node errors are always
    /// printed; warnings only when nothing converged. Never deletes anything.
    pub async fn wait_for_state(
        &self,
        trace_id: &str,
        expected: &str,
    ) -> Result<Vec<Trace>, TraceError> {
        let started = Instant::now();
        let timeout = self.config.state_timeout;

        loop {
            let timed_out = started.elapsed() > timeout;
            let traces = self.traces_by_id(trace_id).await?;

            let mut round = Round::default();
            let mut pending = false;
            for trace in &traces {
                let node = trace.spec.node.clone();
                let status = &trace.status;
                if !status.operation_error.is_empty() {
                    round.errors.insert(node, status.operation_error.clone());
                } else if !status.operation_warning.is_empty() {
                    round.warnings.insert(node, status.operation_warning.clone());
                } else if status.state == expected {
                    round.converged += 1;
                } else if timed_out {
                    round.errors.insert(
                        node,
                        format!("No results received from trace within {:?}", timeout),
                    );
                } else {
                    pending = true;
                    break;
                }
            }

            if pending {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            metrics::CONVERGENCE_DURATION.observe(started.elapsed().as_secs_f64());
            metrics::NODE_ERRORS.inc_by(round.errors.len() as f64);
            metrics::NODE_WARNINGS.inc_by(round.warnings.len() as f64);
            debug!(
                trace_id,
                converged = round.converged,
                errors = round.errors.len(),
                warnings = round.warnings.len(),
                "convergence round settled"
            );

            if round.converged == 0 {
                self.console.node_feedback(&round.warnings, traces.len());
                self.console.node_feedback(&round.errors, traces.len());
                return Err(TraceError::NoneSucceeded);
            }
            self.console.node_feedback(&round.errors, traces.len());
            return Ok(traces);
        }
    }

    /// Patch the operation annotation of every copy.
    ///
    /// Every copy is attempted; failures are combined into one error.
    pub async fn set_operation(&self, trace_id: &str, operation: &str) -> Result<(), TraceError> {
        let traces = self.traces_by_id(trace_id).await?;
        let patch = json!({ "metadata": { "annotations": { OPERATION_ANNOTATION: operation } } });

        let mut failures = Vec::new();
        for trace in &traces {
            if let Err(e) = self
                .client
                .patch_trace(&trace.metadata.namespace, &trace.metadata.name, &patch)
                .await
            {
                failures.push(format!("{}: {}", trace.metadata.name, e));
            }
        }

        if failures.is_empty() {
            crate::trace_log!(info, trace_id, operation, copies = traces.len(), "operation set");
            Ok(())
        } else {
            Err(TraceError::Operation {
                trace_id: trace_id.to_string(),
                failures,
            })
        }
    }

    /// Delete every copy of a trace; failures are printed, never returned.
    pub async fn delete_trace(&self, trace_id: &str) {
        let selector = resource::trace_id_selector(trace_id);
        match self
            .client
            .delete_traces(&self.config.namespace, &selector)
            .await
        {
            Ok(()) => debug!(trace_id, "trace deleted"),
            Err(e) => {
                warn!(trace_id, error = %e, "failed to delete trace");
                self.console.err_line(&format!("Error deleting traces: {}", e));
            }
        }
    }

    /// Traces matching the descriptive labels of `config` (empty values ignored)
    pub async fn find_traces(&self, config: &TraceConfig) -> Result<Vec<Trace>, TraceError> {
        let labels = BTreeMap::from([
            (LABEL_GADGET.to_string(), config.gadget.clone()),
            (LABEL_NODE.to_string(), config.flags.node.clone()),
            (LABEL_NAMESPACE.to_string(), config.flags.namespace.clone()),
            (LABEL_POD.to_string(), config.flags.podname.clone()),
            (LABEL_CONTAINER.to_string(), config.flags.containername.clone()),
        ]);
        self.client
            .list_traces(&self.config.namespace, &resource::labels_selector(&labels))
            .await
            .map_err(TraceError::List)
    }

    /// One summary per trace id, ordered by id
    pub async fn list_traces(&self, config: &TraceConfig) -> Result<Vec<TraceSummary>, TraceError> {
        Ok(summarize(&self.find_traces(config).await?))
    }

    pub async fn traces_by_gadget(&self, gadget: &str) -> Result<Vec<Trace>, TraceError> {
        let selector = format!("{}={}", LABEL_GADGET, gadget);
        self.client
            .list_traces(&self.config.namespace, &selector)
            .await
            .map_err(TraceError::List)
    }

    /// Delete every trace of a program, whatever its id
    pub async fn delete_traces_by_gadget(&self, gadget: &str) -> Result<(), TraceError> {
        let selector = format!("{}={}", LABEL_GADGET, gadget);
        self.client
            .delete_traces(&self.config.namespace, &selector)
            .await
            .map_err(TraceError::Delete)
    }

    /// Create a streaming trace, print its output and delete it.
    pub async fn run_and_stream(
        &self,
        config: &TraceConfig,
        transform: LineTransform,
    ) -> Result<(), TraceError> {
        if config.output_mode != OutputMode::Stream {
            return Err(TraceError::InvalidConfig(
                "output mode must be Stream, use run_and_await_status otherwise".into(),
            ));
        }

        let trace_id = resource::random_trace_id();
        self.interrupts.arm(&trace_id);
        let mut cancel = self.interrupts.subscribe();

        let result = match until_interrupted(&mut cancel, self.create_and_wait(&trace_id, config)).await {
            None => Err(TraceError::Interrupted),
            Some(Err(e)) => Err(e),
            Some(Ok(traces)) => {
                StreamAggregator::new(
                    Arc::clone(&self.exec),
                    self.console.clone(),
                    self.config.stream_command.clone(),
                    transform,
                )
                .node_filter(Some(config.flags.node.clone()))
                .json(config.flags.output_format == OutputFormat::Json)
                .run(&traces, cancel)
                .await
            }
        };

        self.delete_trace(&trace_id).await;
        self.interrupts.disarm();
        result
    }

    /// Create a status-mode trace, hand the settled copies to `handler`
    /// and delete it.
    pub async fn run_and_await_status<F>(
        &self,
        config: &TraceConfig,
        handler: F,
    ) -> Result<(), TraceError>
    where
        F: FnOnce(&[Trace]) -> Result<(), TraceError>,
    {
        if config.output_mode == OutputMode::Stream {
            return Err(TraceError::InvalidConfig(
                "output mode must not be Stream, use run_and_stream otherwise".into(),
            ));
        }

        let trace_id = resource::random_trace_id();
        self.interrupts.arm(&trace_id);
        let mut cancel = self.interrupts.subscribe();

        let result = match until_interrupted(&mut cancel, self.create_and_wait(&trace_id, config)).await {
            None => Err(TraceError::Interrupted),
            Some(Err(e)) => Err(e),
            Some(Ok(traces)) => handler(&traces),
        };

        self.delete_trace(&trace_id).await;
        self.interrupts.disarm();
        result
    }

    async fn create_and_wait(
        &self,
        trace_id: &str,
        config: &TraceConfig,
    ) -> Result<Vec<Trace>, TraceError> {
        self.create_with_id(trace_id, config).await?;
        self.wait_for_state(trace_id, &config.output_state).await
    }
}

/// Run `fut` unless an interrupt arrives first.
async fn until_interrupted<T>(
    cancel: &mut watch::Receiver<usize>,
    fut: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = interrupted(cancel) => None,
        out = fut => Some(out),
    }
}

/// Group copies by trace id
pub fn summarize(traces: &[Trace]) -> Vec<TraceSummary> {
    let mut by_id: BTreeMap<String, TraceSummary> = BTreeMap::new();
    for trace in traces {
        let id = trace.trace_id();
        if id.is_empty() {
            continue;
        }
        let node = trace.spec.node.clone();
        match by_id.get_mut(id) {
            Some(summary) => {
                if !node.is_empty() {
                    summary.nodes.push(node);
                }
            }
            None => {
                let filter = trace.spec.filter.clone().unwrap_or_default();
                by_id.insert(
                    id.to_string(),
                    TraceSummary {
                        trace_id: id.to_string(),
                        namespace: filter.namespace,
                        nodes: if node.is_empty() { Vec::new() } else { vec![node] },
                        pod: filter.podname,
                        container: filter.container_name,
                    },
                );
            }
        }
    }
    by_id
        .into_values()
        .map(|mut s| {
            s.nodes.sort();
            s
        })
        .collect()
}

/// Render summaries as an aligned table
pub fn render_trace_table(summaries: &[TraceSummary]) -> String {
    let mut rows = vec![[
        "NAMESPACE".to_string(),
        "NODE(S)".to_string(),
        "POD".to_string(),
        "CONTAINER".to_string(),
        "TRACEID".to_string(),
    ]];
    for s in summaries {
        rows.push([
            s.namespace.clone(),
            s.nodes.join(","),
            s.pod.clone(),
            s.container.clone(),
            s.trace_id.clone(),
        ]);
    }

    let mut widths = [0usize; 5];
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    for row in &rows {
        let last = row.len() - 1;
        for (i, cell) in row.iter().enumerate() {
            if i == last {
                out.push_str(cell);
            } else {
                out.push_str(&format!("{:<width$}", cell, width = widths[i] + 4));
            }
        }
        out.push('\n');
    }
    out
}

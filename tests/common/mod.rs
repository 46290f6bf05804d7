//! Shared fakes for integration tests: a simulated cluster, scripted node
//! exec and an in-memory probe backend.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use tracemesh::config::OrchestratorConfig;
use tracemesh::ebpf::reader::{self, RecordSender};
use tracemesh::ebpf::{EventReader, HookPoint, LinkId, ProbeBackend, ProgramSpec, ReaderCloser};
use tracemesh::trace::resource::{selector_matches, Trace, OPERATION_ANNOTATION};
use tracemesh::trace::{
    CapturedOutput, ClientError, Console, ControlPlane, InterruptState, NodeExec, NodeOutput,
    TraceOrchestrator,
};
use tracemesh::TracerError;

// ─────────────────────────────────────────────────────────────────────────────
// Simulated cluster
// ─────────────────────────────────────────────────────────────────────────────

/// How the agent on a node reacts to a new trace copy
#[derive(Debug, Clone)]
pub enum NodeBehavior {
    Converge(&'static str),
    Fail(&'static str),
    Warn(&'static str),
    Silent,
    /// Report no state until the delay has passed, then this state
    After(Duration, &'static str),
}

pub struct SimulatedCluster {
    nodes: Vec<String>,
    behaviors: Mutex<HashMap<String, NodeBehavior>>,
    reject_create_on: Mutex<Option<String>>,
    reject_patch_on: Mutex<Option<String>>,
    traces: Mutex<Vec<Trace>>,
    /// Copy name → when its delayed state becomes visible
    delayed: Mutex<HashMap<String, (Instant, &'static str)>>,
    names: AtomicUsize,
    deletes: AtomicUsize,
}

impl SimulatedCluster {
    pub fn new(nodes: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            behaviors: Mutex::new(HashMap::new()),
            reject_create_on: Mutex::new(None),
            reject_patch_on: Mutex::new(None),
            traces: Mutex::new(Vec::new()),
            delayed: Mutex::new(HashMap::new()),
            names: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        })
    }

    pub fn set_behavior(&self, node: &str, behavior: NodeBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(node.to_string(), behavior);
    }

    pub fn reject_create_on(&self, node: &str) {
        *self.reject_create_on.lock().unwrap() = Some(node.to_string());
    }

    pub fn reject_patch_on(&self, node: &str) {
        *self.reject_patch_on.lock().unwrap() = Some(node.to_string());
    }

    pub fn traces(&self) -> Vec<Trace> {
        self.traces.lock().unwrap().clone()
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for SimulatedCluster {
    async fn list_nodes(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.nodes.clone())
    }

    async fn create_trace(&self, trace: &Trace) -> Result<Trace, ClientError> {
        if self.reject_create_on.lock().unwrap().as_deref() == Some(trace.spec.node.as_str()) {
            return Err(ClientError::Api {
                status: 500,
                message: "admission webhook denied the request".into(),
            });
        }

        let mut created = trace.clone();
        let n = self.names.fetch_add(1, Ordering::SeqCst);
        created.metadata.name = format!("{}{:05}", trace.metadata.generate_name, n);

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&trace.spec.node)
            .cloned()
            .unwrap_or(NodeBehavior::Converge("Started"));
        match behavior {
            NodeBehavior::Converge(state) => created.status.state = state.to_string(),
            NodeBehavior::Fail(msg) => created.status.operation_error = msg.to_string(),
            NodeBehavior::Warn(msg) => created.status.operation_warning = msg.to_string(),
            NodeBehavior::Silent => {}
            NodeBehavior::After(delay, state) => {
                self.delayed
                    .lock()
                    .unwrap()
                    .insert(created.metadata.name.clone(), (Instant::now() + delay, state));
            }
        }

        self.traces.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn list_traces(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Trace>, ClientError> {
        let mut traces = self.traces.lock().unwrap();
        let mut delayed = self.delayed.lock().unwrap();
        let now = Instant::now();
        for trace in traces.iter_mut() {
            if let Some((at, state)) = delayed.get(&trace.metadata.name).copied() {
                if now >= at {
                    trace.status.state = state.to_string();
                    delayed.remove(&trace.metadata.name);
                }
            }
        }

        Ok(traces
            .iter()
            .filter(|t| t.metadata.namespace == namespace)
            .filter(|t| selector_matches(selector, &t.metadata.labels))
            .cloned()
            .collect())
    }

    async fn patch_trace(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ClientError> {
        let mut traces = self.traces.lock().unwrap();
        let trace = traces
            .iter_mut()
            .find(|t| t.metadata.namespace == namespace && t.metadata.name == name)
            .ok_or_else(|| ClientError::Api {
                status: 404,
                message: format!("traces {:?} not found", name),
            })?;
        if self.reject_patch_on.lock().unwrap().as_deref() == Some(trace.spec.node.as_str()) {
            return Err(ClientError::Api {
                status: 409,
                message: "conflict".into(),
            });
        }
        if let Some(op) = patch["metadata"]["annotations"][OPERATION_ANNOTATION].as_str() {
            trace
                .metadata
                .annotations
                .insert(OPERATION_ANNOTATION.to_string(), op.to_string());
        }
        Ok(())
    }

    async fn delete_traces(&self, namespace: &str, selector: &str) -> Result<(), ClientError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.traces.lock().unwrap().retain(|t| {
            !(t.metadata.namespace == namespace && selector_matches(selector, &t.metadata.labels))
        });
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted node exec
// ─────────────────────────────────────────────────────────────────────────────

/// What the remote command on a node does
#[derive(Debug, Clone)]
pub enum Script {
    Complete(Vec<&'static str>),
    Fail(Vec<&'static str>, &'static str),
    /// Print the lines, then never exit
    Hang(Vec<&'static str>),
}

#[derive(Default)]
pub struct ScriptedExec {
    scripts: HashMap<String, Script>,
    commands: Mutex<Vec<(String, String)>>,
}

impl ScriptedExec {
    pub fn new(scripts: &[(&str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .iter()
                .map(|(node, script)| (node.to_string(), script.clone()))
                .collect(),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeExec for ScriptedExec {
    async fn exec(
        &self,
        node: &str,
        command: &str,
        output: NodeOutput,
    ) -> Result<(), ClientError> {
        self.commands
            .lock()
            .unwrap()
            .push((node.to_string(), command.to_string()));

        match self.scripts.get(node).cloned() {
            None => Ok(()),
            Some(Script::Complete(lines)) => {
                lines.into_iter().for_each(|l| output.stdout(l));
                Ok(())
            }
            Some(Script::Fail(lines, error)) => {
                lines.into_iter().for_each(|l| output.stdout(l));
                Err(ClientError::Exec(error.to_string()))
            }
            Some(Script::Hang(lines)) => {
                lines.into_iter().for_each(|l| output.stdout(l));
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// Orchestrator over fakes with short timeouts and a captured console
pub fn orchestrator(
    cluster: Arc<SimulatedCluster>,
    exec: Arc<ScriptedExec>,
) -> (TraceOrchestrator, CapturedOutput, Arc<InterruptState>) {
    let config = OrchestratorConfig {
        state_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let (console, captured) = Console::capture();
    let interrupts = InterruptState::new();
    let orchestrator =
        TraceOrchestrator::new(cluster, exec, config, console, Arc::clone(&interrupts));
    (orchestrator, captured, interrupts)
}

/// Poll `cond` every few milliseconds for up to two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory probe backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct BackendLog {
    pub loads: usize,
    pub unloads: usize,
    pub attached: Vec<HookPoint>,
    pub live: Vec<LinkId>,
    pub sender: Option<RecordSender>,
}

/// Backend recording every call; the test pushes records through `sender()`
#[derive(Clone, Default)]
pub struct FakeBackend {
    log: Arc<Mutex<BackendLog>>,
    fail_attach_at: Option<usize>,
    fail_open: bool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the attach with this zero-based index
    pub fn failing_attach_at(index: usize) -> Self {
        Self {
            fail_attach_at: Some(index),
            ..Self::default()
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn live_links(&self) -> usize {
        self.log.lock().unwrap().live.len()
    }

    pub fn attach_calls(&self) -> usize {
        self.log.lock().unwrap().attached.len()
    }

    pub fn unloads(&self) -> usize {
        self.log.lock().unwrap().unloads
    }

    pub fn sender(&self) -> RecordSender {
        self.log
            .lock()
            .unwrap()
            .sender
            .clone()
            .expect("reader not opened")
    }
}

impl ProbeBackend for FakeBackend {
    fn load(&mut self, _spec: &ProgramSpec) -> Result<(), TracerError> {
        self.log.lock().unwrap().loads += 1;
        Ok(())
    }

    fn attach(&mut self, hook: &HookPoint) -> Result<LinkId, TracerError> {
        let mut log = self.log.lock().unwrap();
        let index = log.attached.len();
        log.attached.push(*hook);
        if Some(index) == self.fail_attach_at {
            return Err(TracerError::Attach {
                hook: hook.to_string(),
                reason: "no such kernel function".into(),
            });
        }
        let link = LinkId(index as u64);
        log.live.push(link);
        Ok(link)
    }

    fn detach(&mut self, link: LinkId) -> Result<(), TracerError> {
        self.log.lock().unwrap().live.retain(|l| *l != link);
        Ok(())
    }

    fn open_reader(&mut self, _map: &str) -> Result<(EventReader, ReaderCloser), TracerError> {
        if self.fail_open {
            return Err(TracerError::Reader("events map not found".into()));
        }
        let (tx, reader, closer) = reader::channel(64);
        self.log.lock().unwrap().sender = Some(tx);
        Ok((reader, closer))
    }

    fn unload(&mut self) {
        self.log.lock().unwrap().unloads += 1;
    }
}

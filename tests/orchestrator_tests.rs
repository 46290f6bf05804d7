//! Orchestrator tests against a simulated cluster
//!
//! The simulated cluster applies each node's status at creation time, so a
//! convergence round settles on the first poll unless a node stays silent.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use common::{eventually, orchestrator, NodeBehavior, Script, ScriptedExec, SimulatedCluster};
use tracemesh::trace::resource::{
    OutputMode, GLOBAL_TRACE_ID, LABEL_GADGET, OPERATION_ANNOTATION, TRACE_ID_LEN,
};
use tracemesh::trace::{ClientError, InterruptAction, TraceConfig, TraceError};

fn status_config(gadget: &str) -> TraceConfig {
    TraceConfig {
        gadget: gadget.to_string(),
        operation: "start".to_string(),
        output_mode: OutputMode::Status,
        output_state: "Started".to_string(),
        ..Default::default()
    }
}

fn stderr_lines(stderr: &str) -> Vec<&str> {
    stderr.lines().filter(|l| !l.is_empty()).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Creation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_makes_one_copy_per_node() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2", "node-3"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = assert_ok!(orch.create_trace(&status_config("tcpconnect")).await);
    assert_eq!(trace_id.len(), TRACE_ID_LEN);

    let traces = cluster.traces();
    assert_eq!(traces.len(), 3);
    let mut nodes: Vec<_> = traces.iter().map(|t| t.spec.node.as_str()).collect();
    nodes.sort();
    assert_eq!(nodes, vec!["node-1", "node-2", "node-3"]);
    for trace in &traces {
        assert_eq!(trace.metadata.labels[GLOBAL_TRACE_ID], trace_id);
        assert_eq!(trace.metadata.labels[LABEL_GADGET], "tcpconnect");
        assert_eq!(trace.metadata.annotations[OPERATION_ANNOTATION], "start");
        assert_eq!(trace.spec.run_mode, "Manual");
        assert!(trace.spec.filter.is_none());
        assert!(trace.metadata.name.starts_with("tcpconnect-"));
    }
}

#[tokio::test]
async fn test_create_rolls_back_when_a_node_rejects() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2", "node-3"]);
    cluster.reject_create_on("node-3");
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let err = orch.create_trace(&status_config("tcpconnect")).await.unwrap_err();
    match err {
        TraceError::Create { node, source } => {
            assert_eq!(node, "node-3");
            assert!(matches!(source, ClientError::Api { status: 500, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(cluster.traces().is_empty());
    assert_eq!(cluster.delete_calls(), 1);
}

#[tokio::test]
async fn test_create_on_explicit_node() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let mut config = status_config("capabilities");
    config.flags.node = "node-2".to_string();
    config.flags.namespace = "shop".to_string();
    assert_ok!(orch.create_trace(&config).await);

    let traces = cluster.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].spec.node, "node-2");
    let filter = traces[0].spec.filter.as_ref().expect("filter set");
    assert_eq!(filter.namespace, "shop");
}

#[tokio::test]
async fn test_create_on_unknown_node_fails() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let mut config = status_config("tcpconnect");
    config.flags.node = "node-9".to_string();
    let err = orch.create_trace(&config).await.unwrap_err();
    assert!(matches!(err, TraceError::NodeNotFound(node) if node == "node-9"));
    assert!(cluster.traces().is_empty());
}

#[tokio::test]
async fn test_create_on_empty_cluster_fails() {
    let cluster = SimulatedCluster::new(&[]);
    let (orch, _out, _) = orchestrator(cluster, ScriptedExec::new(&[]));
    let err = orch.create_trace(&status_config("tcpconnect")).await.unwrap_err();
    assert!(matches!(err, TraceError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_create_rejects_bad_parameters_before_creating() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    for (key, value) in [("latency", "maybe"), ("color", "blue")] {
        let mut config = TraceConfig::stream("tcpconnect");
        config.parameters.insert(key.to_string(), value.to_string());

        let transform = Arc::new(|line: &str| line.to_string());
        let err = orch.run_and_stream(&config, transform).await.unwrap_err();
        assert!(matches!(err, TraceError::InvalidConfig(_)), "{key}={value}: {err}");
    }
    assert!(cluster.traces().is_empty());
}

#[tokio::test]
async fn test_create_forwards_valid_parameters() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let mut config = status_config("tcpconnect");
    config.parameters.insert("latency".to_string(), "true".to_string());
    config.parameters.insert("min-latency-ms".to_string(), "5".to_string());
    assert_ok!(orch.create_trace(&config).await);

    let traces = cluster.traces();
    assert_eq!(traces[0].spec.parameters["latency"], "true");
    assert_eq!(traces[0].spec.parameters["min-latency-ms"], "5");
}

#[tokio::test]
async fn test_create_with_initial_state_reports_failing_node() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2", "node-3"]);
    cluster.set_behavior("node-2", NodeBehavior::Fail("program not found"));
    let (orch, out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let mut config = status_config("tcpconnect");
    config.initial_state = "Started".to_string();
    assert_ok!(orch.create_trace(&config).await);

    let stderr = out.stderr();
    let lines = stderr_lines(&stderr);
    assert_eq!(lines.len(), 1, "stderr: {stderr}");
    assert!(lines[0].contains("\"node-2\""));
    assert!(lines[0].contains("program not found"));
    assert_eq!(cluster.traces().len(), 3);
}

#[tokio::test]
async fn test_create_with_initial_state_deletes_when_nothing_converges() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    cluster.set_behavior("node-1", NodeBehavior::Fail("kernel too old"));
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let mut config = status_config("tcpconnect");
    config.initial_state = "Started".to_string();
    let err = orch.create_trace(&config).await.unwrap_err();
    assert!(matches!(err, TraceError::NoneSucceeded));
    assert!(cluster.traces().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Convergence
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_wait_partial_success() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    cluster.set_behavior("node-1", NodeBehavior::Fail("attach failed"));
    let (orch, out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    let traces = assert_ok!(orch.wait_for_state(&trace_id, "Started").await);
    assert_eq!(traces.len(), 2);
    assert_eq!(
        stderr_lines(&out.stderr()),
        vec!["Failed to run the gadget on node \"node-1\": attach failed"]
    );
}

#[tokio::test]
async fn test_wait_identical_errors_are_reported_once() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2", "node-3"]);
    for node in ["node-1", "node-2", "node-3"] {
        cluster.set_behavior(node, NodeBehavior::Fail("BTF not available"));
    }
    let (orch, out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    let err = orch.wait_for_state(&trace_id, "Started").await.unwrap_err();
    assert!(matches!(err, TraceError::NoneSucceeded));
    assert_eq!(
        err.to_string(),
        "Failed to run the gadget on all nodes: None of them succeeded"
    );
    assert_eq!(
        stderr_lines(&out.stderr()),
        vec!["Failed to run the gadget on all nodes: BTF not available"]
    );
}

#[tokio::test]
async fn test_wait_distinct_errors_are_reported_per_node() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    cluster.set_behavior("node-1", NodeBehavior::Fail("BTF not available"));
    cluster.set_behavior("node-2", NodeBehavior::Fail("map full"));
    let (orch, out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    assert_err!(orch.wait_for_state(&trace_id, "Started").await);

    let stderr = out.stderr();
    let lines = stderr_lines(&stderr);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"node-1\"") && lines[0].contains("BTF not available"));
    assert!(lines[1].contains("\"node-2\"") && lines[1].contains("map full"));
}

#[tokio::test]
async fn test_wait_warnings_hidden_when_something_converged() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    cluster.set_behavior("node-2", NodeBehavior::Warn("no containers matched"));
    let (orch, out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    assert_ok!(orch.wait_for_state(&trace_id, "Started").await);
    assert!(out.stderr().is_empty());
}

#[tokio::test]
async fn test_wait_warnings_shown_when_nothing_converged() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    cluster.set_behavior("node-1", NodeBehavior::Warn("no containers matched"));
    let (orch, out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    assert_err!(orch.wait_for_state(&trace_id, "Started").await);
    assert_eq!(
        stderr_lines(&out.stderr()),
        vec!["Failed to run the gadget on node \"node-1\": no containers matched"]
    );
}

#[tokio::test]
async fn test_wait_times_out_on_silent_node_without_deleting() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    cluster.set_behavior("node-1", NodeBehavior::Silent);
    let (orch, out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    let err = orch.wait_for_state(&trace_id, "Started").await.unwrap_err();
    assert!(matches!(err, TraceError::NoneSucceeded));
    assert!(out
        .stderr()
        .contains("No results received from trace within 200ms"));
    assert_eq!(cluster.delete_calls(), 0);
    assert_eq!(cluster.traces().len(), 1);
}

#[tokio::test]
async fn test_wait_retries_until_pending_copy_converges() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    cluster.set_behavior(
        "node-2",
        NodeBehavior::After(Duration::from_millis(50), "Started"),
    );
    let (orch, out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    let traces = assert_ok!(orch.wait_for_state(&trace_id, "Started").await);
    assert_eq!(traces.len(), 2);
    assert!(traces.iter().all(|t| t.status.state == "Started"));
    assert!(out.stderr().is_empty());
}

#[tokio::test]
async fn test_wait_silent_node_times_out_while_other_converged() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    cluster.set_behavior("node-2", NodeBehavior::Silent);
    let (orch, out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    assert_ok!(orch.wait_for_state(&trace_id, "Started").await);
    assert_eq!(
        stderr_lines(&out.stderr()),
        vec!["Failed to run the gadget on node \"node-2\": No results received from trace within 200ms"]
    );
}

#[tokio::test]
async fn test_wait_unknown_trace_id() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    let (orch, _out, _) = orchestrator(cluster, ScriptedExec::new(&[]));
    let err = orch.wait_for_state("doesnotexist0000", "Started").await.unwrap_err();
    assert!(matches!(err, TraceError::NotFound(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Operations, listing and deletion
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_set_operation_patches_every_copy() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    assert_ok!(orch.set_operation(&trace_id, "stop").await);
    for trace in cluster.traces() {
        assert_eq!(trace.metadata.annotations[OPERATION_ANNOTATION], "stop");
    }
}

#[tokio::test]
async fn test_set_operation_attempts_every_copy_on_failure() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2", "node-3"]);
    cluster.reject_patch_on("node-1");
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let trace_id = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    let err = orch.set_operation(&trace_id, "stop").await.unwrap_err();
    match err {
        TraceError::Operation { failures, .. } => assert_eq!(failures.len(), 1),
        other => panic!("unexpected error: {other}"),
    }

    let stopped = cluster
        .traces()
        .iter()
        .filter(|t| t.metadata.annotations[OPERATION_ANNOTATION] == "stop")
        .count();
    assert_eq!(stopped, 2);
}

#[tokio::test]
async fn test_list_traces_groups_copies_by_id() {
    let cluster = SimulatedCluster::new(&["node-b", "node-a"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let first = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    let second = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    orch.create_trace(&status_config("capabilities")).await.unwrap();

    let summaries = orch.list_traces(&status_config("tcpconnect")).await.unwrap();
    assert_eq!(summaries.len(), 2);
    let mut ids: Vec<_> = summaries.iter().map(|s| s.trace_id.clone()).collect();
    ids.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(ids, expected);
    for summary in &summaries {
        assert_eq!(summary.nodes, vec!["node-a", "node-b"]);
    }
}

#[tokio::test]
async fn test_delete_trace_removes_only_that_id() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let doomed = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    let kept = orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    orch.delete_trace(&doomed).await;

    let remaining = cluster.traces();
    assert_eq!(remaining.len(), 2);
    assert!(remaining
        .iter()
        .all(|t| t.metadata.labels[GLOBAL_TRACE_ID] == kept));
}

#[tokio::test]
async fn test_delete_traces_by_gadget() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    orch.create_trace(&status_config("tcpconnect")).await.unwrap();
    orch.create_trace(&status_config("capabilities")).await.unwrap();
    assert_ok!(orch.delete_traces_by_gadget("tcpconnect").await);

    let remaining = assert_ok!(orch.traces_by_gadget("capabilities").await);
    assert_eq!(remaining.len(), 1);
    assert!(orch.traces_by_gadget("tcpconnect").await.unwrap().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Guarded run sequences
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_modes_are_guarded() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let transform = Arc::new(|line: &str| line.to_string());
    let err = orch
        .run_and_stream(&status_config("tcpconnect"), transform)
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::InvalidConfig(_)));

    let err = orch
        .run_and_await_status(&TraceConfig::stream("tcpconnect"), |_| Ok(()))
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::InvalidConfig(_)));
    assert!(cluster.traces().is_empty());
}

#[tokio::test]
async fn test_run_and_await_status_hands_copies_then_deletes() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    let (orch, _out, interrupts) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let mut seen = BTreeMap::new();
    assert_ok!(
        orch.run_and_await_status(&status_config("capabilities"), |traces| {
            for trace in traces {
                seen.insert(trace.spec.node.clone(), trace.status.state.clone());
            }
            Ok(())
        })
        .await
    );

    assert_eq!(seen.len(), 2);
    assert!(seen.values().all(|state| state == "Started"));
    assert!(cluster.traces().is_empty());
    assert!(interrupts.current_trace().is_none());
}

#[tokio::test]
async fn test_run_and_await_status_deletes_on_handler_error() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    let (orch, _out, _) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));

    let err = orch
        .run_and_await_status(&status_config("capabilities"), |_| {
            Err(TraceError::InvalidConfig("bad output".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::InvalidConfig(_)));
    assert!(cluster.traces().is_empty());
}

#[tokio::test]
async fn test_run_and_stream_prints_output_and_deletes() {
    let cluster = SimulatedCluster::new(&["node-1", "node-2"]);
    let exec = ScriptedExec::new(&[
        ("node-1", Script::Complete(vec!["conn a"])),
        ("node-2", Script::Complete(vec!["conn b"])),
    ]);
    let (orch, out, _) = orchestrator(cluster.clone(), exec.clone());

    let transform = Arc::new(|line: &str| line.to_uppercase());
    assert_ok!(
        orch.run_and_stream(&TraceConfig::stream("tcpconnect"), transform)
            .await
    );

    let stdout = out.stdout();
    assert!(stdout.contains("CONN A"));
    assert!(stdout.contains("CONN B"));
    assert!(stdout.contains("Trace completed on node node-1"));
    assert!(stdout.contains("Trace completed on node node-2"));

    let commands = exec.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands
        .iter()
        .all(|(_, cmd)| cmd.starts_with("tracemesh-agent receive-stream --tracer-id trace_gadget_tcpconnect-")));
    assert!(cluster.traces().is_empty());
}

#[tokio::test]
async fn test_interrupt_during_wait_tears_down() {
    let cluster = SimulatedCluster::new(&["node-1"]);
    cluster.set_behavior("node-1", NodeBehavior::Silent);
    let (orch, _out, interrupts) = orchestrator(cluster.clone(), ScriptedExec::new(&[]));
    let orch = Arc::new(orch);

    let task = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move {
            let config = status_config("tcpconnect");
            let result = orch.run_and_await_status(&config, |_| Ok(())).await;
            result
        })
    };

    let probe = Arc::clone(&cluster);
    assert!(eventually(|| !probe.traces().is_empty()).await);
    let trace_id = interrupts.current_trace().expect("armed");
    assert_eq!(
        interrupts.record(),
        InterruptAction::Teardown {
            trace_id: Some(trace_id)
        }
    );

    let result = task.await.unwrap();
    assert!(matches!(result, Err(TraceError::Interrupted)));
    assert!(cluster.traces().is_empty());
    assert!(interrupts.current_trace().is_none());

    // A second interrupt always forces exit
    assert_eq!(interrupts.record(), InterruptAction::ForceExit);
}

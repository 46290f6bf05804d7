//! tracemesh - cluster-wide eBPF tracing
//!
//! This library pairs a per-node tracer runtime that turns kernel events into
//! typed, enriched records with an orchestrator that fans a trace request out
//! to every node of a cluster and folds the per-node outcomes back together.
//!
//! # Modules
//!
//! - `ebpf` - Tracer runtime: hook attachment, event channel reader, decoders
//! - `trace` - Trace resource model, orchestrator and stream aggregator
//! - `config` - Orchestrator and node configuration
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - Logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use tracemesh::trace::{TraceConfig, TraceOrchestrator};
//!
//! let orchestrator = TraceOrchestrator::new(client, exec, config, console, interrupts);
//! let trace_id = orchestrator.create_trace(&TraceConfig::stream("tcpconnect")).await?;
//! orchestrator.delete_trace(&trace_id).await;
//! ```

pub mod config;
pub mod ebpf;
pub mod metrics;
pub mod telemetry;
pub mod trace;

// Re-export commonly used types at crate root for convenience
pub use config::{NodeConfig, OrchestratorConfig};
pub use ebpf::{Gadget, GadgetRegistry, TracerError};
pub use trace::{TraceConfig, TraceError, TraceOrchestrator};

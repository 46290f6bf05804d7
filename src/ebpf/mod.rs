//! Per-node tracer runtime
//!
//! A gadget attaches a set of kernel hook points, consumes the program's
//! event channel on a dedicated task and turns every raw record into a typed,
//! enriched event handed to a callback fixed at construction.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Kernel Space (pre-built programs, opaque to this crate)     │
//! │                                                             │
//! │  kprobe/kretprobe/tracepoint ──► perf event array "events"  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  ProbeBackend (aya or injected)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  EventReader  ── Record::Sample / Record::Lost / ReadError   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  one consumption task
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TracerRuntime<Decoder>                                     │
//! │                                                             │
//! │  decode → enrich_by_mnt_ns → callback(event)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! `Uninstalled → Installed → Running → Closed`. `Closed` is terminal and
//! reachable from every state; closing twice is a no-op.
//!
//! ## Requirements (kernel backend only)
//!
//! - Linux kernel 5.8+ with CONFIG_BPF_SYSCALL=y
//! - CAP_BPF and CAP_PERFMON capabilities (or root)
//! - Pre-built program objects in the configured BPF directory
//! - Compiled with `--features ebpf`

#[cfg(feature = "ebpf")]
mod aya_backend;
pub mod backend;
pub mod event;
pub mod gadgets;
pub mod reader;
pub mod registry;
pub mod runtime;

#[cfg(feature = "ebpf")]
pub use aya_backend::AyaBackend;
pub use backend::{GlobalValue, HookPoint, LinkId, ProbeBackend, ProgramSpec};
pub use event::{BootClock, CommonData, ContainerCollection, Enricher, EventKind, K8sMetadata};
pub use reader::{EventReader, ReadError, ReaderCloser, Record};
pub use registry::{GadgetContext, GadgetParams, GadgetRegistry};
pub use runtime::{EventDecoder, TracerEvent, TracerRuntime};

use tokio::task::JoinHandle;

/// Errors raised by the tracer runtime and its backends
#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    /// The program object could not be loaded
    #[error("eBPF load error: {0}")]
    Load(String),
    /// A hook point could not be attached
    #[error("eBPF attach error on {hook}: {reason}")]
    Attach { hook: String, reason: String },
    /// A BPF map was missing or could not be updated
    #[error("eBPF map error: {0}")]
    Map(String),
    /// The event channel could not be opened
    #[error("event reader error: {0}")]
    Reader(String),
    /// The requested transition is not valid from the current state
    #[error("cannot {operation} a tracer in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: TracerState,
    },
    /// No gadget is registered under that name
    #[error("unknown gadget {0:?}")]
    UnknownGadget(String),
    /// A gadget parameter could not be used
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Kernel support was not compiled in
    #[error("eBPF is not enabled (rebuild with --features ebpf)")]
    NotEnabled,
}

/// Lifecycle state of one tracer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
    Uninstalled,
    Installed,
    Running,
    Closed,
}

/// One instrumentation program bound to a backend and an event callback
///
/// Every program supplies its own variant (usually a [`TracerRuntime`] with a
/// program-specific decoder); the [`GadgetRegistry`] builds them by name.
pub trait Gadget: Send {
    /// Program name as registered (e.g. `tcpconnect`)
    fn name(&self) -> &'static str;

    /// Current lifecycle state
    fn state(&self) -> TracerState;

    /// Attach every hook point; all-or-nothing
    fn install(&mut self) -> Result<(), TracerError>;

    /// Start the consumption task; must be called inside a tokio runtime
    fn run(&mut self) -> Result<(), TracerError>;

    /// Release attachments and the reader; idempotent
    fn close(&mut self);

    /// Handle for closing the reader from another task without owning the gadget
    fn closer(&self) -> Option<ReaderCloser>;

    /// Hand out the consumption task so the owner can await its end
    fn take_consumer(&mut self) -> Option<JoinHandle<()>>;

    /// Install then run, closing again if either step fails
    fn start(&mut self) -> Result<(), TracerError> {
        let result = self.install().and_then(|_| self.run());
        if result.is_err() {
            self.close();
        }
        result
    }
}

/// Stub kernel backend for when the eBPF feature is disabled.
///
/// This allows the rest of the codebase to compile without feature flags everywhere.
#[cfg(not(feature = "ebpf"))]
pub struct AyaBackend;

#[cfg(not(feature = "ebpf"))]
impl AyaBackend {
    /// Always fails when the eBPF feature is disabled.
    pub fn new(_config: &crate::config::NodeConfig) -> Result<Self, TracerError> {
        Err(TracerError::NotEnabled)
    }
}

#[cfg(not(feature = "ebpf"))]
impl ProbeBackend for AyaBackend {
    fn load(&mut self, _spec: &ProgramSpec) -> Result<(), TracerError> {
        Err(TracerError::NotEnabled)
    }

    fn attach(&mut self, _hook: &HookPoint) -> Result<LinkId, TracerError> {
        Err(TracerError::NotEnabled)
    }

    fn detach(&mut self, _link: LinkId) -> Result<(), TracerError> {
        Ok(())
    }

    fn open_reader(&mut self, _map: &str) -> Result<(EventReader, ReaderCloser), TracerError> {
        Err(TracerError::NotEnabled)
    }

    fn unload(&mut self) {}
}

//! Seam between the runtime and whatever loads programs into the kernel
//!
//! The runtime only speaks in hook points, link ids and readers; the kernel
//! backend ([`super::AyaBackend`]) maps those onto aya programs and maps.

use std::fmt;

use super::reader::{EventReader, ReaderCloser};
use super::TracerError;

/// Where a program gets attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Entry of a kernel function
    KProbe {
        program: &'static str,
        function: &'static str,
    },
    /// Return of a kernel function
    KRetProbe {
        program: &'static str,
        function: &'static str,
    },
    /// Static kernel tracepoint
    TracePoint {
        program: &'static str,
        category: &'static str,
        name: &'static str,
    },
}

impl HookPoint {
    /// Name of the program inside the object file
    pub fn program(&self) -> &'static str {
        match self {
            HookPoint::KProbe { program, .. }
            | HookPoint::KRetProbe { program, .. }
            | HookPoint::TracePoint { program, .. } => program,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::KProbe { function, .. } => write!(f, "kprobe/{}", function),
            HookPoint::KRetProbe { function, .. } => write!(f, "kretprobe/{}", function),
            HookPoint::TracePoint { category, name, .. } => {
                write!(f, "tracepoint/{}/{}", category, name)
            }
        }
    }
}

/// Opaque handle to one attachment held by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// Value written into a program's read-only globals before load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalValue {
    Bool(bool),
    U64(u64),
}

/// Everything a backend needs to load one program object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    /// Object file stem (`<object>.o`)
    pub object: &'static str,
    /// Perf event array carrying raw records
    pub events_map: &'static str,
    /// Globals set before the object is loaded
    pub globals: Vec<(&'static str, GlobalValue)>,
    /// Mount namespaces to keep; `None` traces everything
    pub mount_ns_filter: Option<Vec<u64>>,
}

/// Name of the hash map holding the mount namespace filter
pub const MOUNT_NS_FILTER_MAP: &str = "mount_ns_filter";

/// Name of the global toggling the mount namespace filter
pub const FILTER_BY_MNT_NS: &str = "filter_by_mnt_ns";

impl ProgramSpec {
    pub fn new(object: &'static str) -> Self {
        Self {
            object,
            events_map: "events",
            globals: Vec::new(),
            mount_ns_filter: None,
        }
    }

    pub fn global(mut self, name: &'static str, value: GlobalValue) -> Self {
        self.globals.push((name, value));
        self
    }

    /// Restrict the program to the given mount namespaces.
    pub fn mount_ns_filter(mut self, ids: Option<Vec<u64>>) -> Self {
        let enabled = ids.as_ref().is_some_and(|ids| !ids.is_empty());
        self.globals
            .push((FILTER_BY_MNT_NS, GlobalValue::Bool(enabled)));
        self.mount_ns_filter = ids.filter(|ids| !ids.is_empty());
        self
    }
}

/// Loads programs, attaches hooks and opens event readers
///
/// A backend serves a single runtime. Dropping a backend must release
/// everything it still holds.
pub trait ProbeBackend: Send {
    /// Load the program object; called once, before any attach.
    fn load(&mut self, spec: &ProgramSpec) -> Result<(), TracerError>;

    fn attach(&mut self, hook: &HookPoint) -> Result<LinkId, TracerError>;

    fn detach(&mut self, link: LinkId) -> Result<(), TracerError>;

    /// Open the reader over the named perf event array.
    fn open_reader(&mut self, map: &str) -> Result<(EventReader, ReaderCloser), TracerError>;

    /// Release the loaded object and anything still attached.
    fn unload(&mut self);
}

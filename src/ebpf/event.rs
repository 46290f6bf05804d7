//! Typed event envelope and enrichment
//!
//! Every gadget event flattens a [`CommonData`] envelope next to its own
//! payload. Status events (lost samples, read errors) carry only the envelope.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::RwLock;

use nix::time::{clock_gettime, ClockId};
use serde::{Deserialize, Serialize};

/// Kind of event carried by the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventKind {
    #[default]
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "err")]
    Error,
    #[serde(rename = "warn")]
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Normal => "normal",
            EventKind::Error => "err",
            EventKind::Warning => "warn",
        }
    }
}

/// Container identity attached by an [`Enricher`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
}

/// Envelope shared by every event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonData {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Wall-clock nanoseconds since the epoch
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, rename = "mountnsid", skip_serializing_if = "is_zero")]
    pub mount_ns_id: u64,
    #[serde(flatten)]
    pub k8s: K8sMetadata,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl CommonData {
    pub fn normal(timestamp: i64, mount_ns_id: u64) -> Self {
        Self {
            kind: EventKind::Normal,
            timestamp,
            mount_ns_id,
            ..Default::default()
        }
    }

    /// Envelope of a synthetic warning or error event, stamped now.
    pub fn status(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: realtime_ns(),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Maps a mount namespace to container identity
///
/// Called synchronously from the consumption task for every event.
pub trait Enricher: Send + Sync {
    fn enrich_by_mnt_ns(&self, k8s: &mut K8sMetadata, mount_ns_id: u64);
}

/// Identity of one container known on this node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

/// In-memory container table keyed by mount namespace id
pub struct ContainerCollection {
    node: String,
    containers: RwLock<HashMap<u64, ContainerInfo>>,
}

impl ContainerCollection {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            containers: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, mount_ns_id: u64, info: ContainerInfo) {
        if let Ok(mut containers) = self.containers.write() {
            containers.insert(mount_ns_id, info);
        }
    }

    pub fn remove(&self, mount_ns_id: u64) -> Option<ContainerInfo> {
        self.containers.write().ok()?.remove(&mount_ns_id)
    }

    pub fn len(&self) -> usize {
        self.containers.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Enricher for ContainerCollection {
    fn enrich_by_mnt_ns(&self, k8s: &mut K8sMetadata, mount_ns_id: u64) {
        k8s.node = self.node.clone();
        let Ok(containers) = self.containers.read() else {
            return;
        };
        if let Some(info) = containers.get(&mount_ns_id) {
            k8s.namespace = info.namespace.clone();
            k8s.pod = info.pod.clone();
            k8s.container = info.container.clone();
        }
    }
}

/// Converts kernel boot-clock timestamps to wall-clock time
///
/// Programs stamp records with `bpf_ktime_get_boot_ns()`; the offset between
/// the realtime and boottime clocks is sampled once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootClock {
    offset_ns: i64,
}

impl BootClock {
    pub fn now() -> Self {
        let boot = clock_gettime(ClockId::CLOCK_BOOTTIME)
            .map(|ts| ts.tv_sec() as i64 * 1_000_000_000 + ts.tv_nsec() as i64);
        match boot {
            Ok(boot) => Self {
                offset_ns: realtime_ns() - boot,
            },
            Err(e) => {
                tracing::warn!(error = %e, "CLOCK_BOOTTIME unavailable, timestamps stay boot-relative");
                Self { offset_ns: 0 }
            }
        }
    }

    pub fn with_offset(offset_ns: i64) -> Self {
        Self { offset_ns }
    }

    /// Wall-clock nanoseconds for a boot-clock timestamp; zero stays zero.
    pub fn wall_time(&self, boot_ns: u64) -> i64 {
        if boot_ns == 0 {
            return 0;
        }
        self.offset_ns.saturating_add(boot_ns as i64)
    }
}

fn realtime_ns() -> i64 {
    clock_gettime(ClockId::CLOCK_REALTIME)
        .map(|ts| ts.tv_sec() as i64 * 1_000_000_000 + ts.tv_nsec() as i64)
        .unwrap_or(0)
}

/// String up to the first NUL of a fixed-size C buffer
pub fn from_cstring(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// IP version for an address family, 0 when unknown
pub fn ip_version_from_af(af: u32) -> u8 {
    match af as i32 {
        libc::AF_INET => 4,
        libc::AF_INET6 => 6,
        _ => 0,
    }
}

/// Render an address stored in a 16-byte kernel buffer
///
/// IPv4 addresses occupy the first four bytes in network order.
pub fn ip_string(raw: &[u8; 16], version: u8) -> String {
    match version {
        4 => Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string(),
        6 => Ipv6Addr::from(*raw).to_string(),
        _ => String::new(),
    }
}

/// Serialize a `Duration` as integer nanoseconds
pub(crate) mod duration_ns {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

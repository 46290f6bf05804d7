//! capabilities: security capability checks made by traced processes
//!
//! Entry and return probes on `cap_capable`; the return value decides the
//! verdict.

use serde::{Deserialize, Serialize};

use super::{read_record, record_bytes, syscall_name};
use crate::ebpf::backend::{GlobalValue, HookPoint, ProgramSpec};
use crate::ebpf::event::{self, BootClock, CommonData};
use crate::ebpf::runtime::{DecodeError, EventDecoder, TracerEvent};

/// Layout written by the capabilities program
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RawCapabilityEvent {
    pub mntns_id: u64,
    pub current_userns: u64,
    pub target_userns: u64,
    /// Effective capability mask of the task
    pub cap_effective: u64,
    pub timestamp: u64,
    pub pid: u32,
    pub cap: i32,
    pub tgid: u32,
    pub uid: u32,
    pub gid: u32,
    /// Return value of `cap_capable`
    pub ret: i32,
    pub audit: i32,
    pub insetid: i32,
    pub syscall: u64,
    pub task: [u8; 16],
}

impl RawCapabilityEvent {
    pub fn to_bytes(&self) -> Vec<u8> {
        record_bytes(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityEvent {
    #[serde(flatten)]
    pub common: CommonData,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub tgid: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub comm: String,
    #[serde(default)]
    pub cap: i32,
    #[serde(default)]
    pub capname: String,
    #[serde(default)]
    pub verdict: String,
    #[serde(default)]
    pub audit: i32,
    #[serde(default)]
    pub insetid: i32,
    #[serde(default)]
    pub syscall: String,
    #[serde(default)]
    pub current_userns: u64,
    #[serde(default)]
    pub target_userns: u64,
    /// Names of every capability in the effective set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
}

impl TracerEvent for CapabilityEvent {
    fn from_status(common: CommonData) -> Self {
        Self {
            common,
            ..Default::default()
        }
    }

    fn common(&self) -> &CommonData {
        &self.common
    }

    fn common_mut(&mut self) -> &mut CommonData {
        &mut self.common
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapabilitiesConfig {
    /// Only report checks that would be audited
    pub audit_only: bool,
    pub mount_ns_filter: Option<Vec<u64>>,
}

pub struct CapabilitiesDecoder {
    config: CapabilitiesConfig,
}

impl CapabilitiesDecoder {
    pub fn new(config: CapabilitiesConfig) -> Self {
        Self { config }
    }
}

const CAPABILITY_NAMES: [&str; 41] = [
    "CHOWN",
    "DAC_OVERRIDE",
    "DAC_READ_SEARCH",
    "FOWNER",
    "FSETID",
    "KILL",
    "SETGID",
    "SETUID",
    "SETPCAP",
    "LINUX_IMMUTABLE",
    "NET_BIND_SERVICE",
    "NET_BROADCAST",
    "NET_ADMIN",
    "NET_RAW",
    "IPC_LOCK",
    "IPC_OWNER",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_CHROOT",
    "SYS_PTRACE",
    "SYS_PACCT",
    "SYS_ADMIN",
    "SYS_BOOT",
    "SYS_NICE",
    "SYS_RESOURCE",
    "SYS_TIME",
    "SYS_TTY_CONFIG",
    "MKNOD",
    "LEASE",
    "AUDIT_WRITE",
    "AUDIT_CONTROL",
    "SETFCAP",
    "MAC_OVERRIDE",
    "MAC_ADMIN",
    "SYSLOG",
    "WAKE_ALARM",
    "BLOCK_SUSPEND",
    "AUDIT_READ",
    "PERFMON",
    "BPF",
    "CHECKPOINT_RESTORE",
];

/// Name of a capability number, e.g. `SYS_ADMIN` for 21
pub fn capability_name(cap: i32) -> String {
    usize::try_from(cap)
        .ok()
        .and_then(|i| CAPABILITY_NAMES.get(i))
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("CAP_{}", cap))
}

/// Names of every bit set in an effective capability mask
pub fn capability_set(mask: u64) -> Vec<String> {
    (0..CAPABILITY_NAMES.len())
        .filter(|bit| mask & (1u64 << bit) != 0)
        .map(|bit| CAPABILITY_NAMES[bit].to_string())
        .collect()
}

impl EventDecoder for CapabilitiesDecoder {
    type Event = CapabilityEvent;

    fn name(&self) -> &'static str {
        "capabilities"
    }

    fn program(&self) -> ProgramSpec {
        ProgramSpec::new("capabilities")
            .global("audit_only", GlobalValue::Bool(self.config.audit_only))
            .mount_ns_filter(self.config.mount_ns_filter.clone())
    }

    fn hooks(&self) -> Vec<HookPoint> {
        vec![
            HookPoint::KProbe {
                program: "capabilities_cap_capable_entry",
                function: "cap_capable",
            },
            HookPoint::KRetProbe {
                program: "capabilities_cap_capable_exit",
                function: "cap_capable",
            },
        ]
    }

    fn decode(&self, raw: &[u8], clock: &BootClock) -> Result<CapabilityEvent, DecodeError> {
        let raw: RawCapabilityEvent = read_record(raw)?;
        let verdict = if raw.ret == 0 { "Allow" } else { "Deny" };

        Ok(CapabilityEvent {
            common: CommonData::normal(clock.wall_time(raw.timestamp), raw.mntns_id),
            pid: raw.pid,
            tgid: raw.tgid,
            uid: raw.uid,
            gid: raw.gid,
            comm: event::from_cstring(&raw.task),
            cap: raw.cap,
            capname: capability_name(raw.cap),
            verdict: verdict.to_string(),
            audit: raw.audit,
            insetid: raw.insetid,
            syscall: syscall_name(raw.syscall),
            current_userns: raw.current_userns,
            target_userns: raw.target_userns,
            caps: capability_set(raw.cap_effective),
        })
    }
}

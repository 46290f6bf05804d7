//! tcpconnect: outgoing TCP connections, optionally with connect latency
//!
//! Fast path: entry/return probes on `tcp_v4_connect` and `tcp_v6_connect`.
//! Latency path: entry probes on the same functions correlated with
//! `tcp_rcv_state_process` (handshake completed) and the
//! `tcp:tcp_destroy_sock` tracepoint (socket gone before completing).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{read_record, record_bytes};
use crate::ebpf::backend::{GlobalValue, HookPoint, ProgramSpec};
use crate::ebpf::event::{self, BootClock, CommonData};
use crate::ebpf::runtime::{DecodeError, EventDecoder, TracerEvent};

/// Layout written by the tcpconnect program
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RawTcpConnectEvent {
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub task: [u8; 16],
    /// Connect latency in nanoseconds (latency path only)
    pub latency_ns: u64,
    pub mntns_id: u64,
    /// `bpf_ktime_get_boot_ns()` at emission
    pub timestamp: u64,
    pub pid: u32,
    pub uid: u32,
    pub af: u32,
    /// Network byte order
    pub dport: u16,
    pub sport: u16,
}

impl RawTcpConnectEvent {
    pub fn to_bytes(&self) -> Vec<u8> {
        record_bytes(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConnectEvent {
    #[serde(flatten)]
    pub common: CommonData,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub comm: String,
    #[serde(default)]
    pub ipversion: u8,
    #[serde(default)]
    pub saddr: String,
    #[serde(default)]
    pub daddr: String,
    #[serde(default)]
    pub sport: u16,
    #[serde(default)]
    pub dport: u16,
    #[serde(default, with = "event::duration_ns", skip_serializing_if = "Duration::is_zero")]
    pub latency: Duration,
}

impl TracerEvent for TcpConnectEvent {
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
pub struct TcpConnectConfig {
    /// Measure time from connect to handshake completion
    pub calculate_latency: bool,
    /// Drop connections faster than this (latency path only)
    pub min_latency: Duration,
    pub mount_ns_filter: Option<Vec<u64>>,
}

pub struct TcpConnectDecoder {
    config: TcpConnectConfig,
}

impl TcpConnectDecoder {
    pub fn new(config: TcpConnectConfig) -> Self {
        Self { config }
    }
}

impl EventDecoder for TcpConnectDecoder {
    type Event = TcpConnectEvent;

    fn name(&self) -> &'static str {
        "tcpconnect"
    }

    fn program(&self) -> ProgramSpec {
        ProgramSpec::new("tcpconnect")
            .global(
                "calculate_latency",
                GlobalValue::Bool(self.config.calculate_latency),
            )
            .global(
                "targ_min_latency_ns",
                GlobalValue::U64(self.config.min_latency.as_nanos() as u64),
            )
            .mount_ns_filter(self.config.mount_ns_filter.clone())
    }

    fn hooks(&self) -> Vec<HookPoint> {
        let mut hooks = vec![
            HookPoint::KProbe {
                program: "tcpconnect_v4_entry",
                function: "tcp_v4_connect",
            },
            HookPoint::KProbe {
                program: "tcpconnect_v6_entry",
                function: "tcp_v6_connect",
            },
        ];
        if self.config.calculate_latency {
            hooks.push(HookPoint::TracePoint {
                program: "tcpconnect_destroy_sock",
                category: "tcp",
                name: "tcp_destroy_sock",
            });
            hooks.push(HookPoint::KProbe {
                program: "tcpconnect_rcv_state_process",
                function: "tcp_rcv_state_process",
            });
        } else {
            hooks.push(HookPoint::KRetProbe {
                program: "tcpconnect_v4_exit",
                function: "tcp_v4_connect",
            });
            hooks.push(HookPoint::KRetProbe {
                program: "tcpconnect_v6_exit",
                function: "tcp_v6_connect",
            });
        }
        hooks
    }

    fn decode(&self, raw: &[u8], clock: &BootClock) -> Result<TcpConnectEvent, DecodeError> {
        let raw: RawTcpConnectEvent = read_record(raw)?;
        let ipversion = event::ip_version_from_af(raw.af);

        Ok(TcpConnectEvent {
            common: CommonData::normal(clock.wall_time(raw.timestamp), raw.mntns_id),
            pid: raw.pid,
            uid: raw.uid,
            comm: event::from_cstring(&raw.task),
            ipversion,
            saddr: event::ip_string(&raw.saddr, ipversion),
            daddr: event::ip_string(&raw.daddr, ipversion),
            sport: raw.sport,
            dport: u16::from_be(raw.dport),
            latency: Duration::from_nanos(raw.latency_ns),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::event::EventKind;

    fn raw_v4() -> RawTcpConnectEvent {
        let mut raw = RawTcpConnectEvent {
            pid: 4242,
            uid: 1000,
            af: libc::AF_INET as u32,
            dport: 443u16.to_be(),
            sport: 51000,
            mntns_id: 4026531840,
            timestamp: 2_000,
            latency_ns: 1_500_000,
            ..Default::default()
        };
        raw.saddr[..4].copy_from_slice(&[192, 168, 1, 10]);
        raw.daddr[..4].copy_from_slice(&[1, 1, 1, 1]);
        raw.task[..4].copy_from_slice(b"curl");
        raw
    }

    #[test]
    fn test_layout_size() {
        assert_eq!(std::mem::size_of::<RawTcpConnectEvent>(), 88);
    }

    #[test]
    fn test_decode_v4() {
        let decoder = TcpConnectDecoder::new(TcpConnectConfig::default());
        let event = decoder
            .decode(&raw_v4().to_bytes(), &BootClock::with_offset(10_000))
            .unwrap();

        assert_eq!(event.common.kind, EventKind::Normal);
        assert_eq!(event.common.timestamp, 12_000);
        assert_eq!(event.common.mount_ns_id, 4026531840);
        assert_eq!(event.comm, "curl");
        assert_eq!(event.ipversion, 4);
        assert_eq!(event.saddr, "192.168.1.10");
        assert_eq!(event.daddr, "1.1.1.1");
        assert_eq!(event.dport, 443);
        assert_eq!(event.sport, 51000);
        assert_eq!(event.latency, Duration::from_micros(1500));
    }

    #[test]
    fn test_decode_v6() {
        let mut raw = raw_v4();
        raw.af = libc::AF_INET6 as u32;
        raw.daddr = std::net::Ipv6Addr::LOCALHOST.octets();
        let decoder = TcpConnectDecoder::new(TcpConnectConfig::default());
        let event = decoder.decode(&raw.to_bytes(), &BootClock::with_offset(0)).unwrap();
        assert_eq!(event.ipversion, 6);
        assert_eq!(event.daddr, "::1");
    }

    #[test]
    fn test_decode_short_record() {
        let decoder = TcpConnectDecoder::new(TcpConnectConfig::default());
        assert!(decoder.decode(&[0u8; 40], &BootClock::with_offset(0)).is_err());
    }

    #[test]
    fn test_hooks_follow_mode() {
        let fast = TcpConnectDecoder::new(TcpConnectConfig::default()).hooks();
        assert_eq!(fast.len(), 4);
        assert!(fast
            .iter()
            .any(|h| matches!(h, HookPoint::KRetProbe { function: "tcp_v6_connect", .. })));

        let latency = TcpConnectDecoder::new(TcpConnectConfig {
            calculate_latency: true,
            ..Default::default()
        })
        .hooks();
        assert_eq!(latency.len(), 4);
        assert!(latency
            .iter()
            .any(|h| matches!(h, HookPoint::TracePoint { name: "tcp_destroy_sock", .. })));
        assert!(!latency
            .iter()
            .any(|h| matches!(h, HookPoint::KRetProbe { .. })));
    }

    #[test]
    fn test_program_globals() {
        let spec = TcpConnectDecoder::new(TcpConnectConfig {
            calculate_latency: true,
            min_latency: Duration::from_millis(5),
            mount_ns_filter: Some(vec![7]),
        })
        .program();
        assert!(spec
            .globals
            .contains(&("targ_min_latency_ns", GlobalValue::U64(5_000_000))));
        assert!(spec
            .globals
            .contains(&("calculate_latency", GlobalValue::Bool(true))));
        assert_eq!(spec.mount_ns_filter, Some(vec![7]));
    }

    #[test]
    fn test_json_omits_zero_latency() {
        let decoder = TcpConnectDecoder::new(TcpConnectConfig::default());
        let mut raw = raw_v4();
        raw.latency_ns = 0;
        let event = decoder.decode(&raw.to_bytes(), &BootClock::with_offset(0)).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("latency").is_none());
        assert_eq!(json["type"], "normal");
        assert_eq!(json["dport"], 443);
    }
}

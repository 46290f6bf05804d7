//! Built-in instrumentation programs
//!
//! Each program pairs a `#[repr(C)]` raw record (the layout the pre-built
//! object writes) with a decoder producing a serializable event.

pub mod capabilities;
pub mod tcpconnect;

pub use capabilities::{CapabilitiesConfig, CapabilitiesDecoder, CapabilityEvent};
pub use tcpconnect::{TcpConnectConfig, TcpConnectDecoder, TcpConnectEvent};

use super::runtime::DecodeError;

/// Copy a fixed-layout record out of a byte buffer.
///
/// `T` must be a plain `#[repr(C)]` struct of integers and byte arrays.
pub(crate) fn read_record<T: Copy>(raw: &[u8]) -> Result<T, DecodeError> {
    let expected = std::mem::size_of::<T>();
    if raw.len() < expected {
        return Err(DecodeError::Short {
            got: raw.len(),
            expected,
        });
    }
    // SAFETY: length checked above; T is plain old data so any bit pattern is valid.
    Ok(unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const T) })
}

/// View a fixed-layout record as bytes.
pub(crate) fn record_bytes<T: Copy>(record: &T) -> Vec<u8> {
    // SAFETY: T is a padding-free #[repr(C)] record, every byte is initialized.
    unsafe {
        std::slice::from_raw_parts(record as *const T as *const u8, std::mem::size_of::<T>())
    }
    .to_vec()
}

/// Convert syscall number to name (Linux x86_64)
pub(crate) fn syscall_name(nr: u64) -> String {
    // Syscalls that commonly end in a capability check - expand as needed
    match nr {
        2 => "open".to_string(),
        16 => "ioctl".to_string(),
        41 => "socket".to_string(),
        49 => "bind".to_string(),
        54 => "setsockopt".to_string(),
        56 => "clone".to_string(),
        59 => "execve".to_string(),
        62 => "kill".to_string(),
        90 => "chmod".to_string(),
        92 => "chown".to_string(),
        101 => "ptrace".to_string(),
        105 => "setuid".to_string(),
        106 => "setgid".to_string(),
        113 => "setreuid".to_string(),
        114 => "setregid".to_string(),
        117 => "setresuid".to_string(),
        119 => "setresgid".to_string(),
        126 => "capset".to_string(),
        133 => "mknod".to_string(),
        160 => "setrlimit".to_string(),
        161 => "chroot".to_string(),
        164 => "settimeofday".to_string(),
        165 => "mount".to_string(),
        166 => "umount2".to_string(),
        169 => "reboot".to_string(),
        170 => "sethostname".to_string(),
        175 => "init_module".to_string(),
        257 => "openat".to_string(),
        272 => "unshare".to_string(),
        298 => "perf_event_open".to_string(),
        308 => "setns".to_string(),
        313 => "finit_module".to_string(),
        321 => "bpf".to_string(),
        435 => "clone3".to_string(),
        _ => format!("syscall_{}", nr),
    }
}

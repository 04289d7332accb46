#![cfg_attr(not(any(test, feature = "user")), no_std)]

//! Records and capture logic shared by the `rpcflow` kprobes and the
//! userspace agent.
//!
//! Everything here has to build for `bpfel-unknown-none`: no allocation, no
//! panicking paths the verifier can see, and loops with constant trip counts.
//! The kprobes in `rpcflow-ebpf` are thin glue around [`pipeline`]; keeping
//! the logic here lets it run under `cargo test` against a fake reader.

use core::mem::size_of;

pub mod filter;
pub mod pipeline;
pub mod reader;
pub mod sample;
pub mod sock;

#[cfg(test)]
mod testing;

#[cfg(feature = "user")]
pub mod user;

pub const TASK_COMM_LEN: usize = 16;

/// Largest transfer size the admission filter lets through.
pub const MAX_DATA_LEN: u64 = 65536;

pub const V1_SAMPLE_LEN: usize = 256;
pub const V2_SAMPLE_LEN: usize = 512;
pub const MINIMAL_SAMPLE_LEN: usize = 256;

/// Capacity of the destination port allow-list.
pub const MAX_PORTS: usize = 16;

pub const AF_INET: u16 = 2;

pub const DEFAULT_TARGET_COMM: &[u8] = b"node";
pub const DEFAULT_PORTS: [u16; 3] = [443, 8545, 8547];

/// Direction of the traced call, stored on the wire as `is_send`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "lowercase"))]
pub enum Direction {
    Recv = 0,
    Send = 1,
}

impl Direction {
    pub fn from_is_send(is_send: u32) -> Self {
        if is_send == 1 {
            Direction::Send
        } else {
            Direction::Recv
        }
    }
}

/// Record layout emitted on the `EVENTS` channel.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "lowercase"))]
pub enum Schema {
    Minimal = 0,
    V1 = 1,
    V2 = 2,
}

impl Schema {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Schema::Minimal),
            1 => Some(Schema::V1),
            2 => Some(Schema::V2),
            _ => None,
        }
    }

    /// Size of one record on the wire.
    pub const fn record_len(self) -> usize {
        match self {
            Schema::Minimal => MinimalEvent::LEN,
            Schema::V1 => NetworkEventV1::LEN,
            Schema::V2 => NetworkEventV2::LEN,
        }
    }
}

/// Fixed-layout record types that cross the kernel/user boundary.
///
/// `as_bytes` is what the kprobes hand to the perf array and `from_bytes` is
/// what the agent reads back out of it.
pub trait WireRecord: Copy + Sized {
    const LEN: usize = size_of::<Self>();

    fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, Self::LEN) }
    }

    /// Returns `None` when `buf` is shorter than one record.
    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        Some(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Self) })
    }
}

/// Schema v1: identity, size and direction plus a 256-byte sample.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NetworkEventV1 {
    pub pid: u64,
    pub timestamp_ns: u64,
    pub data_len: u32,
    pub is_send: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub data: [u8; V1_SAMPLE_LEN],
}

/// Schema v2: v1 plus the IPv4 destination, with a 512-byte sample.
///
/// At 560 bytes this does not fit on the eBPF stack; the kprobes build it in
/// a per-CPU scratch slot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NetworkEventV2 {
    pub pid: u64,
    pub timestamp_ns: u64,
    pub data_len: u32,
    pub is_send: u32,
    /// Destination IPv4 address, host byte order.
    pub dest_ip: u32,
    /// Destination port, host byte order.
    pub dest_port: u16,
    pub _pad: [u8; 2],
    pub comm: [u8; TASK_COMM_LEN],
    pub data: [u8; V2_SAMPLE_LEN],
}

/// Identity-only schema. `data` is part of the layout but never filled.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MinimalEvent {
    pub pid: u64,
    pub timestamp_ns: u64,
    pub data_len: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub data: [u8; MINIMAL_SAMPLE_LEN],
    pub _pad: [u8; 4],
}

/// Emitted by the `tcp_sendmsg` return probe for a send that was captured
/// on entry. `request_ts` equals the `timestamp_ns` of that event.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendCompletion {
    pub pid: u64,
    pub request_ts: u64,
    pub completion_ts: u64,
    pub requested: u32,
    pub transferred: u32,
}

impl WireRecord for NetworkEventV1 {}
impl WireRecord for NetworkEventV2 {}
impl WireRecord for MinimalEvent {}
impl WireRecord for SendCompletion {}

const _: () = assert!(NetworkEventV1::LEN == 296);
const _: () = assert!(NetworkEventV2::LEN == 560);
const _: () = assert!(MinimalEvent::LEN == 296);
const _: () = assert!(SendCompletion::LEN == 32);

/// Byte offsets into kernel structures and the `iter_type` codes the
/// sampler recognises. Defaults match Linux 6.4+ on x86_64.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(default))]
pub struct KernelLayout {
    /// `sock.__sk_common.skc_family`
    pub sk_family: u16,
    /// `sock.__sk_common.skc_daddr`
    pub sk_daddr: u16,
    /// `sock.__sk_common.skc_dport`
    pub sk_dport: u16,
    /// `msghdr.msg_iter`
    pub msg_iter: u16,
    /// Offsets below are relative to the start of `iov_iter`.
    pub iter_type: u16,
    pub iter_offset: u16,
    pub iter_ptr: u16,
    pub iter_count: u16,
    pub iter_nr_segs: u16,
    pub iter_ubuf: u8,
    pub iter_iovec: u8,
    pub iter_kvec: u8,
    #[cfg_attr(feature = "user", serde(skip))]
    pub _pad: u8,
}

impl KernelLayout {
    pub const DEFAULT: KernelLayout = KernelLayout {
        sk_family: 16,
        sk_daddr: 0,
        sk_dport: 12,
        msg_iter: 16,
        iter_type: 0,
        iter_offset: 8,
        iter_ptr: 16,
        iter_count: 24,
        iter_nr_segs: 32,
        iter_ubuf: 0,
        iter_iovec: 1,
        iter_kvec: 3,
        _pad: 0,
    };
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Filter settings read by every kprobe invocation.
///
/// Lives in a read-only global of the eBPF object and is written once by the
/// agent at load time.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Command-name prefix, zero padded.
    pub target_comm: [u8; TASK_COMM_LEN],
    /// Number of leading `target_comm` bytes compared against the task.
    pub target_len: u8,
    /// Non-zero: the task name must end right after the prefix.
    pub exact_comm: u8,
    /// A [`Schema`] discriminant.
    pub schema: u8,
    pub _pad: u8,
    /// Accepted socket family; only `AF_INET` is supported.
    pub family: u16,
    pub port_count: u16,
    pub ports: [u16; MAX_PORTS],
    pub layout: KernelLayout,
}

impl CaptureConfig {
    pub const DEFAULT: CaptureConfig = {
        let mut target_comm = [0u8; TASK_COMM_LEN];
        let mut i = 0;
        while i < DEFAULT_TARGET_COMM.len() {
            target_comm[i] = DEFAULT_TARGET_COMM[i];
            i += 1;
        }
        let mut ports = [0u16; MAX_PORTS];
        let mut j = 0;
        while j < DEFAULT_PORTS.len() {
            ports[j] = DEFAULT_PORTS[j];
            j += 1;
        }
        CaptureConfig {
            target_comm,
            target_len: DEFAULT_TARGET_COMM.len() as u8,
            exact_comm: 0,
            schema: Schema::V2 as u8,
            _pad: 0,
            family: AF_INET,
            port_count: DEFAULT_PORTS.len() as u16,
            ports,
            layout: KernelLayout::DEFAULT,
        }
    };

    pub fn schema(&self) -> Option<Schema> {
        Schema::from_u8(self.schema)
    }

    pub fn ports(&self) -> &[u16] {
        let n = (self.port_count as usize).min(MAX_PORTS);
        &self.ports[..n]
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

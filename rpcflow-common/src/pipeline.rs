//! The per-call capture pipeline.
//!
//! Stages run in a fixed order and the first one that rejects the call ends
//! it: process filter, endpoint extraction (v2 only), size and port
//! admission, then the record is written into the caller's scratch slot and
//! the payload sampled. Nothing is written to the slot until every filter
//! has passed.

use crate::{
    filter::{comm_matches, port_allowed, size_admitted},
    reader::{Host, TaskInfo},
    sample::{sample, snapshot_iter, IterSnapshot},
    sock::{extract_endpoint, Endpoint},
    CaptureConfig, Direction, MinimalEvent, NetworkEventV1, NetworkEventV2, SendCompletion,
    TASK_COMM_LEN,
};

/// Why a call produced no record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discard {
    ProcessMismatch,
    UnsupportedFamily,
    SizeOutOfRange,
    PortNotAllowed,
    ReadFault,
    /// The return probe found no matching entry state.
    NotTracked,
    /// The traced call returned zero or an error.
    CallFailed,
}

/// Arguments of `tcp_sendmsg(sk, msg, size)` / `tcp_recvmsg(sk, msg, len, ..)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallArgs {
    pub sock: u64,
    pub msg: u64,
    pub size: u64,
}

/// Fields common to every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    pub pid: u64,
    pub timestamp_ns: u64,
    pub data_len: u32,
    pub direction: Direction,
    pub comm: [u8; TASK_COMM_LEN],
}

/// Records that carry a payload sample.
pub trait SampledEvent {
    /// Whether the schema carries the destination endpoint.
    const ENDPOINT_AWARE: bool;

    /// Zero the whole record, then write the identity fields.
    fn reset(&mut self, id: &Identity);

    fn set_endpoint(&mut self, _ep: Endpoint) {}

    fn sample_mut(&mut self) -> &mut [u8];
}

impl SampledEvent for NetworkEventV1 {
    const ENDPOINT_AWARE: bool = false;

    #[inline(always)]
    fn reset(&mut self, id: &Identity) {
        self.pid = id.pid;
        self.timestamp_ns = id.timestamp_ns;
        self.data_len = id.data_len;
        self.is_send = id.direction as u32;
        self.comm = id.comm;
        self.data.fill(0);
    }

    #[inline(always)]
    fn sample_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl SampledEvent for NetworkEventV2 {
    const ENDPOINT_AWARE: bool = true;

    #[inline(always)]
    fn reset(&mut self, id: &Identity) {
        self.pid = id.pid;
        self.timestamp_ns = id.timestamp_ns;
        self.data_len = id.data_len;
        self.is_send = id.direction as u32;
        self.dest_ip = 0;
        self.dest_port = 0;
        self._pad = [0; 2];
        self.comm = id.comm;
        self.data.fill(0);
    }

    #[inline(always)]
    fn set_endpoint(&mut self, ep: Endpoint) {
        self.dest_ip = ep.addr;
        self.dest_port = ep.port;
    }

    #[inline(always)]
    fn sample_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Receive-side state kept between `tcp_recvmsg` entry and return.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingRecv {
    pub timestamp_ns: u64,
    pub requested: u32,
    pub dest_ip: u32,
    pub dest_port: u16,
    pub _pad: [u8; 6],
    pub iter: IterSnapshot,
}

/// Send-side state kept between `tcp_sendmsg` entry and return.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InflightSend {
    pub timestamp_ns: u64,
    pub requested: u32,
    pub _pad: u32,
}

/// Process filter. Returns the task name so callers do not fetch it twice.
#[inline(always)]
pub fn admit_process<H: TaskInfo>(
    host: &H,
    cfg: &CaptureConfig,
) -> Result<[u8; TASK_COMM_LEN], Discard> {
    let comm = host.comm();
    if comm_matches(&comm, cfg) {
        Ok(comm)
    } else {
        Err(Discard::ProcessMismatch)
    }
}

/// Runs every filter for a call and returns the admitted size and, for
/// endpoint-aware schemas, the destination.
#[inline(always)]
fn admit_call<H: Host>(
    host: &H,
    cfg: &CaptureConfig,
    call: &CallArgs,
    endpoint_aware: bool,
) -> Result<([u8; TASK_COMM_LEN], u32, Option<Endpoint>), Discard> {
    let comm = admit_process(host, cfg)?;
    let endpoint = if endpoint_aware {
        Some(extract_endpoint(host, call.sock, cfg)?)
    } else {
        None
    };
    if !size_admitted(call.size) {
        return Err(Discard::SizeOutOfRange);
    }
    if let Some(ep) = endpoint {
        if !port_allowed(ep.port, cfg) {
            return Err(Discard::PortNotAllowed);
        }
    }
    Ok((comm, call.size as u32, endpoint))
}

/// Entry-time capture: filter, encode and sample into `slot`.
///
/// On `Ok` the slot holds a complete record ready for the output channel
/// and the identity written into it is returned. On `Err` the slot has not
/// been written.
#[inline(always)]
pub fn capture<H: Host, E: SampledEvent>(
    host: &H,
    cfg: &CaptureConfig,
    call: &CallArgs,
    direction: Direction,
    slot: &mut E,
) -> Result<Identity, Discard> {
    let (comm, data_len, endpoint) = admit_call(host, cfg, call, E::ENDPOINT_AWARE)?;

    let id = Identity {
        pid: host.tgid(),
        timestamp_ns: host.ktime_ns(),
        data_len,
        direction,
        comm,
    };
    slot.reset(&id);
    if let Some(ep) = endpoint {
        slot.set_endpoint(ep);
    }

    let iter = snapshot_iter(host, call.msg, &cfg.layout);
    sample(host, &iter, call.size, slot.sample_mut());
    Ok(id)
}

/// Identity-only capture: process and size filters, no endpoint, no
/// payload. `direction` is returned in the identity but not recorded.
#[inline(always)]
pub fn capture_minimal<H: Host>(
    host: &H,
    cfg: &CaptureConfig,
    call: &CallArgs,
    direction: Direction,
    slot: &mut MinimalEvent,
) -> Result<Identity, Discard> {
    let comm = admit_process(host, cfg)?;
    if !size_admitted(call.size) {
        return Err(Discard::SizeOutOfRange);
    }

    let id = Identity {
        pid: host.tgid(),
        timestamp_ns: host.ktime_ns(),
        data_len: call.size as u32,
        direction,
        comm,
    };
    slot.pid = id.pid;
    slot.timestamp_ns = id.timestamp_ns;
    slot.data_len = id.data_len;
    slot.comm = id.comm;
    slot.data.fill(0);
    slot._pad = [0; 4];
    Ok(id)
}

/// Receive entry: filter the call and remember what is needed to sample it
/// once the data has arrived.
#[inline(always)]
pub fn begin_recv<H: Host>(
    host: &H,
    cfg: &CaptureConfig,
    call: &CallArgs,
    endpoint_aware: bool,
) -> Result<PendingRecv, Discard> {
    let (_, requested, endpoint) = admit_call(host, cfg, call, endpoint_aware)?;
    let (dest_ip, dest_port) = match endpoint {
        Some(ep) => (ep.addr, ep.port),
        None => (0, 0),
    };
    Ok(PendingRecv {
        timestamp_ns: host.ktime_ns(),
        requested,
        dest_ip,
        dest_port,
        _pad: [0; 6],
        iter: snapshot_iter(host, call.msg, &cfg.layout),
    })
}

/// The `int` a hooked call returned. `raw` is the full return register,
/// whose upper half is not defined for an `int` result.
#[inline(always)]
fn int_return(raw: u64) -> Result<u32, Discard> {
    match raw as u32 as i32 {
        n if n > 0 => Ok(n as u32),
        _ => Err(Discard::CallFailed),
    }
}

/// Receive return: encode the record for a call admitted by
/// [`begin_recv`], sampling at most as many bytes as the call returned.
#[inline(always)]
pub fn complete_recv<H: Host, E: SampledEvent>(
    host: &H,
    pending: &PendingRecv,
    ret: u64,
    slot: &mut E,
) -> Result<(), Discard> {
    let received = int_return(ret)?;

    slot.reset(&Identity {
        pid: host.tgid(),
        timestamp_ns: pending.timestamp_ns,
        data_len: pending.requested,
        direction: Direction::Recv,
        comm: host.comm(),
    });
    if E::ENDPOINT_AWARE {
        slot.set_endpoint(Endpoint {
            addr: pending.dest_ip,
            port: pending.dest_port,
        });
    }

    sample(host, &pending.iter, received as u64, slot.sample_mut());
    Ok(())
}

/// State to keep for a send that was just emitted.
#[inline(always)]
pub fn track_send(id: &Identity) -> InflightSend {
    InflightSend {
        timestamp_ns: id.timestamp_ns,
        requested: id.data_len,
        _pad: 0,
    }
}

/// Send return: pair the transferred count with the request it answers.
#[inline(always)]
pub fn complete_send<H: TaskInfo>(
    host: &H,
    inflight: &InflightSend,
    ret: u64,
) -> Result<SendCompletion, Discard> {
    let transferred = int_return(ret)?;
    Ok(SendCompletion {
        pid: host.tgid(),
        request_ts: inflight.timestamp_ns,
        completion_ts: host.ktime_ns(),
        requested: inflight.requested,
        transferred,
    })
}

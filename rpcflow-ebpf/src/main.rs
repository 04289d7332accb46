#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns,
        bpf_probe_read_kernel_buf, bpf_probe_read_user_buf,
    },
    macros::{kprobe, kretprobe, map},
    maps::{LruHashMap, PerCpuArray, PerfEventArray, PerfEventByteArray},
    programs::{ProbeContext, RetProbeContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use rpcflow_common::{
    pipeline::{
        begin_recv, capture, capture_minimal, complete_recv, complete_send, track_send, CallArgs,
        Identity, InflightSend, PendingRecv, SampledEvent,
    },
    reader::{AddressSpace, BoundedReader, ReadFault, TaskInfo},
    CaptureConfig, Direction, MinimalEvent, NetworkEventV1, NetworkEventV2, Schema,
    SendCompletion, WireRecord, TASK_COMM_LEN,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

/// Overwritten by the agent through `EbpfLoader::set_global`.
#[no_mangle]
static CAPTURE_CONFIG: CaptureConfig = CaptureConfig::DEFAULT;

#[map]
static EVENTS: PerfEventByteArray = PerfEventByteArray::new(0);

#[map]
static COMPLETIONS: PerfEventArray<SendCompletion> = PerfEventArray::new(0);

// Records are assembled here rather than on the 512-byte stack.
#[map]
static SLOT_V1: PerCpuArray<NetworkEventV1> = PerCpuArray::with_max_entries(1, 0);

#[map]
static SLOT_V2: PerCpuArray<NetworkEventV2> = PerCpuArray::with_max_entries(1, 0);

#[map]
static SLOT_MINIMAL: PerCpuArray<MinimalEvent> = PerCpuArray::with_max_entries(1, 0);

// Entries whose return hook never fires (missed kretprobe, thread exit)
// are evicted instead of filling the map.
#[map]
static INFLIGHT_SENDS: LruHashMap<u64, InflightSend> = LruHashMap::with_max_entries(10240, 0);

#[map]
static PENDING_RECVS: LruHashMap<u64, PendingRecv> = LruHashMap::with_max_entries(10240, 0);

/// The running kernel, seen through the BPF helpers.
struct Kernel;

impl BoundedReader for Kernel {
    #[inline(always)]
    fn read<const N: usize>(
        &self,
        space: AddressSpace,
        addr: u64,
        dst: &mut [u8; N],
    ) -> Result<(), ReadFault> {
        let src = addr as *const u8;
        let res = unsafe {
            match space {
                AddressSpace::Kernel => bpf_probe_read_kernel_buf(src, dst),
                AddressSpace::User => bpf_probe_read_user_buf(src, dst),
            }
        };
        res.map_err(|_| ReadFault)
    }
}

impl TaskInfo for Kernel {
    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN])
    }

    #[inline(always)]
    fn ktime_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }
}

#[inline(always)]
fn config() -> CaptureConfig {
    unsafe { core::ptr::read_volatile(&CAPTURE_CONFIG) }
}

#[inline(always)]
fn call_args(ctx: &ProbeContext) -> Result<CallArgs, u32> {
    let sock: u64 = ctx.arg(0).ok_or(0u32)?;
    let msg: u64 = ctx.arg(1).ok_or(0u32)?;
    let size: u64 = ctx.arg(2).ok_or(0u32)?;
    Ok(CallArgs { sock, msg, size })
}

/// Run the entry pipeline into `slot` and submit the record.
#[inline(always)]
fn emit<C: EbpfContext, E: SampledEvent + WireRecord>(
    ctx: &C,
    slot: &PerCpuArray<E>,
    cfg: &CaptureConfig,
    call: &CallArgs,
    direction: Direction,
) -> Result<Identity, u32> {
    let ptr = slot.get_ptr_mut(0).ok_or(0u32)?;
    let record = unsafe { &mut *ptr };
    let id = capture(&Kernel, cfg, call, direction, record).map_err(|_| 0u32)?;
    EVENTS.output(ctx, record.as_bytes(), 0);
    Ok(id)
}

#[inline(always)]
fn emit_minimal<C: EbpfContext>(
    ctx: &C,
    cfg: &CaptureConfig,
    call: &CallArgs,
    direction: Direction,
) -> Result<Identity, u32> {
    let ptr = SLOT_MINIMAL.get_ptr_mut(0).ok_or(0u32)?;
    let record = unsafe { &mut *ptr };
    let id = capture_minimal(&Kernel, cfg, call, direction, record).map_err(|_| 0u32)?;
    EVENTS.output(ctx, record.as_bytes(), 0);
    Ok(id)
}

#[inline(always)]
fn finish_recv<C: EbpfContext, E: SampledEvent + WireRecord>(
    ctx: &C,
    slot: &PerCpuArray<E>,
    pending: &PendingRecv,
    ret: u64,
) -> Result<u32, u32> {
    let ptr = slot.get_ptr_mut(0).ok_or(0u32)?;
    let record = unsafe { &mut *ptr };
    complete_recv(&Kernel, pending, ret, record).map_err(|_| 0u32)?;
    EVENTS.output(ctx, record.as_bytes(), 0);
    Ok(0)
}

#[kprobe]
pub fn tcp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_tcp_sendmsg(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

fn try_tcp_sendmsg(ctx: &ProbeContext) -> Result<u32, u32> {
    let cfg = config();
    let call = call_args(ctx)?;
    let id = match cfg.schema() {
        Some(Schema::V2) => emit(ctx, &SLOT_V2, &cfg, &call, Direction::Send)?,
        Some(Schema::V1) => emit(ctx, &SLOT_V1, &cfg, &call, Direction::Send)?,
        Some(Schema::Minimal) => emit_minimal(ctx, &cfg, &call, Direction::Send)?,
        None => return Ok(0),
    };

    let key = Kernel.pid_tgid();
    INFLIGHT_SENDS
        .insert(&key, &track_send(&id), 0)
        .map_err(|_| 0u32)?;
    Ok(0)
}

#[kretprobe]
pub fn tcp_sendmsg_ret(ctx: RetProbeContext) -> u32 {
    match try_tcp_sendmsg_ret(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

fn try_tcp_sendmsg_ret(ctx: &RetProbeContext) -> Result<u32, u32> {
    let key = Kernel.pid_tgid();
    let inflight = unsafe { INFLIGHT_SENDS.get(&key) }.copied().ok_or(0u32)?;
    let _ = INFLIGHT_SENDS.remove(&key);

    let ret: u64 = ctx.ret().ok_or(0u32)?;
    let done = complete_send(&Kernel, &inflight, ret).map_err(|_| 0u32)?;
    if done.transferred < done.requested {
        debug!(
            ctx,
            "short send: pid {} {}/{} bytes", done.pid, done.transferred, done.requested
        );
    }
    COMPLETIONS.output(ctx, &done, 0);
    Ok(0)
}

#[kprobe]
pub fn tcp_recvmsg(ctx: ProbeContext) -> u32 {
    match try_tcp_recvmsg(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

fn try_tcp_recvmsg(ctx: &ProbeContext) -> Result<u32, u32> {
    let cfg = config();
    let call = call_args(ctx)?;
    let pending = match cfg.schema() {
        Some(Schema::V2) => begin_recv(&Kernel, &cfg, &call, true),
        Some(Schema::V1) => begin_recv(&Kernel, &cfg, &call, false),
        // Nothing to sample, so there is no reason to wait for the return.
        Some(Schema::Minimal) => {
            emit_minimal(ctx, &cfg, &call, Direction::Recv)?;
            return Ok(0);
        }
        None => return Ok(0),
    }
    .map_err(|_| 0u32)?;

    let key = Kernel.pid_tgid();
    PENDING_RECVS
        .insert(&key, &pending, 0)
        .map_err(|_| 0u32)?;
    Ok(0)
}

#[kretprobe]
pub fn tcp_recvmsg_ret(ctx: RetProbeContext) -> u32 {
    match try_tcp_recvmsg_ret(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

fn try_tcp_recvmsg_ret(ctx: &RetProbeContext) -> Result<u32, u32> {
    let key = Kernel.pid_tgid();
    let pending = unsafe { PENDING_RECVS.get(&key) }.copied().ok_or(0u32)?;
    let _ = PENDING_RECVS.remove(&key);

    let ret: u64 = ctx.ret().ok_or(0u32)?;
    match config().schema() {
        Some(Schema::V2) => finish_recv(ctx, &SLOT_V2, &pending, ret),
        Some(Schema::V1) => finish_recv(ctx, &SLOT_V1, &pending, ret),
        _ => Ok(0),
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

use crate::TASK_COMM_LEN;

/// Which address space a probe read targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    Kernel,
    User,
}

/// A probe read that could not be satisfied. Never fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadFault;

/// Fixed-size, fault-tolerant copy out of memory the probe does not own.
///
/// `N` is always a compile-time constant: the verifier rejects reads whose
/// size depends on runtime data. In the kernel this is
/// `bpf_probe_read_{kernel,user}`.
pub trait BoundedReader {
    fn read<const N: usize>(
        &self,
        space: AddressSpace,
        addr: u64,
        dst: &mut [u8; N],
    ) -> Result<(), ReadFault>;

    #[inline(always)]
    fn read_u8(&self, space: AddressSpace, addr: u64) -> Result<u8, ReadFault> {
        let mut buf = [0u8; 1];
        self.read(space, addr, &mut buf)?;
        Ok(buf[0])
    }

    #[inline(always)]
    fn read_u16(&self, space: AddressSpace, addr: u64) -> Result<u16, ReadFault> {
        let mut buf = [0u8; 2];
        self.read(space, addr, &mut buf)?;
        Ok(u16::from_ne_bytes(buf))
    }

    #[inline(always)]
    fn read_u32(&self, space: AddressSpace, addr: u64) -> Result<u32, ReadFault> {
        let mut buf = [0u8; 4];
        self.read(space, addr, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    #[inline(always)]
    fn read_u64(&self, space: AddressSpace, addr: u64) -> Result<u64, ReadFault> {
        let mut buf = [0u8; 8];
        self.read(space, addr, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

/// Identity of the task the probe fired in.
pub trait TaskInfo {
    fn pid_tgid(&self) -> u64;

    /// Command name, zero padded. A failed lookup yields all zeroes.
    fn comm(&self) -> [u8; TASK_COMM_LEN];

    /// Monotonic clock in nanoseconds.
    fn ktime_ns(&self) -> u64;

    #[inline(always)]
    fn tgid(&self) -> u64 {
        self.pid_tgid() >> 32
    }
}

/// Everything a pipeline stage may ask of its environment.
pub trait Host: BoundedReader + TaskInfo {}

impl<T: BoundedReader + TaskInfo> Host for T {}

//! In-memory stand-in for the kernel helpers, for host-side tests.

use crate::{
    reader::{AddressSpace, BoundedReader, ReadFault, TaskInfo},
    KernelLayout, AF_INET, TASK_COMM_LEN,
};

struct Region {
    space: AddressSpace,
    base: u64,
    bytes: Vec<u8>,
}

pub struct FakeHost {
    comm: [u8; TASK_COMM_LEN],
    now: u64,
    regions: Vec<Region>,
    next_kernel: u64,
    next_user: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct SockSpec {
    pub family: u16,
    pub addr: [u8; 4],
    pub port: u16,
}

impl SockSpec {
    pub fn ipv4(addr: [u8; 4], port: u16) -> Self {
        Self {
            family: AF_INET,
            addr,
            port,
        }
    }
}

impl FakeHost {
    pub const TGID: u64 = 4321;
    pub const TID: u64 = 4325;
    pub const NOW: u64 = 1_000_000_000;

    pub fn new(name: &[u8]) -> Self {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..name.len()].copy_from_slice(name);
        Self {
            comm,
            now: Self::NOW,
            regions: Vec::new(),
            next_kernel: 0xffff_8880_0000_0000,
            next_user: 0x7f00_0000_0000,
        }
    }

    pub fn advance_clock(&mut self, ns: u64) {
        self.now += ns;
    }

    fn alloc(&mut self, space: AddressSpace, bytes: Vec<u8>) -> u64 {
        let next = match space {
            AddressSpace::Kernel => &mut self.next_kernel,
            AddressSpace::User => &mut self.next_user,
        };
        let base = *next;
        // Leave an unmapped gap after every region.
        *next += (bytes.len() as u64 + 0x1fff) & !0xfff;
        self.regions.push(Region { space, base, bytes });
        base
    }

    fn region_mut(&mut self, space: AddressSpace, addr: u64) -> &mut Region {
        self.regions
            .iter_mut()
            .find(|r| r.space == space && addr >= r.base && addr < r.base + r.bytes.len() as u64)
            .expect("address not mapped")
    }

    fn write(&mut self, space: AddressSpace, addr: u64, data: &[u8]) {
        let region = self.region_mut(space, addr);
        let off = (addr - region.base) as usize;
        region.bytes[off..off + data.len()].copy_from_slice(data);
    }

    pub fn write_user(&mut self, addr: u64, data: &[u8]) {
        self.write(AddressSpace::User, addr, data);
    }

    pub fn add_sock(&mut self, spec: SockSpec) -> u64 {
        let layout = KernelLayout::DEFAULT;
        let mut sk = vec![0u8; 64];
        let fam = layout.sk_family as usize;
        sk[fam..fam + 2].copy_from_slice(&spec.family.to_ne_bytes());
        let daddr = layout.sk_daddr as usize;
        sk[daddr..daddr + 4].copy_from_slice(&spec.addr);
        let dport = layout.sk_dport as usize;
        sk[dport..dport + 2].copy_from_slice(&spec.port.to_be_bytes());
        self.alloc(AddressSpace::Kernel, sk)
    }

    fn add_msg(&mut self, iter_type: u8, offset: u64, ptr: u64, count: u64, nr_segs: u64) -> u64 {
        let layout = KernelLayout::DEFAULT;
        let base = layout.msg_iter as usize;
        let mut msg = vec![0u8; base + 64];
        msg[base + layout.iter_type as usize] = iter_type;
        let mut put = |field: u16, value: u64| {
            let at = base + field as usize;
            msg[at..at + 8].copy_from_slice(&value.to_ne_bytes());
        };
        put(layout.iter_offset, offset);
        put(layout.iter_ptr, ptr);
        put(layout.iter_count, count);
        put(layout.iter_nr_segs, nr_segs);
        self.alloc(AddressSpace::Kernel, msg)
    }

    /// A `msghdr` whose iterator is a single user buffer holding `body`,
    /// `offset` bytes of which are already consumed.
    pub fn add_ubuf_msg(&mut self, body: &[u8], offset: u64) -> u64 {
        let ubuf = self.alloc(AddressSpace::User, body.to_vec());
        let layout = KernelLayout::DEFAULT;
        self.add_msg(layout.iter_ubuf, offset, ubuf, body.len() as u64 - offset, 0)
    }

    /// A `msghdr` over an `iovec` (user) or `kvec` (kernel) array.
    pub fn add_iovec_msg(&mut self, segs: &[&[u8]], offset: u64, kernel: bool) -> u64 {
        let space = if kernel {
            AddressSpace::Kernel
        } else {
            AddressSpace::User
        };
        let mut table = Vec::new();
        let mut total = 0u64;
        for seg in segs {
            let base = self.alloc(space, seg.to_vec());
            table.extend_from_slice(&base.to_ne_bytes());
            table.extend_from_slice(&(seg.len() as u64).to_ne_bytes());
            total += seg.len() as u64;
        }
        let table = self.alloc(AddressSpace::Kernel, table);
        let layout = KernelLayout::DEFAULT;
        let iter_type = if kernel {
            layout.iter_kvec
        } else {
            layout.iter_iovec
        };
        self.add_msg(iter_type, offset, table, total - offset, segs.len() as u64)
    }

    fn msg_field(&self, msg: u64, field: u16) -> u64 {
        let layout = KernelLayout::DEFAULT;
        self.read_u64(AddressSpace::Kernel, msg + layout.msg_iter as u64 + field as u64)
            .expect("msg not mapped")
    }

    /// Shrink the user buffer behind a ubuf `msghdr` so that reads past
    /// `len` bytes fault.
    pub fn truncate_user_region(&mut self, msg: u64, len: usize) {
        let ptr = self.msg_field(msg, KernelLayout::DEFAULT.iter_ptr);
        self.region_mut(AddressSpace::User, ptr).bytes.truncate(len);
    }

    pub fn set_iter_type(&mut self, msg: u64, iter_type: u8) {
        let layout = KernelLayout::DEFAULT;
        let addr = msg + layout.msg_iter as u64 + layout.iter_type as u64;
        self.write(AddressSpace::Kernel, addr, &[iter_type]);
    }
}

impl BoundedReader for FakeHost {
    fn read<const N: usize>(
        &self,
        space: AddressSpace,
        addr: u64,
        dst: &mut [u8; N],
    ) -> Result<(), ReadFault> {
        let end = addr.checked_add(N as u64).ok_or(ReadFault)?;
        let region = self
            .regions
            .iter()
            .find(|r| r.space == space && addr >= r.base && end <= r.base + r.bytes.len() as u64)
            .ok_or(ReadFault)?;
        let off = (addr - region.base) as usize;
        dst.copy_from_slice(&region.bytes[off..off + N]);
        Ok(())
    }
}

impl TaskInfo for FakeHost {
    fn pid_tgid(&self) -> u64 {
        (Self::TGID << 32) | Self::TID
    }

    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        self.comm
    }

    fn ktime_ns(&self) -> u64 {
        self.now
    }
}

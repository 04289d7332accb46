//! Payload sampling out of a `msghdr`'s `iov_iter`.
//!
//! The sampler only ever issues fixed-size reads and every loop has a
//! constant trip count. A segment is copied as whole 64-byte chunks followed
//! by a power-of-two tail (32, 16, 8, 4, 2, 1), which covers any length up
//! to the sample capacity without a data-dependent read size.
//!
//! A failed read stops the copy where it is: the bytes already copied stay,
//! and the event is still emitted.

use crate::{
    reader::{AddressSpace, BoundedReader},
    KernelLayout, V2_SAMPLE_LEN,
};

/// Segments visited before the walk gives up.
pub const MAX_SEGMENTS: usize = 4;

/// `struct iovec` / `struct kvec`: base pointer then length.
const SEGMENT_DESC_LEN: u64 = 16;

const CHUNK: usize = 64;

/// Largest `out` buffer the chunk loop is sized for.
const MAX_SAMPLE_LEN: usize = V2_SAMPLE_LEN;

/// How the bytes of a transfer are laid out.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterKind {
    /// Nothing the sampler can follow (bvec, xarray, discard, unreadable).
    Unsupported = 0,
    /// One contiguous user buffer.
    UserBuf = 1,
    /// Array of user `iovec`s.
    UserSegments = 2,
    /// Array of kernel `kvec`s.
    KernelSegments = 3,
}

/// Copy of the parts of `iov_iter` the sampler needs.
///
/// Taken at probe entry; the receive path keeps it until the call returns,
/// by which time the live iterator has been advanced past the data.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterSnapshot {
    pub kind: u8,
    pub _pad: [u8; 7],
    /// Bytes already consumed from the first segment.
    pub offset: u64,
    /// `ubuf` for [`IterKind::UserBuf`], otherwise the segment array.
    pub ptr: u64,
    /// Bytes remaining in the iterator.
    pub count: u64,
    pub nr_segs: u64,
}

impl IterSnapshot {
    pub const EMPTY: IterSnapshot = IterSnapshot {
        kind: IterKind::Unsupported as u8,
        _pad: [0; 7],
        offset: 0,
        ptr: 0,
        count: 0,
        nr_segs: 0,
    };

    pub fn kind(&self) -> IterKind {
        match self.kind {
            1 => IterKind::UserBuf,
            2 => IterKind::UserSegments,
            3 => IterKind::KernelSegments,
            _ => IterKind::Unsupported,
        }
    }
}

/// Snapshot `msg->msg_iter`. Any read failure yields an unsupported
/// snapshot, which samples nothing.
#[inline(always)]
pub fn snapshot_iter<R: BoundedReader>(reader: &R, msg: u64, layout: &KernelLayout) -> IterSnapshot {
    if msg == 0 {
        return IterSnapshot::EMPTY;
    }
    let iter = msg + layout.msg_iter as u64;
    let k = AddressSpace::Kernel;

    let Ok(iter_type) = reader.read_u8(k, iter + layout.iter_type as u64) else {
        return IterSnapshot::EMPTY;
    };
    let kind = if iter_type == layout.iter_ubuf {
        IterKind::UserBuf
    } else if iter_type == layout.iter_iovec {
        IterKind::UserSegments
    } else if iter_type == layout.iter_kvec {
        IterKind::KernelSegments
    } else {
        return IterSnapshot::EMPTY;
    };

    let (Ok(offset), Ok(ptr), Ok(count)) = (
        reader.read_u64(k, iter + layout.iter_offset as u64),
        reader.read_u64(k, iter + layout.iter_ptr as u64),
        reader.read_u64(k, iter + layout.iter_count as u64),
    ) else {
        return IterSnapshot::EMPTY;
    };
    let nr_segs = match kind {
        IterKind::UserBuf => 1,
        _ => match reader.read_u64(k, iter + layout.iter_nr_segs as u64) {
            Ok(n) => n,
            Err(_) => return IterSnapshot::EMPTY,
        },
    };

    IterSnapshot {
        kind: kind as u8,
        _pad: [0; 7],
        offset,
        ptr,
        count,
        nr_segs,
    }
}

/// Copy up to `limit` bytes of the transfer described by `iter` into the
/// front of `out`. Returns the number of bytes copied.
#[inline(always)]
pub fn sample<R: BoundedReader>(reader: &R, iter: &IterSnapshot, limit: u64, out: &mut [u8]) -> usize {
    let want = limit.min(iter.count).min(out.len() as u64) as usize;
    if want == 0 {
        return 0;
    }
    match iter.kind() {
        IterKind::UserBuf => copy_region(
            reader,
            AddressSpace::User,
            iter.ptr.wrapping_add(iter.offset),
            want,
            out,
            0,
        ),
        IterKind::UserSegments => walk_segments(reader, AddressSpace::User, iter, want, out),
        IterKind::KernelSegments => walk_segments(reader, AddressSpace::Kernel, iter, want, out),
        IterKind::Unsupported => 0,
    }
}

#[inline(always)]
fn walk_segments<R: BoundedReader>(
    reader: &R,
    space: AddressSpace,
    iter: &IterSnapshot,
    want: usize,
    out: &mut [u8],
) -> usize {
    let mut copied = 0usize;
    let mut skip = iter.offset;

    for seg in 0..MAX_SEGMENTS {
        if copied >= want || seg as u64 >= iter.nr_segs {
            break;
        }
        // The segment array itself always lives in kernel memory.
        let desc = iter.ptr + seg as u64 * SEGMENT_DESC_LEN;
        let Ok(base) = reader.read_u64(AddressSpace::Kernel, desc) else {
            break;
        };
        let Ok(len) = reader.read_u64(AddressSpace::Kernel, desc + 8) else {
            break;
        };
        if skip >= len {
            skip -= len;
            continue;
        }

        let take = (len - skip).min((want - copied) as u64) as usize;
        let n = copy_region(reader, space, base.wrapping_add(skip), take, out, copied);
        copied += n;
        skip = 0;
        if n < take {
            break;
        }
    }
    copied
}

/// Copy `len` bytes from `src` to `out[at..]` using constant-size reads.
#[inline(always)]
fn copy_region<R: BoundedReader>(
    reader: &R,
    space: AddressSpace,
    src: u64,
    len: usize,
    out: &mut [u8],
    at: usize,
) -> usize {
    let mut done = 0usize;

    for _ in 0..MAX_SAMPLE_LEN / CHUNK {
        if len - done < CHUNK {
            break;
        }
        if !copy_exact::<CHUNK, R>(reader, space, src + done as u64, out, at + done) {
            break;
        }
        done += CHUNK;
    }

    // Descending power-of-two reads finish the tail. After a failed chunk
    // they recover the readable bytes that precede the fault.
    let mut rest = (len - done).min(CHUNK - 1);
    macro_rules! tail {
        ($n:literal) => {
            if rest >= $n {
                if copy_exact::<$n, R>(reader, space, src + done as u64, out, at + done) {
                    done += $n;
                    rest -= $n;
                }
            }
        };
    }
    tail!(32);
    tail!(16);
    tail!(8);
    tail!(4);
    tail!(2);
    tail!(1);

    done
}

#[inline(always)]
fn copy_exact<const N: usize, R: BoundedReader>(
    reader: &R,
    space: AddressSpace,
    src: u64,
    out: &mut [u8],
    at: usize,
) -> bool {
    let Some(dst) = out.get_mut(at..at + N) else {
        return false;
    };
    let Ok(dst) = <&mut [u8; N]>::try_from(dst) else {
        return false;
    };
    reader.read(space, src, dst).is_ok()
}

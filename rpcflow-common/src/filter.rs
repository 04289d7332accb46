//! Process and admission filters. All checks are pure and run before the
//! scratch slot is touched, so a rejected call has no side effects.

use crate::{CaptureConfig, MAX_DATA_LEN, MAX_PORTS, TASK_COMM_LEN};

/// Prefix comparison of the task name against `cfg.target_comm`.
///
/// Only the first `target_len` bytes are compared, so with the default
/// target "node" a task called "nodemon" passes too. Set `exact_comm` to
/// require the name to end right after the prefix.
#[inline(always)]
pub fn comm_matches(comm: &[u8; TASK_COMM_LEN], cfg: &CaptureConfig) -> bool {
    let len = cfg.target_len as usize;
    for i in 0..TASK_COMM_LEN {
        if i >= len {
            break;
        }
        if comm[i] != cfg.target_comm[i] {
            return false;
        }
    }
    if cfg.exact_comm != 0 && len < TASK_COMM_LEN && comm[len] != 0 {
        return false;
    }
    true
}

/// `0 < size <= 65536`.
#[inline(always)]
pub fn size_admitted(size: u64) -> bool {
    size > 0 && size <= MAX_DATA_LEN
}

#[inline(always)]
pub fn port_allowed(port: u16, cfg: &CaptureConfig) -> bool {
    let count = cfg.port_count as usize;
    for i in 0..MAX_PORTS {
        if i >= count {
            break;
        }
        if cfg.ports[i] == port {
            return true;
        }
    }
    false
}

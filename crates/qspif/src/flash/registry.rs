//! Chip-select registry
//!
//! Process-wide table enforcing at most one driver instance per chip-select
//! line, bounded by [`MAX_ACTIVE_DEVICES`](crate::flash::params::MAX_ACTIVE_DEVICES).
//! The registry lock is held only for the table scan, never across device
//! I/O.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::flash::params::MAX_ACTIVE_DEVICES;

/// Identifier of the chip-select line a device hangs off
///
/// Any value except `u32::MAX`, which the registry reserves as its empty-slot
/// sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipSelect(pub u32);

/// Outcome of claiming a chip select at construction time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    /// Slot claimed; the instance may initialize
    Claimed,
    /// Another instance already owns this chip select
    Duplicate,
    /// Registry capacity reached
    CapacityExceeded,
}

const CS_NONE: u32 = u32::MAX;

const SLOT_INIT: AtomicU32 = AtomicU32::new(CS_NONE);
static SLOTS: [AtomicU32; MAX_ACTIVE_DEVICES] = [SLOT_INIT; MAX_ACTIVE_DEVICES];
static LOCK: AtomicBool = AtomicBool::new(false);

fn with_lock<T>(f: impl FnOnce() -> T) -> T {
    while LOCK
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }
    let result = f();
    LOCK.store(false, Ordering::Release);
    result
}

/// Claim `cs` for a new driver instance
pub fn claim(cs: ChipSelect) -> ClaimStatus {
    with_lock(|| {
        let mut free = None;
        let mut duplicate = false;
        for (index, slot) in SLOTS.iter().enumerate() {
            match slot.load(Ordering::Relaxed) {
                CS_NONE => free = free.or(Some(index)),
                id if id == cs.0 => duplicate = true,
                _ => {}
            }
        }

        if free.is_none() && !duplicate {
            return ClaimStatus::CapacityExceeded;
        }
        if duplicate {
            return ClaimStatus::Duplicate;
        }

        if let Some(index) = free {
            SLOTS[index].store(cs.0, Ordering::Relaxed);
        }
        ClaimStatus::Claimed
    })
}

/// Release a previously claimed chip select
pub fn release(cs: ChipSelect) {
    with_lock(|| {
        for slot in &SLOTS {
            if slot.load(Ordering::Relaxed) == cs.0 {
                slot.store(CS_NONE, Ordering::Relaxed);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is process-wide state shared by every test in the
    // binary, so this single test exercises the whole lifecycle with ids
    // no other test uses.
    #[test]
    fn claim_release_lifecycle() {
        let a = ChipSelect(0x71000);
        let b = ChipSelect(0x71001);

        assert_eq!(claim(a), ClaimStatus::Claimed);
        assert_eq!(claim(a), ClaimStatus::Duplicate);
        assert_eq!(claim(b), ClaimStatus::Claimed);

        release(a);
        assert_eq!(claim(a), ClaimStatus::Claimed);

        release(a);
        release(b);
    }
}

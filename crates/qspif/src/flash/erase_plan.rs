//! Erase planning
//!
//! For an arbitrary validated (addr, size) pair the planner walks the region
//! map and selects, per step, the largest erase type the current region
//! supports that fits both the residual size and the region boundary. The
//! planner only decides; the facade executes each step with the write-enable
//! and ready-poll protocol around it.

use crate::error::{Error, Result};
use crate::flash::params::{DeviceParams, EraseTypes};

/// One erase command the facade must issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseStep {
    /// Erase instruction opcode
    pub instruction: u8,
    /// Byte address the instruction targets
    pub addr: u64,
    /// Bytes this step accounts for
    pub len: u64,
}

/// Validate an erase request before planning
///
/// Both ends must be aligned to the erase granularity of the region they
/// fall into, and the range must fit the device.
pub fn validate(params: &DeviceParams, addr: u64, size: u64) -> Result<()> {
    let end = match addr.checked_add(size) {
        Some(end) if end <= params.device_size_bytes => end,
        _ => {
            log::error!("erase [{:#x}, +{:#x}) exceeds the device size", addr, size);
            return Err(Error::InvalidEraseParams);
        }
    };
    if size == 0 {
        return Ok(());
    }

    let head_erase = params.erase_size_at(addr) as u64;
    let tail_erase = params.erase_size_at(end - 1) as u64;
    if head_erase == 0
        || tail_erase == 0
        || addr % head_erase != 0
        || end % tail_erase != 0
    {
        log::error!("invalid erase: unaligned address {:#x} or size {:#x}", addr, size);
        return Err(Error::InvalidEraseParams);
    }
    Ok(())
}

/// Iterator over the erase commands covering `[addr, addr + size)`
///
/// Inputs must already have passed [`validate`].
pub struct ErasePlan<'a> {
    params: &'a DeviceParams,
    region: usize,
    addr: u64,
    remaining: u64,
}

impl<'a> ErasePlan<'a> {
    /// Plan an erase of `size` bytes starting at `addr`
    pub fn new(params: &'a DeviceParams, addr: u64, size: u64) -> Self {
        let region = params.region_of(addr).unwrap_or(0);
        Self {
            params,
            region,
            addr,
            remaining: size,
        }
    }
}

impl Iterator for ErasePlan<'_> {
    type Item = EraseStep;

    fn next(&mut self) -> Option<EraseStep> {
        if self.remaining == 0 {
            return None;
        }
        let region = self.params.regions.get(self.region)?;

        let index = next_largest_erase_type(
            self.params,
            region.erase_types,
            self.remaining,
            self.addr,
            region.high_boundary,
        )?;
        let erase = self.params.erase_types[index];
        let type_size = erase.size as u64;

        let offset = self.addr % type_size;
        let chunk = (type_size - offset).min(self.remaining);

        let step = EraseStep {
            instruction: erase.instruction,
            addr: self.addr,
            len: chunk,
        };

        self.addr += chunk;
        self.remaining -= chunk;
        if self.remaining > 0 && self.addr > region.high_boundary {
            self.region += 1;
        }

        Some(step)
    }
}

/// Pick the erase type for the next step
///
/// Scans from the largest type down. A type is chosen when the residual size
/// strictly exceeds it and the region boundary leaves room, or when it fits
/// the residual size exactly at a type-aligned address. Rejected bits are
/// dropped for this step only; when every bit is rejected the smallest
/// supported type mops up the tail.
fn next_largest_erase_type(
    params: &DeviceParams,
    bitfield: EraseTypes,
    size: u64,
    addr: u64,
    boundary: u64,
) -> Option<usize> {
    let mut fallback = None;
    for index in (0..4).rev() {
        if !bitfield.contains(EraseTypes::from_index(index)) {
            continue;
        }
        let erase = params.erase_types[index];
        if !erase.is_supported() {
            continue;
        }
        let type_size = erase.size as u64;
        fallback = Some(index);

        let aligned_exact = size == type_size && addr % type_size == 0;
        if aligned_exact {
            if addr + type_size - 1 <= boundary {
                return Some(index);
            }
        } else if size > type_size && boundary - addr > type_size {
            return Some(index);
        }
    }
    fallback
}

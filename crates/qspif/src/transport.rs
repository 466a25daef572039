//! QSPI transport adapter
//!
//! Frames driver commands for the controller capability. Data reads switch
//! the controller to the discovered best bus mode and restore the default
//! 1-1-1 format afterwards; SFDP reads always run 1-1-1 with a 24-bit
//! address and 8 dummy cycles. Everything else runs in the default format.
//!
//! Before any address-bearing command, the adapter updates the device's
//! extended address register when one was discovered, so 4-byte addresses
//! work on 3-byte-addressing parts.

use crate::error::{Error, Result};
use crate::flash::params::DeviceParams;
use crate::protocol;
use crate::qspi::QspiBus;
use crate::spi::{opcodes, AddressSize, BusFormat};

/// Update the extended address register ahead of an address-bearing command
///
/// The register holds the most significant byte of a 4-byte address; the
/// instruction itself then carries the low 24 bits. A 3-byte-addressing part
/// without the register cannot reach addresses at or above 16 MiB.
fn update_ext_addr_reg<Q: QspiBus>(bus: &mut Q, params: &DeviceParams, addr: u32) -> Result<()> {
    if let Some(instruction) = params.ext_addr_write_inst {
        let msb = [(addr >> 24) as u8];
        protocol::set_write_enable(bus, params)?;
        bus.command_transfer(instruction, None, &msb, &mut [])?;
    } else if params.address_size != AddressSize::FourByte && addr >= (1 << 24) {
        log::error!(
            "address {:#010x} needs 4-byte addressing, which the device does not support",
            addr
        );
        return Err(Error::DeviceError);
    }
    Ok(())
}

/// Send a general command in the default 1-1-1 format
///
/// Used for status, enables, resets and identification.
pub fn send_general<Q: QspiBus>(
    bus: &mut Q,
    params: &DeviceParams,
    instruction: u8,
    addr: Option<u32>,
    tx: &[u8],
    rx: &mut [u8],
) -> Result<()> {
    if let Some(addr) = addr {
        update_ext_addr_reg(bus, params, addr)?;
    }
    bus.command_transfer(instruction, addr, tx, rx)
}

/// Read data in the discovered best bus mode, restoring 1-1-1 afterwards
pub fn send_read<Q: QspiBus>(
    bus: &mut Q,
    params: &DeviceParams,
    addr: u32,
    buf: &mut [u8],
) -> Result<()> {
    update_ext_addr_reg(bus, params, addr)?;

    bus.configure_format(&params.read_format())?;
    let read_result = bus.read(params.read_instruction, None, addr, buf);
    let restore_result = bus.configure_format(&BusFormat::single(params.address_size));

    read_result?;
    restore_result?;
    Ok(())
}

/// Program one page-bounded chunk
///
/// Returns the number of bytes the controller reports written; the caller is
/// responsible for page bounding and for treating a short write as an error.
pub fn send_program<Q: QspiBus>(
    bus: &mut Q,
    params: &DeviceParams,
    addr: u32,
    data: &[u8],
) -> Result<usize> {
    update_ext_addr_reg(bus, params, addr)?;
    bus.write(params.prog_instruction, None, addr, data)
}

/// Issue an erase instruction
///
/// The address is sent with the low 12 bits cleared to match legacy
/// controllers that require 4 KiB alignment on the wire.
pub fn send_erase<Q: QspiBus>(
    bus: &mut Q,
    params: &DeviceParams,
    instruction: u8,
    addr: u32,
) -> Result<()> {
    update_ext_addr_reg(bus, params, addr)?;
    bus.command_transfer(instruction, Some(addr & !0xFFF), &[], &mut [])
}

/// Read SFDP data
///
/// RSFDP requires 1-1-1 with a 24-bit address and 8 dummy cycles regardless
/// of the discovered operating mode; the operating format is restored after.
pub fn send_read_sfdp<Q: QspiBus>(
    bus: &mut Q,
    params: &DeviceParams,
    addr: u32,
    buf: &mut [u8],
) -> Result<()> {
    bus.configure_format(&BusFormat::sfdp())?;
    let read_result = bus.read(opcodes::RDSFDP, None, addr, buf);
    let restore_result = bus.configure_format(&BusFormat::single(params.address_size));

    read_result?;
    restore_result?;
    Ok(())
}

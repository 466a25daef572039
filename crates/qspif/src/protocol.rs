//! JEDEC command sequences shared by the discovery and data paths
//!
//! Every mutating flash transaction funnels through the write-enable and
//! memory-ready protocol in this module. The quad-enable, QPI-enable,
//! 4-byte-addressing and block-protection sequences applied during discovery
//! live here as well.

use crate::error::{Error, Result};
use crate::flash::params::{DeviceParams, IS_MEM_READY_MAX_RETRIES};
use crate::qspi::QspiBus;
use crate::sfdp::types::{FourByteMode, QpiEnableSequence, QuadEnableMethod, SoftResetKind};
use crate::spi::{opcodes, AddressSize};
use crate::transport;

/// JEDEC manufacturer id of SST, whose parts power up block-protected
const MANUFACTURER_SST: u8 = 0xBF;

/// Register address used by the addressed QPI configuration dialect
const QPI_CONFIG_REG_ADDR: u32 = 0x0080_0003;

/// Read status register 1
pub fn read_status1<Q: QspiBus>(bus: &mut Q, params: &DeviceParams) -> Result<u8> {
    let mut buf = [0u8; 1];
    transport::send_general(bus, params, opcodes::RDSR, None, &[], &mut buf)?;
    Ok(buf[0])
}

/// Read status register 2 using the discovered SR2 read opcode
pub fn read_status2<Q: QspiBus>(bus: &mut Q, params: &DeviceParams) -> Result<u8> {
    let mut buf = [0u8; 1];
    transport::send_general(bus, params, params.read_status2_inst, None, &[], &mut buf)?;
    Ok(buf[0])
}

/// Read SR1 and SR2
pub fn read_status_registers<Q: QspiBus>(bus: &mut Q, params: &DeviceParams) -> Result<[u8; 2]> {
    Ok([read_status1(bus, params)?, read_status2(bus, params)?])
}

/// Write SR1 and SR2 using the device's dialect
///
/// Without a dedicated SR2 write opcode, SR2 rides as the second byte of a
/// two-byte SR1 write under a single write enable; otherwise each register
/// is written by its own command under its own write enable.
pub fn write_status_registers<Q: QspiBus>(
    bus: &mut Q,
    params: &DeviceParams,
    regs: [u8; 2],
) -> Result<()> {
    match params.write_status2_inst {
        None => {
            set_write_enable(bus, params)?;
            transport::send_general(bus, params, opcodes::WRSR, None, &regs, &mut [])?;
        }
        Some(write_sr2) => {
            set_write_enable(bus, params)?;
            transport::send_general(bus, params, opcodes::WRSR, None, &regs[..1], &mut [])?;
            set_write_enable(bus, params)?;
            transport::send_general(bus, params, write_sr2, None, &regs[1..], &mut [])?;
        }
    }
    Ok(())
}

/// Issue Write Enable and verify the WEL latch took
///
/// The device clears WEL on its own when the following mutating command
/// completes, so this must run before every program, erase and
/// status-register write.
pub fn set_write_enable<Q: QspiBus>(bus: &mut Q, params: &DeviceParams) -> Result<()> {
    transport::send_general(bus, params, opcodes::WREN, None, &[], &mut [])?;
    wait_ready(bus, params)?;

    let sr1 = read_status1(bus, params)?;
    if sr1 & opcodes::SR1_WEL == 0 {
        log::error!("write enable did not latch, status register 1: {:#04x}", sr1);
        return Err(Error::WriteEnableFailed);
    }
    Ok(())
}

/// Issue Write Disable
pub fn write_disable<Q: QspiBus>(bus: &mut Q, params: &DeviceParams) -> Result<()> {
    transport::send_general(bus, params, opcodes::WRDI, None, &[], &mut [])
}

/// Poll SR1 until the write-in-progress bit clears
///
/// Sleeps 1 ms between polls, up to [`IS_MEM_READY_MAX_RETRIES`] attempts.
pub fn wait_ready<Q: QspiBus>(bus: &mut Q, params: &DeviceParams) -> Result<()> {
    for _ in 0..IS_MEM_READY_MAX_RETRIES {
        bus.delay_ms(1);
        let sr1 = read_status1(bus, params)?;
        if sr1 & opcodes::SR1_WIP == 0 {
            return Ok(());
        }
    }
    log::error!(
        "memory not ready: WIP still set after {} polls",
        IS_MEM_READY_MAX_RETRIES
    );
    Err(Error::ReadyFailed)
}

/// Read the 3-byte JEDEC manufacturer and device id
pub fn read_jedec_id<Q: QspiBus>(bus: &mut Q, params: &DeviceParams) -> Result<[u8; 3]> {
    let mut id = [0u8; 3];
    transport::send_general(bus, params, opcodes::RDID, None, &[], &mut id)?;
    Ok(id)
}

/// Issue the soft reset protocol the BPT advertised, then wait for ready
pub fn soft_reset<Q: QspiBus>(
    bus: &mut Q,
    params: &DeviceParams,
    kind: SoftResetKind,
) -> Result<()> {
    match kind {
        SoftResetKind::ResetF0 => {
            transport::send_general(bus, params, opcodes::RST_F0, None, &[], &mut [])?;
        }
        SoftResetKind::EnableReset => {
            transport::send_general(bus, params, opcodes::RSTEN, None, &[], &mut [])?;
            transport::send_general(bus, params, opcodes::RST, None, &[], &mut [])?;
        }
    }
    wait_ready(bus, params)
}

/// Apply the quad-enable procedure and verify the effect is observable
///
/// QER method 3 also switches the SR2 opcodes to the 0x3F/0x3E dialect.
pub fn set_quad_enable<Q: QspiBus>(
    bus: &mut Q,
    params: &mut DeviceParams,
    method: QuadEnableMethod,
) -> Result<()> {
    let mut setup = [0u8; 2];
    match method {
        QuadEnableMethod::None => {
            log::debug!("device has no QE bit, continuing on the selected read instruction");
            return Ok(());
        }
        QuadEnableMethod::Sr2Bit1 => setup[1] = 1 << 1,
        QuadEnableMethod::Sr1Bit6 => setup[0] = 1 << 6,
        QuadEnableMethod::Sr1Bit7 => {
            setup[0] = 1 << 7;
            params.read_status2_inst = opcodes::RDSR2_3F;
            params.write_status2_inst = Some(opcodes::WRSR2_3E);
        }
        QuadEnableMethod::Unsupported => {
            log::warn!("unsupported quad-enable requirement, leaving QE alone");
            return Ok(());
        }
    }

    let mut regs = read_status_registers(bus, params)?;
    regs[0] |= setup[0];
    regs[1] |= setup[1];
    write_status_registers(bus, params, regs)?;
    wait_ready(bus, params)?;

    let regs = read_status_registers(bus, params)?;
    if ((regs[0] & setup[0]) | (regs[1] & setup[1])) == 0 {
        log::error!("quad-enable bit did not stick");
        return Err(Error::DeviceError);
    }
    Ok(())
}

/// Apply the 4-4-4 mode enable sequence the BPT advertised
pub fn set_qpi_enabled<Q: QspiBus>(
    bus: &mut Q,
    params: &DeviceParams,
    sequence: QpiEnableSequence,
) -> Result<()> {
    match sequence {
        QpiEnableSequence::Instruction38 => {
            transport::send_general(bus, params, opcodes::EQIO, None, &[], &mut [])?;
        }
        QpiEnableSequence::Instruction35 => {
            transport::send_general(bus, params, opcodes::EQIO_35, None, &[], &mut [])?;
        }
        QpiEnableSequence::ConfigReg71 => {
            let mut cfg = [0u8; 1];
            transport::send_general(
                bus,
                params,
                opcodes::RDCR_65,
                Some(QPI_CONFIG_REG_ADDR),
                &[],
                &mut cfg,
            )?;
            cfg[0] |= 1 << 6;
            transport::send_general(
                bus,
                params,
                opcodes::WRCR_71,
                Some(QPI_CONFIG_REG_ADDR),
                &cfg,
                &mut [],
            )?;
        }
        QpiEnableSequence::ConfigReg61 => {
            let mut cfg = [0u8; 1];
            transport::send_general(bus, params, opcodes::RDCR_65, None, &[], &mut cfg)?;
            cfg[0] &= 0x7F;
            transport::send_general(bus, params, opcodes::WRCR_61, None, &cfg, &mut [])?;
        }
        QpiEnableSequence::Unsupported => {
            log::warn!("unsupported 4-4-4 enable sequence");
        }
    }
    Ok(())
}

/// Enable 4-byte addressing using the method the BPT advertised
///
/// Updates the descriptor's address size, or records the extended-address
/// register write opcode when the device keeps 3-byte instructions.
pub fn enable_four_byte_addressing<Q: QspiBus>(
    bus: &mut Q,
    params: &mut DeviceParams,
    mode: FourByteMode,
) -> Result<()> {
    match mode {
        FourByteMode::AlwaysOn => {
            params.address_size = AddressSize::FourByte;
        }
        FourByteMode::InstructionB7 => {
            transport::send_general(bus, params, opcodes::EN4B, None, &[], &mut [])?;
            params.address_size = AddressSize::FourByte;
        }
        FourByteMode::WrenInstructionB7 => {
            set_write_enable(bus, params)?;
            transport::send_general(bus, params, opcodes::EN4B, None, &[], &mut [])?;
            params.address_size = AddressSize::FourByte;
        }
        FourByteMode::ConfigRegister => {
            let mut cfg = [0u8; 1];
            transport::send_general(bus, params, opcodes::RDCR_4BA, None, &[], &mut cfg)?;
            cfg[0] |= 0x01;
            set_write_enable(bus, params)?;
            transport::send_general(bus, params, opcodes::WRCR_4BA, None, &cfg, &mut [])?;
            params.address_size = AddressSize::FourByte;
        }
        FourByteMode::BankRegister => {
            transport::send_general(bus, params, opcodes::BRWR, None, &[0x80], &mut [])?;
            params.address_size = AddressSize::FourByte;
        }
        FourByteMode::ExtendedAddressReg => {
            params.ext_addr_write_inst = Some(opcodes::WREAR);
        }
        FourByteMode::Unsupported => {
            log::debug!("4-byte addressing not supported, staying on 3-byte addressing");
        }
    }
    Ok(())
}

/// Clear power-on block protection
///
/// SST parts need the global unprotect instruction; everything else gets
/// every SR1 bit except WIP and WEL cleared.
pub fn clear_block_protection<Q: QspiBus>(bus: &mut Q, params: &DeviceParams) -> Result<()> {
    wait_ready(bus, params)?;

    let id = read_jedec_id(bus, params)?;
    log::debug!("vendor device id: {:02x} {:02x} {:02x}", id[0], id[1], id[2]);

    if id[0] == MANUFACTURER_SST {
        set_write_enable(bus, params)?;
        transport::send_general(bus, params, opcodes::ULBPR, None, &[], &mut [])?;
    } else {
        let mut regs = read_status_registers(bus, params)?;
        regs[0] &= opcodes::SR1_WIP | opcodes::SR1_WEL;
        write_status_registers(bus, params, regs)?;
    }

    wait_ready(bus, params)
}

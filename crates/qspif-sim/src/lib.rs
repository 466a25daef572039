//! qspif-sim - In-memory QSPI flash emulator
//!
//! Emulates an SFDP-capable QSPI NOR flash behind the [`qspif::QspiBus`]
//! capability: an SFDP image served by RSFDP, status registers with a WEL
//! latch, page programming with 1-to-0 semantics, a configurable erase
//! opcode map and an extended address register. Every transaction is
//! recorded so tests can assert on the exact command stream.

use qspif::error::{Error, Result};
use qspif::spi::bus::{AddressSize, BusFormat};
use qspif::spi::opcodes;
use qspif::QspiBus;

/// Builder for an SFDP image: header chain, a 16-DWORD Basic Parameters
/// Table and an optional Sector Map Table
///
/// The defaults describe a plain part: 256-byte pages, the 0x66/0x99 soft
/// reset protocol, a legacy 4K erase opcode of 0x20, no fast read modes.
#[derive(Debug, Clone)]
pub struct SfdpBuilder {
    bpt: [u8; 64],
    sector_map: Option<Vec<u8>>,
}

impl SfdpBuilder {
    const BPT_PTR: usize = 0x30;
    const SMT_PTR: usize = 0x80;

    /// Start an image for a device of `size_bytes`
    pub fn new(size_bytes: u64) -> Self {
        let mut bpt = [0u8; 64];
        bpt[1] = 0x20; // legacy 4K erase
        bpt[4..8].copy_from_slice(&((size_bytes * 8 - 1) as u32).to_le_bytes());
        bpt[40] = 0x80; // 2^8 = 256 byte pages
        bpt[61] = 0x10; // reset via 0x66 + 0x99
        Self {
            bpt,
            sector_map: None,
        }
    }

    /// Overwrite the raw density word (bytes 4..8)
    pub fn density_raw(mut self, value: u32) -> Self {
        self.bpt[4..8].copy_from_slice(&value.to_le_bytes());
        self
    }

    /// Describe erase type `index` (0-based); `size` must be a power of two
    pub fn erase_type(mut self, index: usize, size: u32, instruction: u8) -> Self {
        self.bpt[28 + 2 * index] = size.trailing_zeros() as u8;
        self.bpt[29 + 2 * index] = instruction;
        self
    }

    /// The common 4K/32K/64K hierarchy (0x20/0x52/0xD8)
    pub fn standard_erase_types(self) -> Self {
        self.erase_type(0, 4096, 0x20)
            .erase_type(1, 32 * 1024, 0x52)
            .erase_type(2, 64 * 1024, 0xD8)
    }

    /// Advertise 1-4-4 fast read; `cycles` is the raw mode/wait byte and
    /// `qer` the 3-bit quad-enable requirement
    pub fn quad_144(mut self, instruction: u8, cycles: u8, qer: u8) -> Self {
        self.bpt[2] |= 0x20;
        self.bpt[9] = instruction;
        self.bpt[8] = cycles;
        self.bpt[58] = (qer & 0x07) << 4;
        self
    }

    /// Advertise 1-1-2 fast read
    pub fn dual_112(mut self, instruction: u8, cycles: u8) -> Self {
        self.bpt[2] |= 0x01;
        self.bpt[13] = instruction;
        self.bpt[12] = cycles;
        self
    }

    /// Advertise QPI 4-4-4 with the raw 4-4-4 enable sequence byte
    pub fn qpi_444(mut self, instruction: u8, cycles: u8, enable_seq: u8) -> Self {
        self.bpt[16] |= 0x10;
        self.bpt[27] = instruction;
        self.bpt[26] = cycles;
        self.bpt[56] = enable_seq;
        self
    }

    /// Overwrite the soft reset byte (byte 61)
    pub fn soft_reset_byte(mut self, value: u8) -> Self {
        self.bpt[61] = value;
        self
    }

    /// Overwrite the 4-byte addressing byte (byte 63)
    pub fn four_byte_byte(mut self, value: u8) -> Self {
        self.bpt[63] = value;
        self
    }

    /// Attach a single-descriptor sector map; regions are (size, erase-type
    /// bitfield) pairs and must sum to the device size
    pub fn sector_map(mut self, regions: &[(u64, u8)]) -> Self {
        let mut table = vec![0x03u8, 0x00, (regions.len() - 1) as u8, 0x00];
        for &(size, bitfield) in regions {
            let dword = (((size / 256 - 1) as u32) << 8) | bitfield as u32;
            table.extend_from_slice(&dword.to_le_bytes());
        }
        self.sector_map = Some(table);
        self
    }

    /// Assemble the SFDP image
    pub fn build(self) -> Vec<u8> {
        let end = match &self.sector_map {
            Some(map) => Self::SMT_PTR + map.len(),
            None => Self::BPT_PTR + 64,
        };
        let mut image = vec![0xFFu8; end];

        image[0..4].copy_from_slice(b"SFDP");
        image[4] = 0x06; // minor revision
        image[5] = 0x01; // major revision
        image[6] = if self.sector_map.is_some() { 1 } else { 0 };
        image[7] = 0xFF;

        image[8..16].copy_from_slice(&[
            0x00,
            0x06,
            0x01,
            16,
            Self::BPT_PTR as u8,
            0x00,
            0x00,
            0xFF,
        ]);
        image[Self::BPT_PTR..Self::BPT_PTR + 64].copy_from_slice(&self.bpt);

        if let Some(map) = &self.sector_map {
            image[16..24].copy_from_slice(&[
                0x81,
                0x00,
                0x01,
                (map.len() / 4) as u8,
                Self::SMT_PTR as u8,
                0x00,
                0x00,
                0xFF,
            ]);
            image[Self::SMT_PTR..Self::SMT_PTR + map.len()].copy_from_slice(map);
        }
        image
    }
}

/// Configuration for the emulated flash
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// The SFDP image served by RSFDP
    pub sfdp: Vec<u8>,
    /// Memory size in bytes
    pub size: usize,
    /// JEDEC id returned by RDID
    pub jedec_id: [u8; 3],
    /// Erase instruction to block size map
    pub erase_sizes: Vec<(u8, u32)>,
}

impl SimConfig {
    /// Configuration with the default JEDEC id (Winbond) and the standard
    /// 4K/32K/64K erase map
    pub fn new(sfdp: Vec<u8>, size: usize) -> Self {
        Self {
            sfdp,
            size,
            jedec_id: [0xEF, 0x40, 0x18],
            erase_sizes: vec![(0x20, 4096), (0x52, 32 * 1024), (0xD8, 64 * 1024)],
        }
    }
}

/// In-memory QSPI flash behind the [`QspiBus`] capability
pub struct SimFlash {
    config: SimConfig,
    mem: Vec<u8>,
    sr1: u8,
    sr2: u8,
    config_reg: u8,
    four_byte_cfg: u8,
    write_enabled: bool,
    ext_addr: u8,
    native_4byte: bool,
    qpi_entered: bool,
    mutated: bool,
    current_format: BusFormat,

    /// Pretend to be busy for this many status polls after a mutation
    pub busy_polls: u32,
    /// Keep WIP set forever once anything mutated
    pub stuck_busy: bool,
    /// Accept status register writes but discard them
    pub ignore_status_writes: bool,
    /// Report this many bytes written on the next page program
    pub short_write: Option<usize>,

    /// Last frequency the driver configured
    pub frequency: Option<u32>,
    /// Every format the driver applied, in order
    pub formats: Vec<BusFormat>,
    /// Every instruction that went through `command_transfer`
    pub ops: Vec<u8>,
    /// Erase transactions as (instruction, address-as-received)
    pub erases: Vec<(u8, u32)>,
    /// Program transactions as (address, length)
    pub programs: Vec<(u32, usize)>,
    /// Data/SFDP read transactions as (instruction, address, length, format)
    pub data_reads: Vec<(u8, u32, usize, BusFormat)>,
    /// Values written to the extended address register
    pub ext_writes: Vec<u8>,
}

impl SimFlash {
    /// Create an emulated flash with erased (0xFF) contents
    pub fn new(config: SimConfig) -> Self {
        let mem = vec![0xFF; config.size];
        Self {
            config,
            mem,
            sr1: 0,
            sr2: 0,
            config_reg: 0,
            four_byte_cfg: 0,
            write_enabled: false,
            ext_addr: 0,
            native_4byte: false,
            qpi_entered: false,
            mutated: false,
            current_format: BusFormat::single(AddressSize::ThreeByte),
            busy_polls: 0,
            stuck_busy: false,
            ignore_status_writes: false,
            short_write: None,
            frequency: None,
            formats: Vec::new(),
            ops: Vec::new(),
            erases: Vec::new(),
            programs: Vec::new(),
            data_reads: Vec::new(),
            ext_writes: Vec::new(),
        }
    }

    /// The emulated memory contents
    pub fn memory(&self) -> &[u8] {
        &self.mem
    }

    /// Mutable access to the emulated memory contents
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    /// Status register 2 as the device holds it
    pub fn status2(&self) -> u8 {
        self.sr2
    }

    /// Whether a QPI enable instruction was received
    pub fn qpi_entered(&self) -> bool {
        self.qpi_entered
    }

    fn status1(&mut self) -> u8 {
        let mut value = self.sr1 & !(opcodes::SR1_WIP | opcodes::SR1_WEL);
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            value |= opcodes::SR1_WIP;
        } else if self.stuck_busy && self.mutated {
            value |= opcodes::SR1_WIP;
        }
        if self.write_enabled {
            value |= opcodes::SR1_WEL;
        }
        value
    }

    fn effective_addr(&self, addr: u32) -> u32 {
        if self.native_4byte {
            addr
        } else {
            ((self.ext_addr as u32) << 24) | (addr & 0x00FF_FFFF)
        }
    }

    fn take_write_enable(&mut self) -> Result<()> {
        if !self.write_enabled {
            log::error!("sim: mutating command without WEL");
            return Err(Error::DeviceError);
        }
        self.write_enabled = false;
        Ok(())
    }

    fn erase_block(&mut self, size: u32, addr: u32) -> Result<()> {
        self.take_write_enable()?;
        let effective = self.effective_addr(addr);
        let start = (effective & !(size - 1)) as usize;
        let end = start + size as usize;
        if end > self.mem.len() {
            return Err(Error::DeviceError);
        }
        self.mem[start..end].fill(0xFF);
        self.mutated = true;
        Ok(())
    }
}

impl QspiBus for SimFlash {
    fn set_frequency(&mut self, hz: u32) -> Result<()> {
        self.frequency = Some(hz);
        Ok(())
    }

    fn configure_format(&mut self, format: &BusFormat) -> Result<()> {
        self.current_format = *format;
        self.formats.push(*format);
        Ok(())
    }

    fn command_transfer(
        &mut self,
        instruction: u8,
        addr: Option<u32>,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<()> {
        self.ops.push(instruction);
        match instruction {
            opcodes::WREN => self.write_enabled = true,
            opcodes::WRDI => self.write_enabled = false,
            opcodes::RDSR => {
                let value = self.status1();
                if let Some(byte) = rx.first_mut() {
                    *byte = value;
                }
            }
            opcodes::RDSR2 if !rx.is_empty() => rx[0] = self.sr2,
            opcodes::RDSR2_3F => {
                if let Some(byte) = rx.first_mut() {
                    *byte = self.sr2;
                }
            }
            // Enter-QPI opcodes; 0x35 doubles as RDSR2, told apart by the
            // absence of a receive phase
            opcodes::EQIO | opcodes::EQIO_35 => self.qpi_entered = true,
            opcodes::WRSR => {
                self.take_write_enable()?;
                if !self.ignore_status_writes {
                    if let Some(&byte) = tx.first() {
                        self.sr1 = byte & !(opcodes::SR1_WIP | opcodes::SR1_WEL);
                    }
                    if let Some(&byte) = tx.get(1) {
                        self.sr2 = byte;
                    }
                }
            }
            opcodes::WRSR2_3E => {
                self.take_write_enable()?;
                if !self.ignore_status_writes {
                    if let Some(&byte) = tx.first() {
                        self.sr2 = byte;
                    }
                }
            }
            opcodes::RDID => {
                let n = rx.len().min(3);
                rx[..n].copy_from_slice(&self.config.jedec_id[..n]);
            }
            opcodes::ULBPR => {
                self.take_write_enable()?;
                self.sr1 &= opcodes::SR1_WIP | opcodes::SR1_WEL;
            }
            opcodes::RSTEN | opcodes::RST | opcodes::RST_F0 => {}
            opcodes::EN4B => self.native_4byte = true,
            opcodes::WREAR => {
                // Volatile register write: needs WEL but leaves it latched
                // for the data command that follows
                if !self.write_enabled {
                    log::error!("sim: extended address write without WEL");
                    return Err(Error::DeviceError);
                }
                if let Some(&byte) = tx.first() {
                    self.ext_addr = byte;
                    self.ext_writes.push(byte);
                }
            }
            opcodes::BRWR => {
                if let Some(&byte) = tx.first() {
                    self.native_4byte = byte & 0x80 != 0;
                }
            }
            opcodes::RDCR_4BA => {
                if let Some(byte) = rx.first_mut() {
                    *byte = self.four_byte_cfg;
                }
            }
            opcodes::WRCR_4BA => {
                self.take_write_enable()?;
                if let Some(&byte) = tx.first() {
                    self.four_byte_cfg = byte;
                    self.native_4byte = byte & 0x01 != 0;
                }
            }
            opcodes::RDCR_65 => {
                if let Some(byte) = rx.first_mut() {
                    *byte = self.config_reg;
                }
            }
            opcodes::WRCR_71 | opcodes::WRCR_61 => {
                if let Some(&byte) = tx.first() {
                    self.config_reg = byte;
                    self.qpi_entered = true;
                }
            }
            _ => {
                let erase = self
                    .config
                    .erase_sizes
                    .iter()
                    .find(|(opcode, _)| *opcode == instruction)
                    .map(|&(_, size)| size);
                match (erase, addr) {
                    (Some(size), Some(addr)) => {
                        self.erases.push((instruction, addr));
                        self.erase_block(size, addr)?;
                    }
                    _ => {
                        log::error!("sim: unhandled instruction {:#04x}", instruction);
                        return Err(Error::DeviceError);
                    }
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, instruction: u8, _alt: Option<u8>, addr: u32, buf: &mut [u8]) -> Result<usize> {
        self.data_reads
            .push((instruction, addr, buf.len(), self.current_format));

        if instruction == opcodes::RDSFDP {
            for (index, byte) in buf.iter_mut().enumerate() {
                *byte = self
                    .config
                    .sfdp
                    .get(addr as usize + index)
                    .copied()
                    .unwrap_or(0xFF);
            }
            return Ok(buf.len());
        }

        let start = self.effective_addr(addr) as usize;
        let end = start + buf.len();
        if end > self.mem.len() {
            return Err(Error::DeviceError);
        }
        buf.copy_from_slice(&self.mem[start..end]);
        Ok(buf.len())
    }

    fn write(&mut self, instruction: u8, _alt: Option<u8>, addr: u32, data: &[u8]) -> Result<usize> {
        if instruction != opcodes::PP {
            log::error!("sim: unhandled program instruction {:#04x}", instruction);
            return Err(Error::DeviceError);
        }
        self.take_write_enable()?;

        let start = self.effective_addr(addr) as usize;
        let written = self.short_write.take().unwrap_or(data.len());
        let end = start + written;
        if end > self.mem.len() {
            return Err(Error::DeviceError);
        }
        // NOR programming only clears bits
        for (index, &byte) in data[..written].iter().enumerate() {
            self.mem[start + index] &= byte;
        }
        self.programs.push((addr, data.len()));
        self.mutated = true;
        Ok(written)
    }

    fn delay_ms(&mut self, _ms: u32) {}
}

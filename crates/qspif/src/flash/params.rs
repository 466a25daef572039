//! Device descriptor and region map
//!
//! Everything `init` discovers about the attached flash lives in
//! [`DeviceParams`]; data operations only read it.

use crate::sfdp::types::{EraseType, SoftResetKind};
use crate::spi::{opcodes, AddressSize, BusFormat, BusWidth};
use bitflags::bitflags;
use heapless::Vec;

/// Most chip-select lines one process may drive
pub const MAX_ACTIVE_DEVICES: usize = 10;
/// Most erase regions a sector map may describe
pub const MAX_REGIONS: usize = 10;
/// Memory-ready poll budget: one status read per 1 ms sleep
pub const IS_MEM_READY_MAX_RETRIES: u32 = 10_000;
/// Program page size assumed when the table does not carry one
pub const DEFAULT_PAGE_SIZE: u32 = 256;
/// Host-configured minimum read size in bytes
pub const MIN_READ_SIZE: u32 = 1;
/// Host-configured minimum program size in bytes
pub const MIN_PROG_SIZE: u32 = 1;
/// Value read from erased flash
pub const ERASE_VALUE: u8 = 0xFF;

bitflags! {
    /// Per-region erase-type support; bit i means erase type i+1 applies
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EraseTypes: u8 {
        /// Erase type 1
        const TYPE_1 = 1 << 0;
        /// Erase type 2
        const TYPE_2 = 1 << 1;
        /// Erase type 3
        const TYPE_3 = 1 << 2;
        /// Erase type 4
        const TYPE_4 = 1 << 3;
    }
}

impl EraseTypes {
    /// Flag for the erase type at `index` (0-based)
    pub fn from_index(index: usize) -> Self {
        Self::from_bits_truncate(1 << index)
    }
}

/// One contiguous address range sharing an erase-type bitfield
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Region size in bytes (a positive multiple of 256)
    pub size_bytes: u64,
    /// Inclusive upper address of the region
    pub high_boundary: u64,
    /// Erase types usable inside this region
    pub erase_types: EraseTypes,
}

/// Everything discovered about the attached flash device
#[derive(Debug, Clone)]
pub struct DeviceParams {
    /// Total device size in bytes, derived from the BPT density word
    pub device_size_bytes: u64,
    /// Program page size in bytes (power of two)
    pub page_size_bytes: u32,
    /// Address size sent on the wire
    pub address_size: AddressSize,
    /// Instruction for data reads (the discovered best mode)
    pub read_instruction: u8,
    /// Instruction for page program
    pub prog_instruction: u8,
    /// 4 KiB erase instruction
    pub erase_4k_instruction: u8,
    /// Mode plus wait cycles for the read instruction
    pub dummy_and_mode_cycles: u8,
    /// Lines used for the instruction phase of data reads
    pub inst_width: BusWidth,
    /// Lines used for the address phase of data reads
    pub address_width: BusWidth,
    /// Lines used for the data phase of data reads
    pub data_width: BusWidth,
    /// The four erase type slots of the BPT
    pub erase_types: [EraseType; 4],
    /// Soft reset protocol the device advertises
    pub soft_reset: Option<SoftResetKind>,
    /// Instruction for reading status register 2
    pub read_status2_inst: u8,
    /// Instruction for writing status register 2; `None` means SR2 is the
    /// second byte of a two-byte SR1 write
    pub write_status2_inst: Option<u8>,
    /// Instruction for writing the extended address register; `None` means
    /// 4-byte addressing is native or unused
    pub ext_addr_write_inst: Option<u8>,
    /// Erase regions, contiguous from address 0
    pub regions: Vec<Region, MAX_REGIONS>,
    /// Smallest erase size supported by every region, 0 if none is common
    pub min_common_erase_size: u32,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            device_size_bytes: 0,
            page_size_bytes: DEFAULT_PAGE_SIZE,
            address_size: AddressSize::ThreeByte,
            read_instruction: opcodes::READ,
            prog_instruction: opcodes::PP,
            erase_4k_instruction: opcodes::SE_20,
            dummy_and_mode_cycles: 0,
            inst_width: BusWidth::Single,
            address_width: BusWidth::Single,
            data_width: BusWidth::Single,
            erase_types: [EraseType::UNSUPPORTED; 4],
            soft_reset: None,
            read_status2_inst: opcodes::RDSR2,
            write_status2_inst: None,
            ext_addr_write_inst: None,
            regions: Vec::new(),
            min_common_erase_size: 0,
        }
    }
}

impl DeviceParams {
    /// Bus format for data reads: the discovered widths and cycle count
    pub fn read_format(&self) -> BusFormat {
        BusFormat {
            inst_width: self.inst_width,
            addr_width: self.address_width,
            addr_size: self.address_size,
            alt_width: BusWidth::Single,
            alt_size_bits: 8,
            data_width: self.data_width,
            dummy_cycles: self.dummy_and_mode_cycles,
        }
    }

    /// Index of the region owning `addr`
    pub fn region_of(&self, addr: u64) -> Option<usize> {
        if addr >= self.device_size_bytes {
            return None;
        }
        self.regions.iter().position(|r| addr <= r.high_boundary)
    }

    /// Smallest erase size usable at `addr`
    ///
    /// Falls back to the minimum common erase size when the address is out
    /// of range or the region advertises no erase type.
    pub fn erase_size_at(&self, addr: u64) -> u32 {
        match self.region_of(addr) {
            Some(region) => {
                let bitfield = self.regions[region].erase_types;
                for index in 0..4 {
                    if bitfield.contains(EraseTypes::from_index(index)) {
                        return self.erase_types[index].size;
                    }
                }
                log::error!("no erase type found for region {}", region);
                self.min_common_erase_size
            }
            None => self.min_common_erase_size,
        }
    }

    /// Install the default single-region map covering the whole device
    pub fn set_uniform_region(&mut self, erase_types: EraseTypes) {
        self.regions.clear();
        let _ = self.regions.push(Region {
            size_bytes: self.device_size_bytes,
            high_boundary: self.device_size_bytes.saturating_sub(1),
            erase_types,
        });
    }
}

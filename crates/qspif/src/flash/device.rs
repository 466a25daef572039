//! Block-device facade
//!
//! [`QspifBlockDevice`] owns its QSPI controller handle and a device
//! descriptor filled in by SFDP discovery. Public operations take `&mut
//! self`, which serializes an instance the way the original per-instance
//! mutex did; error paths cannot leave a lock behind.

use crate::error::{Error, Result};
use crate::flash::erase_plan::{self, ErasePlan};
use crate::flash::params::{
    DeviceParams, ERASE_VALUE, MAX_ACTIVE_DEVICES, MIN_PROG_SIZE, MIN_READ_SIZE,
};
use crate::flash::registry::{self, ChipSelect, ClaimStatus};
use crate::protocol;
use crate::qspi::QspiBus;
use crate::sfdp::parser;
use crate::sfdp::types::{BASIC_TABLE_MAX_SIZE, SECTOR_MAP_TABLE_MAX_SIZE};
use crate::spi::BusFormat;
use crate::transport;

/// SFDP-discovered QSPI NOR flash block device
///
/// The device is byte addressable: `read` and `program` accept any length,
/// `erase` requires region-aware alignment. `init` runs the discovery
/// pipeline once and is refcounted; `deinit` undoes the last `init`.
pub struct QspifBlockDevice<Q: QspiBus> {
    bus: Q,
    csel: ChipSelect,
    freq_hz: u32,
    claim: ClaimStatus,
    registered: bool,
    params: DeviceParams,
    is_initialized: bool,
    init_ref_count: u32,
}

impl<Q: QspiBus> QspifBlockDevice<Q> {
    /// Claim the chip select and wrap the controller
    ///
    /// Construction does not touch the device; discovery happens in
    /// [`init`](Self::init). A duplicate chip select or a full registry is
    /// recorded here and reported by `init`.
    pub fn new(bus: Q, csel: ChipSelect, freq_hz: u32) -> Self {
        let claim = registry::claim(csel);
        match claim {
            ClaimStatus::Claimed => {
                log::debug!("adding a new qspif device, csel {}", csel.0);
            }
            ClaimStatus::Duplicate => {
                log::error!("a qspif device with csel {} already exists", csel.0);
            }
            ClaimStatus::CapacityExceeded => {
                log::error!(
                    "too many qspif devices, max allowed: {}",
                    MAX_ACTIVE_DEVICES
                );
            }
        }

        Self {
            bus,
            csel,
            freq_hz,
            claim,
            registered: claim == ClaimStatus::Claimed,
            params: DeviceParams::default(),
            is_initialized: false,
            init_ref_count: 0,
        }
    }

    /// Run SFDP discovery and bring the device to a usable state
    ///
    /// Idempotent and refcounted: the first call runs the discovery
    /// pipeline, later calls only bump the reference count. A discovery
    /// failure leaves the device uninitialized with the count reset.
    pub fn init(&mut self) -> Result<()> {
        match self.claim {
            ClaimStatus::Claimed => {}
            ClaimStatus::Duplicate => return Err(Error::DeviceNotUnique),
            ClaimStatus::CapacityExceeded => return Err(Error::DeviceMaxExceeded),
        }

        if !self.is_initialized {
            self.init_ref_count = 0;
        }
        self.init_ref_count += 1;
        if self.init_ref_count != 1 {
            return Ok(());
        }

        match self.discover() {
            Ok(()) => {
                self.is_initialized = true;
                Ok(())
            }
            Err(e) => {
                log::error!("init failed: {}", e);
                self.init_ref_count = 0;
                Err(e)
            }
        }
    }

    /// Drop one init reference
    ///
    /// The last reference write-disables the device, clears the
    /// initialized flag and releases the registry slot.
    pub fn deinit(&mut self) -> Result<()> {
        if !self.is_initialized {
            self.init_ref_count = 0;
            return Ok(());
        }

        self.init_ref_count -= 1;
        if self.init_ref_count != 0 {
            return Ok(());
        }

        let result = protocol::write_disable(&mut self.bus, &self.params);
        if result.is_err() {
            log::error!("write disable failed");
        }

        self.is_initialized = false;
        if self.registered {
            registry::release(self.csel);
            self.registered = false;
        }
        result
    }

    /// Read `buf.len()` bytes starting at `addr` in the best discovered mode
    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(addr, buf.len() as u64)?;
        log::trace!("read: addr {:#x}, {} bytes", addr, buf.len());
        transport::send_read(&mut self.bus, &self.params, addr as u32, buf)
    }

    /// Program `data` starting at `addr`, splitting on page boundaries
    ///
    /// Each page chunk runs under write enable and is followed by a
    /// memory-ready poll; a short write reported by the controller aborts
    /// with a device error.
    pub fn program(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_range(addr, data.len() as u64)?;
        log::trace!("program: addr {:#x}, {} bytes", addr, data.len());

        let page = self.params.page_size_bytes as u64;
        let mut addr = addr;
        let mut data = data;

        while !data.is_empty() {
            let offset = addr % page;
            let chunk = ((page - offset) as usize).min(data.len());

            protocol::set_write_enable(&mut self.bus, &self.params)?;

            let written =
                transport::send_program(&mut self.bus, &self.params, addr as u32, &data[..chunk])?;
            if written != chunk {
                log::error!("short write: {} of {} bytes", written, chunk);
                return Err(Error::DeviceError);
            }

            protocol::wait_ready(&mut self.bus, &self.params)?;

            addr += chunk as u64;
            data = &data[chunk..];
        }
        Ok(())
    }

    /// Erase `[addr, addr + size)`
    ///
    /// Both ends must be aligned to the erase granularity of the region
    /// they fall into. Each planned chunk is committed before the next
    /// begins, so partial progress on failure is observable to the caller.
    pub fn erase(&mut self, addr: u64, size: u64) -> Result<()> {
        erase_plan::validate(&self.params, addr, size)?;
        log::debug!("erase: addr {:#x}, size {:#x}", addr, size);

        let params = &self.params;
        let bus = &mut self.bus;
        let mut covered = 0u64;

        for step in ErasePlan::new(params, addr, size) {
            log::debug!(
                "erase step: instruction {:#04x}, addr {:#x}, chunk {:#x}",
                step.instruction,
                step.addr,
                step.len
            );
            protocol::set_write_enable(bus, params)?;
            transport::send_erase(bus, params, step.instruction, step.addr as u32)?;
            protocol::wait_ready(bus, params)?;
            covered += step.len;
        }

        if covered != size {
            log::error!("erase plan covered {:#x} of {:#x} bytes", covered, size);
            return Err(Error::InvalidEraseParams);
        }
        Ok(())
    }

    /// Total device size in bytes
    pub fn size(&self) -> u64 {
        self.params.device_size_bytes
    }

    /// Minimum read size in bytes
    pub fn get_read_size(&self) -> u64 {
        MIN_READ_SIZE as u64
    }

    /// Minimum program size in bytes
    pub fn get_program_size(&self) -> u64 {
        MIN_PROG_SIZE as u64
    }

    /// Smallest erase size supported by every region, 0 if none is common
    pub fn get_erase_size(&self) -> u64 {
        self.params.min_common_erase_size as u64
    }

    /// Smallest erase size usable at `addr`
    pub fn get_erase_size_at(&self, addr: u64) -> u64 {
        self.params.erase_size_at(addr) as u64
    }

    /// Value read from erased flash
    pub fn get_erase_value(&self) -> u8 {
        ERASE_VALUE
    }

    /// Whether discovery has completed
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    /// The discovered device descriptor
    pub fn parameters(&self) -> &DeviceParams {
        &self.params
    }

    /// The underlying controller handle
    pub fn controller(&self) -> &Q {
        &self.bus
    }

    /// Mutable access to the underlying controller handle
    pub fn controller_mut(&mut self) -> &mut Q {
        &mut self.bus
    }

    fn check_range(&self, addr: u64, len: u64) -> Result<()> {
        match addr.checked_add(len) {
            Some(end) if end <= self.params.device_size_bytes => Ok(()),
            _ => {
                log::error!("access [{:#x}, +{:#x}) exceeds the device size", addr, len);
                Err(Error::DeviceError)
            }
        }
    }

    /// The discovery pipeline: synchronize, walk SFDP, decode and apply the
    /// basic table, install the region map, clear block protection
    fn discover(&mut self) -> Result<()> {
        self.params = DeviceParams::default();

        // Everything except data reads and RSFDP runs in default 1-1-1
        self.bus
            .configure_format(&BusFormat::single(self.params.address_size))?;
        self.bus.set_frequency(self.freq_hz)?;

        // Synchronize with the device before touching SFDP space
        protocol::wait_ready(&mut self.bus, &self.params)?;

        let (basic, sector_map) = parser::locate_tables(&mut self.bus, &self.params)?;

        let mut table = [0u8; BASIC_TABLE_MAX_SIZE];
        let table = &mut table[..basic.size.min(BASIC_TABLE_MAX_SIZE)];
        transport::send_read_sfdp(&mut self.bus, &self.params, basic.addr, table)?;
        self.apply_basic_table(table)?;

        if let Some(map) = sector_map {
            log::debug!(
                "parsing sector map table, addr {:#x}, size {}",
                map.addr,
                map.size
            );
            if map.size > SECTOR_MAP_TABLE_MAX_SIZE {
                log::error!("sector map table too large: {} bytes", map.size);
                return Err(Error::ParsingFailed);
            }
            let mut buf = [0u8; SECTOR_MAP_TABLE_MAX_SIZE];
            let table = &mut buf[..map.size];
            transport::send_read_sfdp(&mut self.bus, &self.params, map.addr, table)?;

            let (regions, min_common) =
                parser::decode_sector_map(table, &self.params.erase_types)?;
            self.params.regions = regions;
            self.params.min_common_erase_size = min_common;
        }

        protocol::clear_block_protection(&mut self.bus, &self.params)?;
        Ok(())
    }

    /// Interpret the Basic Parameters Table and apply its side effects
    fn apply_basic_table(&mut self, table: &[u8]) -> Result<()> {
        self.params.device_size_bytes = parser::decode_density(table)?;
        log::debug!("device size: {} bytes", self.params.device_size_bytes);

        self.params.page_size_bytes = parser::decode_page_size(table);
        log::debug!("page size: {} bytes", self.params.page_size_bytes);

        // Reset first so later register writes land on a device in a known state
        let reset = parser::decode_soft_reset(table)?;
        self.params.soft_reset = Some(reset);
        protocol::soft_reset(&mut self.bus, &self.params, reset)?;

        let erase = parser::decode_erase_types(table);
        self.params.erase_types = erase.erase_types;
        self.params.erase_4k_instruction = erase.erase_4k_instruction;
        self.params.min_common_erase_size = erase.min_common_erase_size;
        self.params.set_uniform_region(erase.region0_bitfield);

        let read_mode = parser::decode_best_read_mode(table);
        log::debug!(
            "read mode: instruction {:#04x}, 1-{}-{} bus, {} cycles",
            read_mode.instruction,
            read_mode.addr_width.lines(),
            read_mode.data_width.lines(),
            read_mode.dummy_and_mode_cycles
        );
        self.params.read_instruction = read_mode.instruction;
        self.params.address_width = read_mode.addr_width;
        self.params.data_width = read_mode.data_width;
        self.params.dummy_and_mode_cycles = read_mode.dummy_and_mode_cycles;

        if read_mode.needs_quad_enable {
            let method = parser::decode_quad_enable(table);
            protocol::set_quad_enable(&mut self.bus, &mut self.params, method)?;
            if read_mode.qpi {
                let sequence = parser::decode_qpi_sequence(table);
                protocol::set_qpi_enabled(&mut self.bus, &self.params, sequence)?;
            }
        }

        let four_byte = parser::decode_four_byte_mode(table);
        protocol::enable_four_byte_addressing(&mut self.bus, &mut self.params, four_byte)?;

        protocol::wait_ready(&mut self.bus, &self.params)
    }
}

impl<Q: QspiBus> Drop for QspifBlockDevice<Q> {
    fn drop(&mut self) {
        if self.registered {
            registry::release(self.csel);
        }
    }
}

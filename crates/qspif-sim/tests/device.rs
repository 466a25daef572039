//! End-to-end tests: the qspif driver against the in-memory emulator

use std::sync::Mutex;

use qspif::error::Error;
use qspif::sfdp::types::SoftResetKind;
use qspif::spi::bus::{AddressSize, BusWidth};
use qspif::spi::opcodes;
use qspif::{ChipSelect, QspifBlockDevice};
use qspif_sim::{SfdpBuilder, SimConfig, SimFlash};

// The chip-select registry is process-wide and capacity-bounded, so device
// construction is serialized across tests. Each test still uses its own ids.
static REGISTRY_GATE: Mutex<()> = Mutex::new(());

fn gate() -> std::sync::MutexGuard<'static, ()> {
    REGISTRY_GATE.lock().unwrap_or_else(|e| e.into_inner())
}

const MIB: u64 = 1024 * 1024;

/// 2 MiB part with the 4K/32K/64K hierarchy and a 1-4-4 read (0xEB, QE in
/// SR2 bit 1)
fn quad_2m() -> SimConfig {
    let sfdp = SfdpBuilder::new(2 * MIB)
        .standard_erase_types()
        .quad_144(0xEB, 0x44, 1)
        .build();
    SimConfig::new(sfdp, 2 * MIB as usize)
}

fn device(cs: u32, config: SimConfig) -> QspifBlockDevice<SimFlash> {
    QspifBlockDevice::new(SimFlash::new(config), ChipSelect(cs), 40_000_000)
}

#[test]
fn init_discovers_geometry_and_read_mode() {
    let _g = gate();
    let mut dev = device(100, quad_2m());
    dev.init().unwrap();

    assert!(dev.is_initialized());
    assert_eq!(dev.size(), 2 * MIB);
    assert_eq!(dev.get_erase_size(), 4096);
    assert_eq!(dev.get_erase_value(), 0xFF);
    assert_eq!(dev.get_read_size(), 1);
    assert_eq!(dev.get_program_size(), 1);

    let params = dev.parameters();
    assert_eq!(params.page_size_bytes, 256);
    assert_eq!(params.read_instruction, 0xEB);
    assert_eq!(params.address_width, BusWidth::Quad);
    assert_eq!(params.data_width, BusWidth::Quad);
    assert_eq!(params.dummy_and_mode_cycles, 6);
    assert_eq!(params.address_size, AddressSize::ThreeByte);
    assert_eq!(params.soft_reset, Some(SoftResetKind::EnableReset));

    // quad enable latched SR2 bit 1 on the device
    assert_eq!(dev.controller().status2() & 0x02, 0x02);
    assert_eq!(dev.controller().frequency, Some(40_000_000));

    dev.deinit().unwrap();
}

#[test]
fn init_rejects_extended_density_encoding() {
    let _g = gate();
    let sfdp = SfdpBuilder::new(2 * MIB)
        .standard_erase_types()
        .density_raw(0x80FF_FFFF)
        .build();
    let mut dev = device(101, SimConfig::new(sfdp, 2 * MIB as usize));

    assert_eq!(dev.init(), Err(Error::ParsingFailed));
    assert!(!dev.is_initialized());
    // the device stays uninitialized and a retry fails the same way
    assert_eq!(dev.init(), Err(Error::ParsingFailed));
}

#[test]
fn init_requires_a_soft_reset_protocol() {
    let _g = gate();
    let sfdp = SfdpBuilder::new(2 * MIB)
        .standard_erase_types()
        .soft_reset_byte(0x00)
        .build();
    let mut dev = device(102, SimConfig::new(sfdp, 2 * MIB as usize));
    assert_eq!(dev.init(), Err(Error::ParsingFailed));
}

#[test]
fn erase_program_read_round_trip() {
    let _g = gate();
    let mut dev = device(103, quad_2m());
    dev.init().unwrap();

    let pattern: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    dev.erase(0x10000, 0x10000).unwrap();
    dev.program(0x10000, &pattern).unwrap();

    let mut readback = vec![0u8; pattern.len()];
    dev.read(0x10000, &mut readback).unwrap();
    assert_eq!(readback, pattern);

    // erase returns the range to the erased value
    dev.erase(0x10000, 0x10000).unwrap();
    dev.read(0x10000, &mut readback).unwrap();
    assert!(readback.iter().all(|&b| b == 0xFF));

    // the data reads ran on the discovered 1-4-4 format
    let (inst, _, _, format) = *dev.controller().data_reads.last().unwrap();
    assert_eq!(inst, 0xEB);
    assert_eq!(format.addr_width, BusWidth::Quad);
    assert_eq!(format.data_width, BusWidth::Quad);
    assert_eq!(format.dummy_cycles, 6);

    dev.deinit().unwrap();
}

#[test]
fn program_splits_on_page_boundaries() {
    let _g = gate();
    let mut dev = device(104, quad_2m());
    dev.init().unwrap();

    let data = vec![0xA5u8; 512];
    dev.program(0x1F0, &data).unwrap();

    assert_eq!(
        dev.controller().programs,
        vec![(0x1F0, 16), (0x200, 256), (0x300, 240)]
    );
}

#[test]
fn short_write_is_a_device_error() {
    let _g = gate();
    let mut dev = device(105, quad_2m());
    dev.init().unwrap();

    dev.controller_mut().short_write = Some(8);
    let data = [0u8; 64];
    assert_eq!(dev.program(0, &data), Err(Error::DeviceError));
}

#[test]
fn erase_selects_largest_applicable_types() {
    let _g = gate();
    let mut dev = device(106, quad_2m());
    dev.init().unwrap();

    dev.erase(0, 96 * 1024).unwrap();
    assert_eq!(dev.controller().erases, vec![(0xD8, 0), (0x52, 0x10000)]);

    dev.controller_mut().erases.clear();
    dev.erase(0x1000, 0x10000).unwrap();
    assert_eq!(
        dev.controller().erases,
        vec![(0x52, 0x1000), (0x52, 0x8000), (0x20, 0x10000)]
    );
}

#[test]
fn erase_rejects_unaligned_or_oversized_requests() {
    let _g = gate();
    let mut dev = device(107, quad_2m());
    dev.init().unwrap();

    assert_eq!(dev.erase(0x100, 0x1000), Err(Error::InvalidEraseParams));
    assert_eq!(dev.erase(0, 0x100), Err(Error::InvalidEraseParams));
    assert_eq!(
        dev.erase(2 * MIB - 0x1000, 0x2000),
        Err(Error::InvalidEraseParams)
    );
    // nothing was issued to the device
    assert!(dev.controller().erases.is_empty());
}

#[test]
fn ready_poll_gives_up_on_a_stuck_device() {
    let _g = gate();
    let mut dev = device(108, quad_2m());
    dev.init().unwrap();

    dev.controller_mut().stuck_busy = true;
    let data = [0u8; 16];
    assert_eq!(dev.program(0, &data), Err(Error::ReadyFailed));
}

#[test]
fn quad_enable_must_be_observable() {
    let _g = gate();
    let mut dev = device(109, quad_2m());
    dev.controller_mut().ignore_status_writes = true;
    assert_eq!(dev.init(), Err(Error::DeviceError));
    assert!(!dev.is_initialized());
}

#[test]
fn duplicate_chip_select_is_rejected_without_touching_the_bus() {
    let _g = gate();
    let mut first = device(110, quad_2m());
    first.init().unwrap();

    let mut second = device(110, quad_2m());
    assert_eq!(second.init(), Err(Error::DeviceNotUnique));
    assert_eq!(second.controller().frequency, None);
    assert!(second.controller().ops.is_empty());

    first.deinit().unwrap();
}

#[test]
fn init_is_refcounted_and_deinit_releases_the_slot() {
    let _g = gate();
    let mut dev = device(111, quad_2m());
    dev.init().unwrap();
    dev.init().unwrap();

    dev.deinit().unwrap();
    assert!(dev.is_initialized());

    dev.deinit().unwrap();
    assert!(!dev.is_initialized());
    // the last deinit write-disables the device
    assert_eq!(dev.controller().ops.last(), Some(&opcodes::WRDI));

    // the slot is free again for a new instance
    let mut again = device(111, quad_2m());
    again.init().unwrap();
    again.deinit().unwrap();
}

#[test]
fn dropping_an_instance_frees_its_chip_select() {
    let _g = gate();
    {
        let _dev = device(112, quad_2m());
    }
    let mut dev = device(112, quad_2m());
    dev.init().unwrap();
    dev.deinit().unwrap();
}

#[test]
fn four_byte_addresses_route_through_the_extended_register() {
    let _g = gate();
    // 64 MiB part that keeps 3-byte instructions and banks through 0xC5
    let sfdp = SfdpBuilder::new(64 * MIB)
        .standard_erase_types()
        .four_byte_byte(0x04)
        .build();
    let mut dev = device(113, SimConfig::new(sfdp, 64 * MIB as usize));
    dev.init().unwrap();

    assert_eq!(dev.parameters().address_size, AddressSize::ThreeByte);
    assert_eq!(
        dev.parameters().ext_addr_write_inst,
        Some(opcodes::WREAR)
    );

    dev.erase(0x0200_0000, 0x10000).unwrap();
    dev.program(0x0200_0000, &[0x5A; 16]).unwrap();

    let mut buf = [0u8; 16];
    dev.read(0x0200_0000, &mut buf).unwrap();
    assert_eq!(buf, [0x5A; 16]);

    // every high access set the register to the top address byte
    assert!(dev.controller().ext_writes.contains(&0x02));
    // the read instruction carried the full address; only the low 24 bits
    // reach the device, the register supplies the rest
    let (_, addr, _, _) = *dev.controller().data_reads.last().unwrap();
    assert_eq!(addr, 0x0200_0000);

    dev.deinit().unwrap();
}

#[test]
fn native_four_byte_mode_is_entered_when_advertised() {
    let _g = gate();
    let sfdp = SfdpBuilder::new(64 * MIB)
        .standard_erase_types()
        .four_byte_byte(0x01)
        .build();
    let mut dev = device(114, SimConfig::new(sfdp, 64 * MIB as usize));
    dev.init().unwrap();

    assert_eq!(dev.parameters().address_size, AddressSize::FourByte);
    assert_eq!(dev.parameters().ext_addr_write_inst, None);
    assert!(dev.controller().ops.contains(&opcodes::EN4B));

    // no extended register traffic on the data path
    dev.program(0x0200_0000, &[0x11; 4]).unwrap();
    assert!(dev.controller().ext_writes.is_empty());

    dev.deinit().unwrap();
}

#[test]
fn qpi_mode_wins_the_read_mode_selection() {
    let _g = gate();
    let sfdp = SfdpBuilder::new(2 * MIB)
        .standard_erase_types()
        .quad_144(0xEB, 0x44, 1)
        .qpi_444(0xEB, 0x44, 0x10) // enable sequence 1 after the nibble swap
        .build();
    let mut dev = device(115, SimConfig::new(sfdp, 2 * MIB as usize));
    dev.init().unwrap();

    let params = dev.parameters();
    assert_eq!(params.read_instruction, 0xEB);
    assert_eq!(params.address_width, BusWidth::Quad);
    assert_eq!(params.data_width, BusWidth::Quad);
    assert_eq!(params.dummy_and_mode_cycles, 6);
    assert!(dev.controller().qpi_entered());
    assert!(dev.controller().ops.contains(&opcodes::EQIO));

    dev.deinit().unwrap();
}

#[test]
fn sector_map_regions_drive_erase_geometry() {
    let _g = gate();
    // 64 KiB of 4K-only parameter sectors, then uniform 4K/32K/64K
    let sfdp = SfdpBuilder::new(2 * MIB)
        .standard_erase_types()
        .sector_map(&[(64 * 1024, 0b0001), (2 * MIB - 64 * 1024, 0b0111)])
        .build();
    let mut dev = device(116, SimConfig::new(sfdp, 2 * MIB as usize));
    dev.init().unwrap();

    assert_eq!(dev.get_erase_size(), 4096);
    assert_eq!(dev.get_erase_size_at(0), 4096);
    assert_eq!(dev.get_erase_size_at(64 * 1024), 4096);
    assert_eq!(dev.parameters().regions.len(), 2);

    // crossing the region boundary picks the per-region largest types
    dev.erase(0xC000, 0x24000).unwrap();
    assert_eq!(
        dev.controller().erases,
        vec![
            (0x20, 0xC000),
            (0x20, 0xD000),
            (0x20, 0xE000),
            (0x20, 0xF000),
            (0xD8, 0x10000),
            (0xD8, 0x20000),
        ]
    );

    let mut buf = vec![0u8; 0x24000];
    dev.read(0xC000, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));

    dev.deinit().unwrap();
}

#[test]
fn sst_parts_get_a_global_unprotect() {
    let _g = gate();
    let mut config = quad_2m();
    config.jedec_id = [0xBF, 0x26, 0x43];
    let mut dev = device(117, config);
    dev.init().unwrap();

    assert!(dev.controller().ops.contains(&opcodes::ULBPR));
    dev.deinit().unwrap();
}

#[test]
fn fallback_read_mode_is_legacy_111() {
    let _g = gate();
    let sfdp = SfdpBuilder::new(MIB).standard_erase_types().build();
    let mut dev = device(118, SimConfig::new(sfdp, MIB as usize));
    dev.init().unwrap();

    let params = dev.parameters();
    assert_eq!(params.read_instruction, opcodes::READ);
    assert_eq!(params.address_width, BusWidth::Single);
    assert_eq!(params.data_width, BusWidth::Single);
    assert_eq!(params.dummy_and_mode_cycles, 0);

    dev.deinit().unwrap();
}

#[test]
fn dual_read_mode_skips_quad_enable() {
    let _g = gate();
    let sfdp = SfdpBuilder::new(MIB)
        .standard_erase_types()
        .dual_112(0x3B, 0x08)
        .build();
    let mut dev = device(119, SimConfig::new(sfdp, MIB as usize));
    dev.init().unwrap();

    let params = dev.parameters();
    assert_eq!(params.read_instruction, 0x3B);
    assert_eq!(params.data_width, BusWidth::Dual);
    assert_eq!(params.dummy_and_mode_cycles, 8);
    // no quad enable means SR2 stays clear
    assert_eq!(dev.controller().status2(), 0);

    dev.deinit().unwrap();
}

#[test]
fn qer_method_3_switches_the_sr2_opcodes() {
    let _g = gate();
    let sfdp = SfdpBuilder::new(2 * MIB)
        .standard_erase_types()
        .quad_144(0xEB, 0x44, 3)
        .build();
    let mut dev = device(121, SimConfig::new(sfdp, 2 * MIB as usize));
    dev.init().unwrap();

    // QE lives in SR1 bit 7 and SR2 moves to the 0x3F/0x3E opcodes
    let params = dev.parameters();
    assert_eq!(params.read_status2_inst, 0x3F);
    assert_eq!(params.write_status2_inst, Some(0x3E));
    assert!(dev.controller().ops.contains(&0x3F));
    assert!(dev.controller().ops.contains(&0x3E));

    dev.deinit().unwrap();
}

#[test]
fn single_instruction_reset_protocol_is_used_when_advertised() {
    let _g = gate();
    let sfdp = SfdpBuilder::new(MIB)
        .standard_erase_types()
        .soft_reset_byte(0x08)
        .build();
    let mut dev = device(122, SimConfig::new(sfdp, MIB as usize));
    dev.init().unwrap();

    assert!(dev.controller().ops.contains(&opcodes::RST_F0));
    assert!(!dev.controller().ops.contains(&opcodes::RSTEN));

    dev.deinit().unwrap();
}

#[test]
fn reads_and_programs_are_bounds_checked() {
    let _g = gate();
    let mut dev = device(120, quad_2m());
    dev.init().unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(dev.read(2 * MIB - 8, &mut buf), Err(Error::DeviceError));
    assert_eq!(dev.program(2 * MIB, &buf), Err(Error::DeviceError));

    dev.deinit().unwrap();
}

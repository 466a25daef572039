//! qspif - block-device driver for QSPI NOR flash
//!
//! This crate drives serial NOR flash memories attached over a Quad-SPI bus
//! and exposes them as a byte-addressable erase/program/read block device.
//! The driver is self-configuring: at `init` time it parses the device's
//! Serial Flash Discoverable Parameters (SFDP) tables to determine geometry,
//! instruction set, bus-mode capabilities, addressing width, reset protocol
//! and erase hierarchy.
//!
//! The low-level QSPI controller is consumed as a capability through the
//! [`qspi::QspiBus`] trait; the driver never touches hardware directly.
//!
//! # Example
//!
//! ```ignore
//! use qspif::{ChipSelect, QspifBlockDevice};
//!
//! let mut device = QspifBlockDevice::new(controller, ChipSelect(0), 40_000_000);
//! device.init()?;
//!
//! let mut buf = [0u8; 256];
//! device.read(0, &mut buf)?;
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "std")]
extern crate std;

pub mod error;
pub mod flash;
pub mod protocol;
pub mod qspi;
pub mod sfdp;
pub mod spi;
pub mod transport;

pub use error::{Error, Result};
pub use flash::device::QspifBlockDevice;
pub use flash::registry::ChipSelect;
pub use qspi::QspiBus;

//! SPI bus primitives: standard opcodes and transaction formats

pub mod bus;
pub mod opcodes;

pub use bus::{AddressSize, BusFormat, BusWidth};

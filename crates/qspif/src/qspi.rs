//! The consumed QSPI controller capability

use crate::error::Result;
use crate::spi::BusFormat;

/// Blocking QSPI controller capability consumed by the driver
///
/// One implementation drives one chip select; a driver instance owns its
/// controller handle exclusively for its lifetime. Sharing a controller
/// between instances must be mediated by the chip-select registry.
///
/// All operations block until the bus transaction completes. The only
/// suspension point of the driver is [`delay_ms`](Self::delay_ms), which the
/// memory-ready poll calls between status reads.
pub trait QspiBus {
    /// Set the bus clock frequency in Hz
    fn set_frequency(&mut self, hz: u32) -> Result<()>;

    /// Apply the format used by subsequent transactions
    fn configure_format(&mut self, format: &BusFormat) -> Result<()>;

    /// Issue an instruction with an optional address, transmit `tx`, then
    /// receive into `rx`
    fn command_transfer(
        &mut self,
        instruction: u8,
        addr: Option<u32>,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<()>;

    /// Read `buf.len()` bytes starting at `addr` in the configured format
    ///
    /// Returns the number of bytes actually read.
    fn read(&mut self, instruction: u8, alt: Option<u8>, addr: u32, buf: &mut [u8])
        -> Result<usize>;

    /// Write `data` starting at `addr` in the configured format
    ///
    /// Returns the number of bytes the controller reports written; callers
    /// treat a short write as a device error.
    fn write(&mut self, instruction: u8, alt: Option<u8>, addr: u32, data: &[u8])
        -> Result<usize>;

    /// Host sleep primitive used by the memory-ready poll
    fn delay_ms(&mut self, ms: u32);
}

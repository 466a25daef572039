//! SFDP discovery: header chain, Basic Parameters Table, Sector Map Table
//!
//! JEDEC JESD216 lets a flash device describe itself. The parser walks the
//! header chain, locates the Basic Parameters Table (mandatory) and the
//! Sector Map Table (optional), and decodes the capabilities the driver
//! derives its configuration from.

pub mod parser;
pub mod types;

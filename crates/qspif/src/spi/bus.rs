//! QSPI bus formats
//!
//! The transport models the controller format as an explicit value applied
//! per operation and restored afterwards, rather than as hidden controller
//! state.

/// Number of data lines used by one phase of a QSPI transaction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BusWidth {
    /// One data line
    #[default]
    Single,
    /// Two data lines
    Dual,
    /// Four data lines
    Quad,
}

impl BusWidth {
    /// Number of physical data lines
    pub const fn lines(&self) -> u8 {
        match self {
            Self::Single => 1,
            Self::Dual => 2,
            Self::Quad => 4,
        }
    }
}

/// Address size on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressSize {
    /// 3-byte (24-bit) addressing, up to 16 MiB
    #[default]
    ThreeByte,
    /// 4-byte (32-bit) addressing
    FourByte,
}

impl AddressSize {
    /// Address width in bits
    pub const fn bits(&self) -> u8 {
        match self {
            Self::ThreeByte => 24,
            Self::FourByte => 32,
        }
    }
}

/// Dummy cycles mandated by the RSFDP instruction
pub const SFDP_READ_DUMMY_CYCLES: u8 = 8;

/// A complete bus format for one transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusFormat {
    /// Lines used for the instruction phase
    pub inst_width: BusWidth,
    /// Lines used for the address phase
    pub addr_width: BusWidth,
    /// Address size on the wire
    pub addr_size: AddressSize,
    /// Lines used for the alt (mode) phase
    pub alt_width: BusWidth,
    /// Alt phase size in bits
    pub alt_size_bits: u8,
    /// Lines used for the data phase
    pub data_width: BusWidth,
    /// Dummy clock cycles between address and data
    pub dummy_cycles: u8,
}

impl BusFormat {
    /// Default 1-1-1 format with zero dummy cycles
    ///
    /// All commands other than data reads and RSFDP use this format;
    /// program and erase are constrained by flash memory performance more
    /// than bus performance.
    pub const fn single(addr_size: AddressSize) -> Self {
        Self {
            inst_width: BusWidth::Single,
            addr_width: BusWidth::Single,
            addr_size,
            alt_width: BusWidth::Single,
            alt_size_bits: 8,
            data_width: BusWidth::Single,
            dummy_cycles: 0,
        }
    }

    /// Format mandated by the RSFDP instruction: 1-1-1, 24-bit address,
    /// 8 dummy cycles, regardless of the discovered operating mode
    pub const fn sfdp() -> Self {
        let mut fmt = Self::single(AddressSize::ThreeByte);
        fmt.dummy_cycles = SFDP_READ_DUMMY_CYCLES;
        fmt
    }
}

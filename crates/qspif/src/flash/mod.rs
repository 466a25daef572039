//! The block device: descriptor, erase planner, instance registry, facade

pub mod device;
pub mod erase_plan;
pub mod params;
pub mod registry;

pub use device::QspifBlockDevice;
pub use params::{DeviceParams, EraseTypes, Region};
pub use registry::{ChipSelect, ClaimStatus};

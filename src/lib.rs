//! flash25
//!
//! Block-device driver for SST25-family SPI NOR flash memories.
//!
//! The crate is transport-agnostic: callers supply the blocking full-duplex
//! bus exchange primitive by implementing [`FlashAccess`], and the driver
//! handles the chip's command protocol, identification, write-enable gating,
//! and completion polling.

pub mod chips;
pub mod device;
pub mod flash;
pub mod partition;

pub use chips::{ChipInfo, Geometry};
pub use device::{BlockDevice, DeviceState, Flash25, WriteMode};
pub use flash::{Error, Flash, FlashAccess, Result, StatusRegister, ERASED_BYTE};
pub use partition::{Partition, PartitionDescriptor};

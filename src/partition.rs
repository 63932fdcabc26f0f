//! Partition views over a block device.
//!
//! A partition is a named sub-range of a parent device's pages. It performs
//! no bus I/O of its own: every operation translates the partition-relative
//! page address to a parent-absolute one and delegates. Views borrow the
//! parent mutably, so a partition can never outlive its device and whole
//! operations are serialised by the borrow checker.

use crate::chips::Geometry;
use crate::device::BlockDevice;
use crate::flash::{Error, Result};

/// One entry in a partition table.
#[derive(Copy, Clone, Debug)]
pub struct PartitionDescriptor {
    /// Partition name, for log messages.
    pub name: &'static str,
    /// First parent page of the partition.
    pub start_block: u32,
    /// Partition length in pages.
    pub num_blocks: u32,
}

/// Validate a partition table against a device geometry.
///
/// Each descriptor must be non-empty and lie within the device, and no two
/// descriptors may overlap.
pub fn validate_table(geometry: Geometry, table: &[PartitionDescriptor]) -> Result<()> {
    for part in table {
        match part.start_block.checked_add(part.num_blocks) {
            Some(end) if part.num_blocks > 0 && end <= geometry.num_pages => {}
            _ => {
                log::error!("Partition {:?} does not fit device of {} pages",
                            part.name, geometry.num_pages);
                return Err(Error::InvalidRange);
            }
        }
    }
    for (index, part) in table.iter().enumerate() {
        for other in &table[index + 1..] {
            if part.start_block < other.start_block + other.num_blocks
                && other.start_block < part.start_block + part.num_blocks
            {
                log::error!("Partitions {:?} and {:?} overlap", part.name, other.name);
                return Err(Error::InvalidRange);
            }
        }
    }
    Ok(())
}

/// A view of a sub-range of a parent block device.
pub struct Partition<'p, D: BlockDevice> {
    parent: &'p mut D,
    name: &'static str,
    start_block: u32,
    num_blocks: u32,
}

impl<'p, D: BlockDevice> Partition<'p, D> {
    /// Open a partition view on an active parent device.
    ///
    /// The descriptor is validated against the parent geometry, so the
    /// parent must already be connected.
    pub fn open(parent: &'p mut D, descriptor: &PartitionDescriptor) -> Result<Self> {
        let geometry = parent.geometry()?;
        validate_table(geometry, std::slice::from_ref(descriptor))?;
        log::debug!("Opened partition {:?}: {} pages at page {}",
                    descriptor.name, descriptor.num_blocks, descriptor.start_block);
        Ok(Partition {
            parent,
            name: descriptor.name,
            start_block: descriptor.start_block,
            num_blocks: descriptor.num_blocks,
        })
    }

    /// Get the partition name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Translate a partition-relative page range to a parent-absolute start
    /// page, validating it against the partition bounds.
    fn absolute_block(&self, start_block: u32, count: u32) -> Result<u32> {
        match start_block.checked_add(count) {
            Some(end) if end <= self.num_blocks => {}
            _ => {
                log::error!("Page range {}+{} exceeds partition {:?} of {} pages",
                            start_block, count, self.name, self.num_blocks);
                return Err(Error::InvalidRange);
            }
        }
        Ok(self.start_block + start_block)
    }
}

impl<'p, D: BlockDevice> BlockDevice for Partition<'p, D> {
    fn connect(&mut self) -> Result<()> {
        self.parent.connect()
    }

    fn disconnect(&mut self) {
        self.parent.disconnect()
    }

    /// Parent geometry restricted to the partition's page count.
    fn geometry(&self) -> Result<Geometry> {
        let parent = self.parent.geometry()?;
        Ok(Geometry { num_pages: self.num_blocks, ..parent })
    }

    fn read_blocks(&mut self, start_block: u32, count: u32) -> Result<Vec<u8>> {
        let absolute = self.absolute_block(start_block, count)?;
        self.parent.read_blocks(absolute, count)
    }

    fn write_blocks(&mut self, start_block: u32, count: u32, data: &[u8]) -> Result<()> {
        let absolute = self.absolute_block(start_block, count)?;
        self.parent.write_blocks(absolute, count, data)
    }

    fn erase_blocks(&mut self, start_block: u32, count: u32) -> Result<()> {
        let absolute = self.absolute_block(start_block, count)?;
        self.parent.erase_blocks(absolute, count)
    }
}

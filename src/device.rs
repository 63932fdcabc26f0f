//! Block-device interface over the SST25 protocol engine.
//!
//! [`Flash25`] owns the device state machine: it identifies the attached
//! chip against the supported-device table on connect, and once active it
//! dispatches page-addressed read, write, and erase requests to the raw
//! byte-addressed engine. All page-to-byte conversion happens here, with
//! checked arithmetic, so the protocol layer never sees an out-of-device
//! address.

use crate::chips::{self, ChipInfo, Geometry};
use crate::flash::{Error, Flash, FlashAccess, Result};

/// Device lifecycle state.
///
/// `Connecting` is transient: a `connect()` call resolves it to `Active` on a
/// successful identification or back to `Stopped` on failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// No device identified; geometry is not valid.
    Stopped,
    /// Identification in progress.
    Connecting,
    /// Geometry valid, operations permitted.
    Active,
}

/// Programming strategy used by `write_blocks`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// One write-enable/program/poll/write-disable cycle per byte.
    Byte,
    /// Auto-address-increment word programming: one status poll per 16-bit
    /// word, with the address sent only once per run.
    AaiWord,
}

/// Uniform block-device contract.
///
/// All addressing is in pages. Every operation except `connect` and
/// `disconnect` requires the device to be active and returns
/// [`Error::NotActive`] otherwise.
pub trait BlockDevice {
    /// Identify the attached chip and make the device active.
    fn connect(&mut self) -> Result<()>;

    /// Return the device to the stopped state.
    fn disconnect(&mut self);

    /// Get the device geometry.
    fn geometry(&self) -> Result<Geometry>;

    /// Read `count` pages starting at page `start_block`.
    fn read_blocks(&mut self, start_block: u32, count: u32) -> Result<Vec<u8>>;

    /// Write `count` pages of `data` starting at page `start_block`.
    ///
    /// `data` must be exactly `count` pages long. The target range is
    /// expected to be in the erased state; bytes already erased in `data`
    /// are skipped.
    fn write_blocks(&mut self, start_block: u32, count: u32, data: &[u8]) -> Result<()>;

    /// Erase `count` pages starting at page `start_block`.
    ///
    /// Both `start_block` and `count` must be aligned to the erase-sector
    /// granularity, except that erasing from page 0 for at least the whole
    /// device is performed as a single chip erase.
    fn erase_blocks(&mut self, start_block: u32, count: u32) -> Result<()>;
}

/// SST25 flash exposed as a block device.
pub struct Flash25<'a, A: FlashAccess> {
    flash: Flash<'a, A>,
    state: DeviceState,
    chip: Option<&'static ChipInfo>,
    jedec_id: u32,
    write_mode: WriteMode,
}

impl<'a, A: FlashAccess> Flash25<'a, A> {
    /// Create a new driver instance over the given bus access provider.
    ///
    /// The instance starts in the stopped state; call `connect()` to
    /// identify the chip before using any other operation.
    pub fn new(access: &'a mut A) -> Self {
        Flash25 {
            flash: Flash::new(access),
            state: DeviceState::Stopped,
            chip: None,
            jedec_id: 0,
            write_mode: WriteMode::AaiWord,
        }
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Get the raw JEDEC ID read by the last `connect()`, or 0 before one.
    pub fn jedec_id(&self) -> u32 {
        self.jedec_id
    }

    /// Get the identified chip table entry, once active.
    pub fn chip(&self) -> Option<&'static ChipInfo> {
        self.chip
    }

    /// Get the programming strategy used by `write_blocks`.
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Set the programming strategy used by `write_blocks`.
    ///
    /// AAI word programming is the default; it is substantially faster than
    /// byte programming and produces identical flash contents.
    pub fn set_write_mode(&mut self, mode: WriteMode) {
        self.write_mode = mode;
    }

    /// Access the underlying protocol engine, e.g. to adjust timeouts or
    /// enable fast reads.
    pub fn flash_mut(&mut self) -> &mut Flash<'a, A> {
        &mut self.flash
    }

    /// Clear the chip's block-protection bits.
    ///
    /// SST25 parts power up write-protected, so a freshly attached chip
    /// typically needs this once before any program or erase succeeds.
    pub fn unprotect(&mut self) -> Result<()> {
        self.active_chip()?;
        self.flash.unprotect()
    }

    /// Require the active state and return the identified chip.
    fn active_chip(&self) -> Result<&'static ChipInfo> {
        match (self.state, self.chip) {
            (DeviceState::Active, Some(chip)) => Ok(chip),
            _ => Err(Error::NotActive),
        }
    }

    /// Convert a page range into a byte address and length, validating that
    /// it lies within the device.
    fn byte_range(&self, geometry: Geometry, start_block: u32, count: u32)
        -> Result<(u32, usize)>
    {
        match start_block.checked_add(count) {
            Some(end) if end <= geometry.num_pages => {}
            _ => {
                log::error!("Page range {}+{} exceeds device size {}",
                            start_block, count, geometry.num_pages);
                return Err(Error::InvalidRange);
            }
        }
        let address = start_block.checked_mul(geometry.page_size)
            .ok_or(Error::InvalidRange)?;
        let nbytes = (count as usize).checked_mul(geometry.page_size as usize)
            .ok_or(Error::InvalidRange)?;
        Ok((address, nbytes))
    }
}

impl<'a, A: FlashAccess> BlockDevice for Flash25<'a, A> {
    /// Read the chip identification and look it up in the supported-device
    /// table. On a match the geometry is populated and the device becomes
    /// active; on a miss the device returns to stopped and the unrecognised
    /// ID is reported.
    fn connect(&mut self) -> Result<()> {
        self.state = DeviceState::Connecting;
        self.chip = None;

        let jedec_id = match self.flash.read_jedec_id() {
            Ok(id) => id,
            Err(e) => {
                self.state = DeviceState::Stopped;
                return Err(e);
            }
        };
        self.jedec_id = jedec_id;

        match chips::lookup(jedec_id) {
            Some(chip) => {
                log::debug!("Identified {} ({} pages of {} bytes)",
                            chip.name, chip.geometry.num_pages, chip.geometry.page_size);
                self.chip = Some(chip);
                self.state = DeviceState::Active;
                Ok(())
            }
            None => {
                log::error!("JEDEC ID 0x{:06X} not in supported-device table", jedec_id);
                self.state = DeviceState::Stopped;
                Err(Error::UnrecognizedDevice { jedec_id })
            }
        }
    }

    fn disconnect(&mut self) {
        log::debug!("Disconnecting");
        self.state = DeviceState::Stopped;
    }

    fn geometry(&self) -> Result<Geometry> {
        self.active_chip().map(|chip| chip.geometry)
    }

    fn read_blocks(&mut self, start_block: u32, count: u32) -> Result<Vec<u8>> {
        let chip = self.active_chip()?;
        let (address, nbytes) = self.byte_range(chip.geometry, start_block, count)?;
        self.flash.read(address, nbytes)
    }

    fn write_blocks(&mut self, start_block: u32, count: u32, data: &[u8]) -> Result<()> {
        let chip = self.active_chip()?;
        let (address, nbytes) = self.byte_range(chip.geometry, start_block, count)?;
        if data.len() != nbytes {
            log::error!("Write data is {} bytes but the page range covers {}",
                        data.len(), nbytes);
            return Err(Error::InvalidRange);
        }
        match self.write_mode {
            WriteMode::AaiWord => self.flash.program_aai_words(address, data),
            WriteMode::Byte => self.flash.program_bytes(address, data),
        }
    }

    fn erase_blocks(&mut self, start_block: u32, count: u32) -> Result<()> {
        let chip = self.active_chip()?;
        let geometry = chip.geometry;

        // Erasing from page 0 for the whole device (or more) is a single
        // chip-erase command rather than a sector loop.
        if start_block == 0 && count >= geometry.num_pages {
            return self.flash.erase_chip();
        }

        let pages_per_sector = geometry.pages_per_sector();
        if start_block % pages_per_sector != 0 || count % pages_per_sector != 0 {
            log::error!("Erase range {}+{} not aligned to {}-page sectors",
                        start_block, count, pages_per_sector);
            return Err(Error::InvalidRange);
        }
        let (mut address, _) = self.byte_range(geometry, start_block, count)?;

        for _ in 0..count / pages_per_sector {
            self.flash.erase_sector(address)?;
            address += geometry.erase_size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Access provider that panics on any exchange: operations rejected by
    /// state or range validation must issue no bus traffic at all.
    struct NoBusAccess;

    impl FlashAccess for NoBusAccess {
        fn exchange(&mut self, _data: &[u8]) -> anyhow::Result<Vec<u8>> {
            panic!("unexpected bus exchange");
        }
    }

    #[test]
    fn test_operations_require_active() {
        let mut access = NoBusAccess;
        let mut dev = Flash25::new(&mut access);
        assert_eq!(dev.state(), DeviceState::Stopped);
        assert!(matches!(dev.geometry(), Err(Error::NotActive)));
        assert!(matches!(dev.read_blocks(0, 1), Err(Error::NotActive)));
        assert!(matches!(dev.write_blocks(0, 1, &[0; 256]), Err(Error::NotActive)));
        assert!(matches!(dev.erase_blocks(0, 16), Err(Error::NotActive)));
        assert!(matches!(dev.unprotect(), Err(Error::NotActive)));
    }

    #[test]
    fn test_byte_range_validation() {
        let mut access = NoBusAccess;
        let dev = Flash25::new(&mut access);
        let geometry = Geometry { page_size: 256, erase_size: 4096, num_pages: 8192 };

        assert_eq!(dev.byte_range(geometry, 0, 1).unwrap(), (0, 256));
        assert_eq!(dev.byte_range(geometry, 16, 2).unwrap(), (4096, 512));
        assert_eq!(dev.byte_range(geometry, 8191, 1).unwrap(), (8191 * 256, 256));
        assert!(matches!(dev.byte_range(geometry, 8192, 1), Err(Error::InvalidRange)));
        assert!(matches!(dev.byte_range(geometry, 0, 8193), Err(Error::InvalidRange)));
        assert!(matches!(dev.byte_range(geometry, u32::MAX, 2), Err(Error::InvalidRange)));
    }
}

//! Low-level protocol engine for SST25-series SPI NOR flash.
//!
//! This module builds the command frames, performs bus exchanges through a
//! caller-supplied [`FlashAccess`] provider, and implements the program and
//! erase sequences with their write-enable gating and completion polling.
//! Addressing at this layer is in raw bytes; the block-level interface in
//! [`crate::device`] performs all page arithmetic.

use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Timed out waiting for the flash to become ready.")]
    Timeout,
    #[error("Unrecognised JEDEC ID 0x{jedec_id:06X}.")]
    UnrecognizedDevice { jedec_id: u32 },
    #[error("Operation requires a connected device.")]
    NotActive,
    #[error("Address range invalid for the device geometry.")]
    InvalidRange,

    #[error(transparent)]
    Access(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Value of every byte in an erased sector.
pub const ERASED_BYTE: u8 = 0xFF;

/// Dummy byte clocked out after the address in FastRead commands.
const DUMMY_BYTE: u8 = 0xA5;

/// Default completion budget for a single byte or AAI word program.
const PROGRAM_TIMEOUT: Duration = Duration::from_millis(10);

/// Default completion budget for a sector erase.
const ERASE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default completion budget for a whole-chip erase, which takes far
/// longer than any single sector.
const CHIP_ERASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait for objects which provide access to SPI flash.
///
/// Providers only need to implement `exchange()`, which asserts CS, writes all
/// the bytes in `data` while capturing the received bytes, then de-asserts CS,
/// holding exclusive ownership of the shared bus for the duration of the call.
/// If it provides a performance optimisation, providers may also implement
/// `write()`, which does not require the received data.
pub trait FlashAccess {
    /// Assert CS, write all bytes in `data` to the SPI bus, then de-assert CS.
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        // Default implementation uses `exchange()` and ignores the result data.
        self.exchange(data)?;
        Ok(())
    }

    /// Assert CS, write all bytes in `data` while capturing received data, then de-assert CS.
    ///
    /// Returns the received data.
    fn exchange(&mut self, data: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// SST25 protocol engine.
///
/// This struct provides the raw byte-addressed operations: identification,
/// read, byte and AAI word programming, and sector or chip erase. Every
/// program and erase path gates the command with write-enable and polls the
/// status register for completion under a per-operation timeout.
pub struct Flash<'a, A: FlashAccess> {
    access: &'a mut A,

    /// Use the FastRead instruction (with its dummy byte) instead of ReadData.
    fast_read: bool,

    /// Completion budget for a single byte or AAI word program.
    program_timeout: Duration,

    /// Completion budget for a sector erase.
    erase_timeout: Duration,

    /// Completion budget for a whole-chip erase.
    chip_erase_timeout: Duration,
}

impl<'a, A: FlashAccess> Flash<'a, A> {
    /// Create a new Flash instance using the given FlashAccess provider.
    pub fn new(access: &'a mut A) -> Self {
        Flash {
            access,
            fast_read: false,
            program_timeout: PROGRAM_TIMEOUT,
            erase_timeout: ERASE_TIMEOUT,
            chip_erase_timeout: CHIP_ERASE_TIMEOUT,
        }
    }

    /// Get whether reads use the FastRead instruction.
    pub fn fast_read(&self) -> bool {
        self.fast_read
    }

    /// Set whether reads use the FastRead instruction.
    ///
    /// FastRead permits higher bus clock rates at the cost of one dummy
    /// byte per command; plain ReadData is the default.
    pub fn set_fast_read(&mut self, fast_read: bool) {
        self.fast_read = fast_read;
    }

    /// Get the completion budget for program operations.
    pub fn program_timeout(&self) -> Duration {
        self.program_timeout
    }

    /// Set the completion budget for program operations.
    pub fn set_program_timeout(&mut self, timeout: Duration) {
        self.program_timeout = timeout;
    }

    /// Get the completion budget for sector erase operations.
    pub fn erase_timeout(&self) -> Duration {
        self.erase_timeout
    }

    /// Set the completion budget for sector erase operations.
    pub fn set_erase_timeout(&mut self, timeout: Duration) {
        self.erase_timeout = timeout;
    }

    /// Get the completion budget for whole-chip erase operations.
    pub fn chip_erase_timeout(&self) -> Duration {
        self.chip_erase_timeout
    }

    /// Set the completion budget for whole-chip erase operations.
    pub fn set_chip_erase_timeout(&mut self, timeout: Duration) {
        self.chip_erase_timeout = timeout;
    }

    /// Read the 24-bit JEDEC identification code.
    pub fn read_jedec_id(&mut self) -> Result<u32> {
        let data = self.exchange(Command::ReadJedecId, &[], 3)?;
        let id = u32::from(data[0]) << 16 | u32::from(data[1]) << 8 | u32::from(data[2]);
        log::debug!("Read JEDEC ID 0x{:06X}", id);
        Ok(id)
    }

    /// Read the legacy manufacturer and device ID pair.
    pub fn read_device_id(&mut self) -> Result<(u8, u8)> {
        let data = self.exchange(Command::ReadDeviceId, &[0, 0, 0], 2)?;
        Ok((data[0], data[1]))
    }

    /// Read `length` bytes of data starting at byte address `address`.
    ///
    /// Uses FastRead when configured with `set_fast_read()`, otherwise the
    /// legacy ReadData instruction.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        log::debug!("Reading {} bytes from 0x{:06X}", length, address);
        if self.fast_read {
            let mut param = self.make_address(address).to_vec();
            // Dummy byte after address.
            param.push(DUMMY_BYTE);
            self.exchange(Command::FastRead, &param, length)
        } else {
            let param = self.make_address(address);
            self.exchange(Command::ReadData, &param, length)
        }
    }

    /// Read the status register.
    pub fn read_status(&mut self) -> Result<StatusRegister> {
        self.exchange(Command::ReadStatusRegister, &[], 1)
            .map(|data| StatusRegister(data[0]))
    }

    /// Write the status register.
    ///
    /// SST25 status writes are enabled with the dedicated
    /// EnableWriteStatusRegister instruction rather than WriteEnable.
    pub fn write_status(&mut self, status: StatusRegister) -> Result<()> {
        self.command(Command::EnableWriteStatusRegister)?;
        self.write(Command::WriteStatusRegister, &[status.0])
    }

    /// Clear any block-protect bits that are set.
    ///
    /// SST25 parts power up with all BP bits set, write-protecting the
    /// whole array, so this is typically required once before programming.
    pub fn unprotect(&mut self) -> Result<()> {
        let mut status = self.read_status()?;
        let (bp0, bp1, bp2, bp3) = status.get_block_protect();
        if bp0 || bp1 || bp2 || bp3 {
            log::debug!("Block protect bits are currently set, clearing.");
            status.set_block_protect(false, false, false, false);
            self.write_status(status)?;
        }
        Ok(())
    }

    /// Check if the device is currently busy performing an operation.
    pub fn is_busy(&mut self) -> Result<bool> {
        self.read_status().map(|status| status.get_busy())
    }

    /// Wait until the device stops being busy, or `timeout` elapses.
    ///
    /// The scheduling quantum is yielded between polls so that waiting on
    /// hardware latency does not starve other threads.
    pub fn wait_while_busy(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while self.is_busy()? {
            if start.elapsed() >= timeout {
                log::error!("Timed out after {:?} waiting for busy flag to clear", timeout);
                return Err(Error::Timeout);
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Send the WriteEnable command, setting the WEL in the status register.
    pub fn write_enable(&mut self) -> Result<()> {
        self.command(Command::WriteEnable)
    }

    /// Send the WriteDisable command, clearing the WEL and leaving AAI mode.
    pub fn write_disable(&mut self) -> Result<()> {
        self.command(Command::WriteDisable)
    }

    /// Program `data` starting at byte address `address`, one byte per command.
    ///
    /// Bytes equal to the erased value are skipped without any bus traffic.
    /// Each remaining byte is programmed as its own write-enable, program,
    /// poll, write-disable sequence. The first timeout aborts the operation;
    /// bytes already programmed remain programmed.
    pub fn program_bytes(&mut self, address: u32, data: &[u8]) -> Result<()> {
        log::debug!("Byte programming {} bytes to 0x{:06X}", data.len(), address);
        for (offset, byte) in data.iter().enumerate() {
            // Skip bytes already in the erased state.
            if *byte == ERASED_BYTE {
                continue;
            }

            let mut param = self.make_address(address + offset as u32).to_vec();
            param.push(*byte);
            self.write_enable()?;
            self.write(Command::ByteProgram, &param)?;
            let ready = self.wait_while_busy(self.program_timeout);
            self.write_disable()?;
            ready?;
        }
        Ok(())
    }

    /// Program `data` starting at byte address `address` using
    /// auto-address-increment word programming.
    ///
    /// Data is split into 16-bit words; an odd trailing byte is padded with
    /// the erased value. Words already fully erased are skipped by advancing
    /// the address only. Each run of non-erased words is programmed with a
    /// single write-enable and a single addressed command, followed by short
    /// continuation frames while the chip's internal address counter tracks
    /// the data. A timeout at any step sends WriteDisable to leave AAI mode
    /// and aborts the operation; words already programmed remain programmed.
    pub fn program_aai_words(&mut self, address: u32, data: &[u8]) -> Result<()> {
        log::debug!("AAI word programming {} bytes to 0x{:06X}", data.len(), address);
        let nwords = (data.len() + 1) / 2;
        let word = |index: usize| -> [u8; 2] {
            let lo = data[2 * index];
            match data.get(2 * index + 1) {
                Some(hi) => [lo, *hi],
                None => [lo, ERASED_BYTE],
            }
        };
        let erased = |w: [u8; 2]| w[0] == ERASED_BYTE && w[1] == ERASED_BYTE;

        let mut index = 0;
        while index < nwords {
            // Skip words already in the erased state without any transfer.
            while index < nwords && erased(word(index)) {
                index += 1;
            }
            if index == nwords {
                break;
            }

            // The first word of a run carries the start address; the chip
            // auto-increments from there.
            let mut param = self.make_address(address + 2 * index as u32).to_vec();
            param.extend_from_slice(&word(index));
            self.write_enable()?;
            self.write(Command::AaiWordProgram, &param)?;
            self.wait_aai_ready()?;
            index += 1;

            // Continuation frames omit the address while the run lasts. A
            // word is only treated as erased when both bytes are erased, so
            // a mixed word stays inside the run.
            while index < nwords && !erased(word(index)) {
                let w = word(index);
                self.write(Command::AaiWordProgram, &w)?;
                self.wait_aai_ready()?;
                index += 1;
            }

            self.write_disable()?;
        }
        Ok(())
    }

    /// Erase the sector containing byte address `address`.
    pub fn erase_sector(&mut self, address: u32) -> Result<()> {
        log::debug!("Erasing sector at 0x{:06X}", address);
        let param = self.make_address(address);
        self.write_enable()?;
        self.write(Command::SectorErase, &param)?;
        let ready = self.wait_while_busy(self.erase_timeout);
        self.write_disable()?;
        ready
    }

    /// Erase the entire chip.
    ///
    /// Uses the longer chip-erase completion budget.
    pub fn erase_chip(&mut self) -> Result<()> {
        log::debug!("Erasing entire chip");
        self.write_enable()?;
        self.command(Command::ChipErase)?;
        let ready = self.wait_while_busy(self.chip_erase_timeout);
        self.write_disable()?;
        ready
    }

    /// Writes `command` and `data` to the flash memory, then returns `nbytes` of response.
    pub fn exchange<C: Into<u8>>(&mut self, command: C, data: &[u8], nbytes: usize)
        -> Result<Vec<u8>>
    {
        let mut tx = vec![command.into()];
        tx.extend(data);
        log::trace!("SPI exchange: write {:02X?}, read {} bytes", &tx, nbytes);
        tx.extend(vec![0u8; nbytes]);
        let rx = self.access.exchange(&tx)?;
        log::trace!("SPI exchange: read {:02X?}", &rx[1 + data.len()..]);
        Ok(rx[1 + data.len()..].to_vec())
    }

    /// Writes `command` and `data` to the flash memory, without reading the response.
    pub fn write<C: Into<u8>>(&mut self, command: C, data: &[u8]) -> Result<()> {
        let mut tx = vec![command.into()];
        tx.extend(data);
        log::trace!("SPI write: {:02X?}", &tx);
        self.access.write(&tx)?;
        Ok(())
    }

    /// Convenience method for issuing a single command and not caring about the returned data
    pub fn command<C: Into<u8>>(&mut self, command: C) -> Result<()> {
        self.write(command, &[])?;
        Ok(())
    }

    /// Generate the 3-byte big-endian address field used by every addressed
    /// SST25 command.
    fn make_address(&self, addr: u32) -> [u8; 3] {
        [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
    }

    /// Poll for completion of one AAI word, sending WriteDisable to leave
    /// AAI mode before reporting a failure.
    fn wait_aai_ready(&mut self) -> Result<()> {
        match self.wait_while_busy(self.program_timeout) {
            Ok(()) => Ok(()),
            Err(e) => {
                // The chip stays in AAI mode with the write-enable latch set
                // until WriteDisable is issued; the poll failure is the error
                // worth reporting even if this frame also fails.
                let _ = self.write_disable();
                Err(e)
            }
        }
    }
}

/// SST25 command opcodes.
///
/// These are taken from the SST25VF016B datasheet; the instruction set is
/// common across the SST25VF family.
///
/// Only single I/O commands are listed.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[allow(unused)]
#[repr(u8)]
enum Command {
    // Read instructions.
    ReadData = 0x03,
    FastRead = 0x0B,

    // Erase instructions.
    // Sector erase affects 4kB; the block erases affect 32kB and 64kB.
    SectorErase = 0x20,
    BlockErase32 = 0x52,
    BlockErase64 = 0xD8,
    ChipErase = 0x60,

    // Program instructions.
    // AAI programming writes one 16-bit word per command and the chip
    // advances its internal address counter between commands.
    ByteProgram = 0x02,
    AaiWordProgram = 0xAD,

    // Status register instructions.
    ReadStatusRegister = 0x05,
    EnableWriteStatusRegister = 0x50,
    WriteStatusRegister = 0x01,

    // Write-enable latch instructions.
    WriteEnable = 0x06,
    WriteDisable = 0x04,

    // Identification instructions.
    ReadDeviceId = 0x90,
    ReadJedecId = 0x9F,

    // Hardware end-of-write detection on the SO pin during AAI mode.
    EnableSoBusy = 0x70,
    DisableSoBusy = 0x80,
}

/// Status register contents.
#[derive(Copy, Clone, Debug)]
pub struct StatusRegister(pub u8);

impl StatusRegister {
    /// Get BUSY bit, set while a program or erase is in progress.
    pub fn get_busy(&self) -> bool {
        self.0 & 0b0000_0001 != 0
    }

    /// Get WEL (write-enable latch) bit.
    pub fn get_wel(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }

    /// Get (BP0, BP1, BP2, BP3) bits.
    pub fn get_block_protect(&self) -> (bool, bool, bool, bool) {
        let bp = (self.0 & 0b0011_1100) >> 2;
        (bp & 0b0001 != 0, bp & 0b0010 != 0, bp & 0b0100 != 0, bp & 0b1000 != 0)
    }

    /// Set (BP0, BP1, BP2, BP3) bits.
    fn set_block_protect(&mut self, bp0: bool, bp1: bool, bp2: bool, bp3: bool) {
        self.0 &= 0b1100_0011;
        self.0 |= ((bp0 as u8) << 2) | ((bp1 as u8) << 3)
                | ((bp2 as u8) << 4) | ((bp3 as u8) << 5);
    }

    /// Get AAI bit, set while the chip is in auto-address-increment mode.
    pub fn get_aai(&self) -> bool {
        self.0 & 0b0100_0000 != 0
    }

    /// Get BPL (block-protect lock) bit.
    pub fn get_bpl(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }
}

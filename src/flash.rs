//! Command-layer driver for the Winbond W25Qxx SPI NOR flash family.
//!
//! # Type Parameters
//!
//! * **`SPI`**: the SPI master the chip is attached to.
//! * **`CS`**: the chip-select pin, driven low for the duration of each SPI
//!   transaction and high otherwise.
//! * **`CLK`**: a monotonic millisecond tick, used to bound busy-polls.
//! * **`G`**: the [`FlashGeometry`] of the attached part (`W25Q64` or
//!   `W25Q128`).

use core::fmt::{self, Debug};
use core::marker::PhantomData;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use crate::chip::FlashGeometry;
use crate::transport::Clock;

/// SPI NOR opcodes used by the W25Qxx command set.
pub mod opcodes {
    pub const READ_ID: u8 = 0x90;
    pub const READ_JEDEC_ID: u8 = 0x9F;
    pub const READ_STATUS: u8 = 0x05;
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const WRITE_DISABLE: u8 = 0x04;
    pub const READ: u8 = 0x03;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const SECTOR_ERASE: u8 = 0x20;
    pub const BLOCK_ERASE_64K: u8 = 0xD8;
    pub const CHIP_ERASE: u8 = 0xC7;
    pub const POWER_DOWN: u8 = 0xB9;
    pub const WAKE_UP: u8 = 0xAB;
}

bitflags::bitflags! {
    /// Flash status register bits this driver cares about (spec §3).
    pub struct Status: u8 {
        /// Operation in progress.
        const BUSY = 1 << 0;
        /// Write-enable latch armed.
        const WEL = 1 << 1;
    }
}

/// Time budget for a single SPI transaction (spec §3, `CMD_TIMEOUT_MS` — not
/// separately enforced here since `embedded-hal` 0.2 SPI transfers are
/// synchronous; kept as documentation of the contract a SPI implementation
/// must honor).
pub const CMD_TIMEOUT_MS: u32 = 1000;
/// Busy-poll deadline for program and sector/block erase (spec §3).
pub const BUSY_TIMEOUT_MS: u32 = 5000;
/// Busy-poll deadline for `erase_chip`, which can take tens of seconds on a
/// full W25Q128 (spec §9 open question, resolved in DESIGN.md).
pub const CHIP_ERASE_TIMEOUT_MS: u32 = 100_000;
/// Settle time required after `wake_up` before any further command.
pub const WAKE_UP_DELAY_MS: u32 = 1;

/// Errors surfaced by the flash driver (spec §7).
pub enum Error<SpiE, GpioE> {
    /// The underlying SPI transfer failed.
    Transport(SpiE),
    /// The chip-select pin could not be driven.
    Gpio(GpioE),
    /// A busy-poll deadline elapsed before `BUSY` cleared.
    Timeout,
    /// `program_page` was asked to write more than `PAGE_SIZE` bytes.
    InvalidArgument,
}

impl<SpiE: Debug, GpioE: Debug> Debug for Error<SpiE, GpioE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Error::Transport({:?})", e),
            Error::Gpio(e) => write!(f, "Error::Gpio({:?})", e),
            Error::Timeout => f.write_str("Error::Timeout"),
            Error::InvalidArgument => f.write_str("Error::InvalidArgument"),
        }
    }
}

/// Driver for a W25Q64/W25Q128 SPI NOR flash.
///
/// Owns its SPI master, chip-select pin and clock source for its whole
/// lifetime (spec §3: "no internal mutable state — the device itself is the
/// state").
pub struct Flash<SPI, CS, CLK, G> {
    spi: SPI,
    cs: CS,
    clock: CLK,
    _geometry: PhantomData<G>,
}

impl<SPI, CS, CLK, G> Debug for Flash<SPI, CS, CLK, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flash").finish()
    }
}

impl<SPI, CS, CLK, G> Flash<SPI, CS, CLK, G>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    CLK: Clock,
    G: FlashGeometry,
{
    /// Takes ownership of the transports, drives chip-select high, waits
    /// ~100 ms for the chip to settle, and issues `wake_up` (spec §4.1
    /// `init`).
    pub fn init(spi: SPI, mut cs: CS, clock: CLK) -> Result<Self, Error<SPI::Error, CS::Error>> {
        cs.set_high().map_err(Error::Gpio)?;
        let mut this = Flash {
            spi,
            cs,
            clock,
            _geometry: PhantomData,
        };
        this.spin_ms(100);
        this.wake_up()?;
        info!("Flash::init: chip settled, wake_up issued");
        Ok(this)
    }

    fn spin_ms(&self, ms: u32) {
        let deadline = self.clock.now_ms().wrapping_add(ms);
        while self.clock.now_ms() < deadline {}
    }

    /// Asserts CS, runs `body`, then releases CS — on every exit, including
    /// an error returned by `body` (spec §4.1, §9 "chip-select as a scoped
    /// guard").
    fn with_cs<T>(
        &mut self,
        body: impl FnOnce(&mut SPI) -> Result<T, SPI::Error>,
    ) -> Result<T, Error<SPI::Error, CS::Error>> {
        self.cs.set_low().map_err(Error::Gpio)?;
        let result = body(&mut self.spi);
        self.cs.set_high().map_err(Error::Gpio)?;
        result.map_err(Error::Transport)
    }

    /// opcode-only command (write_enable, write_disable, power_down, wake_up).
    fn command(&mut self, opcode: u8) -> Result<(), Error<SPI::Error, CS::Error>> {
        self.with_cs(|spi| spi.transfer(&mut [opcode]).map(|_| ()))
    }

    fn addressed_command(
        &mut self,
        opcode: u8,
        addr: u32,
    ) -> Result<(), Error<SPI::Error, CS::Error>> {
        let mut buf = address_frame(opcode, addr);
        self.with_cs(|spi| spi.transfer(&mut buf).map(|_| ()))
    }

    /// `read_id` (spec §4.1): opcode `0x90`, three zero address bytes, two
    /// response bytes.
    pub fn read_id(&mut self) -> Result<(u8, u8), Error<SPI::Error, CS::Error>> {
        let mut buf = [opcodes::READ_ID, 0, 0, 0, 0, 0];
        self.with_cs(|spi| spi.transfer(&mut buf).map(|_| ()))?;
        Ok((buf[4], buf[5]))
    }

    /// `read_jedec_id` (spec §4.1): opcode `0x9F`, three response bytes.
    pub fn read_jedec_id(&mut self) -> Result<[u8; 3], Error<SPI::Error, CS::Error>> {
        let mut buf = [opcodes::READ_JEDEC_ID, 0, 0, 0];
        self.with_cs(|spi| spi.transfer(&mut buf).map(|_| ()))?;
        Ok([buf[1], buf[2], buf[3]])
    }

    /// `read_status` (spec §4.1): opcode `0x05`, one response byte.
    pub fn read_status(&mut self) -> Result<Status, Error<SPI::Error, CS::Error>> {
        let mut buf = [opcodes::READ_STATUS, 0];
        self.with_cs(|spi| spi.transfer(&mut buf).map(|_| ()))?;
        Ok(Status::from_bits_truncate(buf[1]))
    }

    /// Arms the write-enable latch. Must immediately precede every program
    /// or erase command (spec §4.1, §8 property 2); the chip clears it again
    /// once that command completes.
    pub fn write_enable(&mut self) -> Result<(), Error<SPI::Error, CS::Error>> {
        self.command(opcodes::WRITE_ENABLE)
    }

    /// Clears the write-enable latch.
    pub fn write_disable(&mut self) -> Result<(), Error<SPI::Error, CS::Error>> {
        self.command(opcodes::WRITE_DISABLE)
    }

    /// Unconditional read: no write-enable, no busy-wait (spec §4.1).
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<SPI::Error, CS::Error>> {
        let mut cmd = address_frame(opcodes::READ, addr);
        self.cs.set_low().map_err(Error::Gpio)?;
        let result = self
            .spi
            .transfer(&mut cmd)
            .and_then(|_| self.spi.transfer(buf))
            .map(|_| ());
        self.cs.set_high().map_err(Error::Gpio)?;
        result.map_err(Error::Transport)
    }

    /// Programs up to `PAGE_SIZE` bytes at `addr`. Rejects spans that would
    /// cross a page boundary worth of data (spec §4.1); it is the caller's
    /// contract (see [`Flash::write`]) to never ask for more.
    pub fn program_page(
        &mut self,
        addr: u32,
        data: &mut [u8],
    ) -> Result<(), Error<SPI::Error, CS::Error>> {
        if data.len() > G::PAGE_SIZE as usize {
            return Err(Error::InvalidArgument);
        }

        self.write_enable()?;

        let mut cmd = address_frame(opcodes::PAGE_PROGRAM, addr);
        self.cs.set_low().map_err(Error::Gpio)?;
        let result = self
            .spi
            .transfer(&mut cmd)
            .and_then(|_| self.spi.transfer(data))
            .map(|_| ());
        self.cs.set_high().map_err(Error::Gpio)?;
        result.map_err(Error::Transport)?;

        self.wait_for_write_end(BUSY_TIMEOUT_MS)
    }

    /// Page-aware multi-page program (spec §4.1). The central invariant: no
    /// single `program_page` call ever spans a 256-byte page boundary (spec
    /// §8 property 1).
    pub fn write(&mut self, addr: u32, data: &mut [u8]) -> Result<(), Error<SPI::Error, CS::Error>> {
        let page_size = G::PAGE_SIZE;
        let mut current_addr = addr;
        let mut remaining = data.len();
        let mut offset = 0usize;

        while remaining > 0 {
            let page_off = current_addr % page_size;
            let chunk = core::cmp::min(page_size - page_off, remaining as u32) as usize;
            self.program_page(current_addr, &mut data[offset..offset + chunk])?;
            current_addr += chunk as u32;
            offset += chunk;
            remaining -= chunk;
        }

        Ok(())
    }

    /// Erases the 4 KiB sector containing `addr`.
    pub fn erase_sector(&mut self, addr: u32) -> Result<(), Error<SPI::Error, CS::Error>> {
        self.write_enable()?;
        self.addressed_command(opcodes::SECTOR_ERASE, addr)?;
        self.wait_for_write_end(BUSY_TIMEOUT_MS)
    }

    /// Erases the 64 KiB block containing `addr`.
    pub fn erase_block_64k(&mut self, addr: u32) -> Result<(), Error<SPI::Error, CS::Error>> {
        self.write_enable()?;
        self.addressed_command(opcodes::BLOCK_ERASE_64K, addr)?;
        self.wait_for_write_end(BUSY_TIMEOUT_MS)
    }

    /// Erases the whole chip. Uses `CHIP_ERASE_TIMEOUT_MS`, not
    /// `BUSY_TIMEOUT_MS` — a full erase can take tens of seconds (spec §9).
    pub fn erase_chip(&mut self) -> Result<(), Error<SPI::Error, CS::Error>> {
        self.write_enable()?;
        self.command(opcodes::CHIP_ERASE)?;
        self.wait_for_write_end(CHIP_ERASE_TIMEOUT_MS)
    }

    /// Puts the chip into power-down mode.
    pub fn power_down(&mut self) -> Result<(), Error<SPI::Error, CS::Error>> {
        self.command(opcodes::POWER_DOWN)
    }

    /// Wakes the chip from power-down. Blocks `WAKE_UP_DELAY_MS` after the
    /// command completes, since the chip cannot accept another command
    /// immediately.
    pub fn wake_up(&mut self) -> Result<(), Error<SPI::Error, CS::Error>> {
        self.command(opcodes::WAKE_UP)?;
        self.spin_ms(WAKE_UP_DELAY_MS);
        Ok(())
    }

    /// Polls `read_status` until `BUSY` clears or `deadline_ms` elapses past
    /// the current tick. Always reads at least once before checking the
    /// deadline, since the common case completes in microseconds (spec
    /// §4.1).
    pub fn wait_for_write_end(
        &mut self,
        deadline_ms: u32,
    ) -> Result<(), Error<SPI::Error, CS::Error>> {
        let deadline = self.clock.now_ms().wrapping_add(deadline_ms);
        loop {
            let status = self.read_status()?;
            if !status.contains(Status::BUSY) {
                return Ok(());
            }
            if self.clock.now_ms() >= deadline {
                warn!("wait_for_write_end: busy-poll deadline exceeded");
                return Err(Error::Timeout);
            }
        }
    }
}

fn address_frame(opcode: u8, addr: u32) -> [u8; 4] {
    [opcode, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}

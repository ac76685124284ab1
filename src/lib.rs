//! Firmware core for a UART-driven bootloader that programs an external
//! SPI NOR flash (Winbond W25Q64 / W25Q128).
//!
//! This crate implements two tightly-coupled, independently testable halves:
//!
//! * [`flash`] — a command-layer driver for the W25Qxx SPI NOR family,
//!   generic over [`embedded-hal`] 0.2's blocking SPI and GPIO traits.
//! * [`protocol`] — a request/response state machine that frames commands
//!   off a byte-oriented serial link, validates payloads with CRC-16/CCITT,
//!   drives the flash driver, and replies with ACK/NACK plus payload.
//!
//! Board bring-up, clock/pin configuration, and the concrete UART/SPI
//! transport primitives are out of scope: callers supply them through the
//! [`transport::SerialPort`] and [`transport::Clock`] traits (serial) and
//! through `embedded-hal`'s `Transfer<u8>` / `OutputPin` traits (SPI).
//!
//! [`embedded-hal`]: https://docs.rs/embedded-hal/0.2/

#![cfg_attr(not(test), no_std)]
#![warn(missing_debug_implementations, rust_2018_idioms)]

#[macro_use]
mod log;

pub mod chip;
pub mod crc;
pub mod flash;
pub mod protocol;
pub mod transport;

pub use crate::chip::{FlashGeometry, W25Q128, W25Q64};
pub use crate::flash::{Error as FlashError, Flash};
pub use crate::protocol::{BootSession, CommandError};
pub use crate::transport::{Clock, RecvError, SerialPort};

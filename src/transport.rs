//! Collaborator traits standing in for the byte-level UART transport and
//! the monotonic millisecond tick (spec §1: both are assumed to exist and
//! are out of scope for this crate).

use core::fmt::Debug;

/// A reason [`SerialPort::recv`] failed to fill the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError<E> {
    /// The underlying transport reported an error.
    Transport(E),
    /// No byte arrived before the deadline.
    Timeout,
}

/// A blocking, byte-oriented serial link.
///
/// Implementations are expected to be the thin wrapper around a hardware
/// UART peripheral that spec §1 calls out as an external collaborator:
/// `send` blocks until all bytes are queued for transmission, `recv` blocks
/// until either `buf` is filled or `timeout_ms` elapses.
pub trait SerialPort {
    /// The underlying transport's error type.
    type Error: Debug;

    /// Transmits `bytes` in full, blocking until done.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Fills `buf` completely, blocking up to `timeout_ms` milliseconds.
    fn recv(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<(), RecvError<Self::Error>>;
}

/// A monotonic millisecond tick, used to bound busy-polls and serial
/// receives against a wall-clock deadline.
pub trait Clock {
    /// Returns a monotonically non-decreasing millisecond timestamp.
    fn now_ms(&self) -> u32;
}

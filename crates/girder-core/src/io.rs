//! The byte-device seam between transports and protocol codecs.

use std::io;

use crate::clock::Deadline;

/// A deadline-driven byte device.
///
/// Sockets and stream wrappers implement this so protocol readers and writers
/// can drive any of them uniformly. The contract mirrors the transport layer:
///
/// - `read`/`write` return `Ok(0)` when the deadline expired before any byte
///   moved; a timeout is not an error.
/// - An orderly close of the peer surfaces as
///   [`io::ErrorKind::ConnectionAborted`].
/// - `read` and `write` take `&self`: an implementation must allow one reader
///   and one writer to operate concurrently on disjoint directions.
pub trait IoDevice {
    /// Read up to `buf.len()` bytes, waiting no longer than `deadline`.
    fn read(&self, buf: &mut [u8], deadline: Deadline) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes, waiting no longer than `deadline`.
    fn write(&self, buf: &[u8], deadline: Deadline) -> io::Result<usize>;

    fn is_open(&self) -> bool;

    /// Release the underlying descriptor. Idempotent.
    fn close(&mut self);
}

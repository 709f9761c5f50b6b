//! Buffered driver of the message parser against a byte device.

use girder_core::clock::Deadline;
use girder_core::io::IoDevice;

use crate::error::{HttpError, Result};
use crate::parser::{HttpMessageParser, MessageKind, ParserConfig};

pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// What one `read` call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// The current message is fully framed.
    pub completed: bool,
    /// Body bytes placed into the caller's buffer by this call.
    pub body_bytes: usize,
}

/// Drives an [`HttpMessageParser`] over any [`IoDevice`].
///
/// Bytes are pulled from the device only when the internal buffer is
/// exhausted, so pipelined messages are never over-read: whatever follows a
/// completed message stays buffered for the next one. The first `read` after
/// completion restarts framing automatically (persistent connections).
pub struct MessageReader {
    parser: HttpMessageParser,
    max_body_size: usize,
    read_buffer: Vec<u8>,
    bytes_read: usize,
    bytes_parsed: usize,
    body_total: usize,
}

impl MessageReader {
    pub fn new(kind: MessageKind) -> Self {
        MessageReader::with_limits(kind, None, DEFAULT_MAX_BODY_SIZE, DEFAULT_READ_BUFFER_SIZE)
    }

    pub fn with_limits(
        kind: MessageKind,
        config: Option<ParserConfig>,
        max_body_size: usize,
        buffer_size: usize,
    ) -> Self {
        let parser = match config {
            Some(config) => HttpMessageParser::with_config(kind, config),
            None => HttpMessageParser::new(kind),
        };
        MessageReader {
            parser,
            max_body_size,
            read_buffer: vec![0; buffer_size],
            bytes_read: 0,
            bytes_parsed: 0,
            body_total: 0,
        }
    }

    pub fn parser(&self) -> &HttpMessageParser {
        &self.parser
    }

    /// Total body bytes of the current message seen so far.
    pub fn body_total(&self) -> usize {
        self.body_total
    }

    /// Restart framing for the next message, keeping buffered input.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.body_total = 0;
    }

    /// Drop buffered input too; for reuse on a fresh connection.
    pub fn reset_hard(&mut self) {
        self.reset();
        self.bytes_read = 0;
        self.bytes_parsed = 0;
    }

    /// Drive the parser until the message completes, the body buffer fills,
    /// or the deadline passes. `completed == false` with zero body bytes
    /// means the deadline expired.
    pub fn read<D: IoDevice>(
        &mut self,
        device: &D,
        body_buf: &mut [u8],
        deadline: Deadline,
    ) -> Result<ReadOutcome> {
        if self.parser.is_completed() {
            self.reset();
        }
        let mut body_written = 0;
        loop {
            if self.bytes_parsed < self.bytes_read {
                let (consumed, produced) = self.parser.parse_buf(
                    &self.read_buffer[self.bytes_parsed..self.bytes_read],
                    &mut body_buf[body_written..],
                );
                self.bytes_parsed += consumed;
                body_written += produced;
                self.body_total += produced;
                if self.body_total > self.max_body_size {
                    return Err(HttpError::BodyTooLong(self.max_body_size));
                }
                if self.parser.is_bad() {
                    return Err(self
                        .parser
                        .take_error()
                        .unwrap_or(HttpError::InvalidChunkSize));
                }
                if self.parser.is_completed() {
                    return Ok(ReadOutcome {
                        completed: true,
                        body_bytes: body_written,
                    });
                }
                if body_written == body_buf.len() && !body_buf.is_empty() {
                    return Ok(ReadOutcome {
                        completed: false,
                        body_bytes: body_written,
                    });
                }
                if deadline.has_passed() {
                    return Ok(ReadOutcome {
                        completed: false,
                        body_bytes: body_written,
                    });
                }
            } else {
                self.bytes_parsed = 0;
                self.bytes_read = device.read(&mut self.read_buffer, deadline)?;
                if self.bytes_read == 0 {
                    // Deadline expired at the device.
                    return Ok(ReadOutcome {
                        completed: false,
                        body_bytes: body_written,
                    });
                }
            }
        }
    }
}

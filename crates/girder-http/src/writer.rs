//! Streaming HTTP message writer.
//!
//! The writer composes the start line and header block lazily, on the first
//! write. Header fields are flagged once serialised: setting or removing a
//! field that already went out on the wire is an error, and fields added
//! after the chunked header block has been sent become trailers at
//! `finalize`. A write that could not finish before its deadline leaves the
//! remainder in the send buffer; the caller drains it with `flush` before
//! anything else.

use std::fmt::Write as _;

use girder_core::clock::Deadline;
use girder_core::io::IoDevice;

use crate::error::{HttpError, Result};
use crate::headers::Headers;

const CONTENT_LENGTH: &str = "Content-Length";
const TRANSFER_ENCODING: &str = "Transfer-Encoding";

struct HeaderEntry {
    name: String,
    value: String,
    serialised: bool,
}

pub struct MessageWriter {
    first_line: String,
    header: Vec<HeaderEntry>,
    transmission_started: bool,
    chunked_header_composed: bool,
    finalising: bool,
    send_buffer: Vec<u8>,
    bytes_sent: usize,
}

impl MessageWriter {
    /// `first_line` is the start line without its CRLF.
    pub fn new(first_line: impl Into<String>) -> Self {
        MessageWriter {
            first_line: first_line.into(),
            header: Vec::new(),
            transmission_started: false,
            chunked_header_composed: false,
            finalising: false,
            send_buffer: Vec::new(),
            bytes_sent: 0,
        }
    }

    /// Replace the start line. Only legal before transmission starts.
    pub fn set_first_line(&mut self, first_line: impl Into<String>) -> Result<()> {
        if self.transmission_started {
            return Err(HttpError::FlushNeeded);
        }
        self.first_line = first_line.into();
        Ok(())
    }

    pub fn transmission_started(&self) -> bool {
        self.transmission_started
    }

    /// Unsent bytes remain from an earlier deadline-bounded write.
    pub fn needs_flush(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    /// Set a header field. With `replace_if_exists`, existing fields of that
    /// name are removed first; a field that has already been serialised
    /// cannot be replaced.
    pub fn set_header(
        &mut self,
        name: &str,
        value: impl Into<String>,
        replace_if_exists: bool,
    ) -> Result<()> {
        if replace_if_exists {
            self.remove_header(name)?;
        }
        self.header.push(HeaderEntry {
            name: name.to_string(),
            value: value.into(),
            serialised: false,
        });
        Ok(())
    }

    /// Remove every field of this name; fails if any of them has already
    /// been serialised.
    pub fn remove_header(&mut self, name: &str) -> Result<()> {
        if self
            .header
            .iter()
            .any(|e| e.name.eq_ignore_ascii_case(name) && e.serialised)
        {
            return Err(HttpError::HeaderFieldAlreadySerialised(name.to_string()));
        }
        self.header.retain(|e| !e.name.eq_ignore_ascii_case(name));
        Ok(())
    }

    pub fn header_contains(&self, name: &str, value: &str) -> bool {
        self.header
            .iter()
            .any(|e| e.name.eq_ignore_ascii_case(name) && e.value == value)
    }

    /// A snapshot of the header fields, serialised or not.
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        for entry in &self.header {
            headers.append(entry.name.clone(), entry.value.clone());
        }
        headers
    }

    /// Send `buf` as one chunk of a chunked-encoded body. The first call
    /// serialises the start line and headers with
    /// `Transfer-Encoding: chunked`.
    ///
    /// `Ok(false)` means the deadline expired mid-send; call `flush` until it
    /// returns `true` before writing anything else.
    pub fn write_chunk<D: IoDevice>(
        &mut self,
        device: &D,
        buf: &[u8],
        deadline: Deadline,
    ) -> Result<bool> {
        if self.needs_flush() {
            return Err(HttpError::FlushNeeded);
        }
        if buf.is_empty() {
            return Ok(true);
        }
        if !self.chunked_header_composed {
            self.set_header(TRANSFER_ENCODING, "chunked", true)?;
            self.compose_envelope();
            self.chunked_header_composed = true;
        }
        let mut size_line = String::new();
        let _ = write!(size_line, "{:x}\r\n", buf.len());
        self.send_buffer.extend_from_slice(size_line.as_bytes());
        self.send_buffer.extend_from_slice(buf);
        self.send_buffer.extend_from_slice(b"\r\n");
        self.bytes_sent = 0;
        self.flush_buffer(device, deadline)
    }

    /// Send the whole message in one operation with identity framing and an
    /// exact `Content-Length`. Forbidden once a chunked write happened.
    pub fn write_once<D: IoDevice>(
        &mut self,
        device: &D,
        buf: &[u8],
        deadline: Deadline,
    ) -> Result<bool> {
        if self.chunked_header_composed {
            return Err(HttpError::IdentityAfterChunked);
        }
        if self.needs_flush() {
            return Err(HttpError::FlushNeeded);
        }
        self.remove_header(TRANSFER_ENCODING)?;
        if buf.is_empty() {
            self.remove_header(CONTENT_LENGTH)?;
        } else {
            self.set_header(CONTENT_LENGTH, buf.len().to_string(), true)?;
        }
        self.compose_envelope();
        self.send_buffer.extend_from_slice(buf);
        self.bytes_sent = 0;
        if self.flush_buffer(device, deadline)? {
            self.reset();
            Ok(true)
        } else {
            self.finalising = true;
            Ok(false)
        }
    }

    /// Finish the message: in chunked mode the zero chunk, any header fields
    /// not yet serialised as trailers, and the terminating CRLF; otherwise a
    /// bare header block without a body.
    pub fn finalize<D: IoDevice>(&mut self, device: &D, deadline: Deadline) -> Result<bool> {
        if self.needs_flush() {
            return Err(HttpError::FlushNeeded);
        }
        if self.chunked_header_composed {
            self.send_buffer.extend_from_slice(b"0\r\n");
            let trailers = self.compose_header_block();
            self.send_buffer.extend_from_slice(trailers.as_bytes());
            self.send_buffer.extend_from_slice(b"\r\n");
        } else {
            self.remove_header(CONTENT_LENGTH)?;
            self.remove_header(TRANSFER_ENCODING)?;
            self.compose_envelope();
        }
        self.bytes_sent = 0;
        if self.flush_buffer(device, deadline)? {
            self.reset();
            Ok(true)
        } else {
            self.finalising = true;
            Ok(false)
        }
    }

    /// Drain the send buffer. `Ok(true)` once it is empty; a finalising
    /// writer resets itself when the last byte goes out.
    pub fn flush<D: IoDevice>(&mut self, device: &D, deadline: Deadline) -> Result<bool> {
        if !self.needs_flush() {
            return Ok(true);
        }
        let flushed = self.flush_buffer(device, deadline)?;
        if flushed && self.finalising {
            self.reset();
        }
        Ok(flushed)
    }

    /// Back to a pristine writer for the next message on this connection.
    /// Only meaningful once the previous message has been finalised.
    pub fn reset(&mut self) {
        self.header.clear();
        self.transmission_started = false;
        self.chunked_header_composed = false;
        self.finalising = false;
        self.send_buffer.clear();
        self.bytes_sent = 0;
    }

    /// Append start line, unserialised header fields and the blank line.
    fn compose_envelope(&mut self) {
        let mut envelope = String::new();
        let _ = write!(envelope, "{}\r\n", self.first_line);
        envelope.push_str(&self.compose_header_block());
        envelope.push_str("\r\n");
        self.send_buffer.extend_from_slice(envelope.as_bytes());
    }

    /// Serialise every not-yet-serialised header field and flag it.
    fn compose_header_block(&mut self) -> String {
        let mut block = String::new();
        for entry in &mut self.header {
            if entry.serialised {
                continue;
            }
            let _ = write!(block, "{}: {}\r\n", entry.name, entry.value);
            entry.serialised = true;
        }
        block
    }

    fn flush_buffer<D: IoDevice>(&mut self, device: &D, deadline: Deadline) -> Result<bool> {
        loop {
            let written =
                device.write(&self.send_buffer[self.bytes_sent..], deadline)?;
            if written == 0 {
                // Deadline expired before anything moved.
                return Ok(false);
            }
            self.transmission_started = true;
            self.bytes_sent += written;
            if self.bytes_sent >= self.send_buffer.len() {
                self.send_buffer.clear();
                self.bytes_sent = 0;
                return Ok(true);
            }
            if deadline.has_passed() {
                return Ok(false);
            }
        }
    }
}

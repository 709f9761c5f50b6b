//! Response-side specialisations: parser accessors, reader, the status code
//! table and the response stream writer.

use girder_core::clock::Deadline;
use girder_core::io::IoDevice;

use crate::error::{HttpError, Result};
use crate::headers::Headers;
use crate::parser::{HttpMessageParser, MessageKind, ParserConfig};
use crate::reader::{MessageReader, ReadOutcome};
use crate::writer::MessageWriter;

/// Default reason phrase for `status`, covering the RFC 2616 registry
/// (100 through 505).
pub fn reason_phrase(status: u16) -> Option<&'static str> {
    let reason = match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => return None,
    };
    Some(reason)
}

/// Thin response-side view of [`HttpMessageParser`].
pub struct HttpResponseParser {
    inner: HttpMessageParser,
}

impl HttpResponseParser {
    pub fn new() -> Self {
        HttpResponseParser {
            inner: HttpMessageParser::new(MessageKind::Response),
        }
    }

    pub fn with_config(config: ParserConfig) -> Self {
        HttpResponseParser {
            inner: HttpMessageParser::with_config(MessageKind::Response, config),
        }
    }

    pub fn version(&self) -> &str {
        self.inner.first_token()
    }

    /// The status code, when the second token parses as one.
    pub fn status_code(&self) -> Option<u16> {
        self.inner.second_token().parse().ok()
    }

    pub fn reason(&self) -> &str {
        self.inner.third_token()
    }

    pub fn headers(&self) -> &Headers {
        self.inner.headers()
    }

    pub fn parser(&self) -> &HttpMessageParser {
        &self.inner
    }

    pub fn parser_mut(&mut self) -> &mut HttpMessageParser {
        &mut self.inner
    }
}

impl Default for HttpResponseParser {
    fn default() -> Self {
        HttpResponseParser::new()
    }
}

/// Reads whole responses from a device, accumulating the body.
pub struct ResponseReader {
    reader: MessageReader,
    body: Vec<u8>,
    chunk: Vec<u8>,
}

impl ResponseReader {
    pub fn new() -> Self {
        ResponseReader {
            reader: MessageReader::new(MessageKind::Response),
            body: Vec::new(),
            chunk: vec![0; 8192],
        }
    }

    /// Read until the response completes or the deadline passes.
    pub fn read<D: IoDevice>(&mut self, device: &D, deadline: Deadline) -> Result<bool> {
        if self.reader.parser().is_completed() {
            self.body.clear();
        }
        loop {
            let ReadOutcome {
                completed,
                body_bytes,
            } = self.reader.read(device, &mut self.chunk, deadline)?;
            self.body.extend_from_slice(&self.chunk[..body_bytes]);
            if completed {
                return Ok(true);
            }
            if body_bytes == 0 || deadline.has_passed() {
                return Ok(false);
            }
        }
    }

    pub fn version(&self) -> &str {
        self.reader.parser().first_token()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.reader.parser().second_token().parse().ok()
    }

    pub fn reason(&self) -> &str {
        self.reader.parser().third_token()
    }

    pub fn headers(&self) -> &Headers {
        self.reader.parser().headers()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

impl Default for ResponseReader {
    fn default() -> Self {
        ResponseReader::new()
    }
}

/// Stream writer for the response side: `version SP status SP reason`.
///
/// Construction fails for status codes outside the table unless an explicit
/// reason phrase is supplied.
pub struct ResponseWriter {
    writer: MessageWriter,
    status: u16,
}

impl ResponseWriter {
    pub fn new(status: u16) -> Result<Self> {
        let reason = reason_phrase(status).ok_or(HttpError::UnknownStatusCode(status))?;
        Ok(ResponseWriter {
            writer: MessageWriter::new(format!("HTTP/1.1 {status} {reason}")),
            status,
        })
    }

    pub fn with_reason(status: u16, reason: &str) -> Self {
        ResponseWriter {
            writer: MessageWriter::new(format!("HTTP/1.1 {status} {reason}")),
            status,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Point the writer at the next response. Only legal on a reset writer.
    pub fn set_status(&mut self, status: u16) -> Result<()> {
        let reason = reason_phrase(status).ok_or(HttpError::UnknownStatusCode(status))?;
        self.writer
            .set_first_line(format!("HTTP/1.1 {status} {reason}"))?;
        self.status = status;
        Ok(())
    }

    pub fn writer(&mut self) -> &mut MessageWriter {
        &mut self.writer
    }
}

impl std::ops::Deref for ResponseWriter {
    type Target = MessageWriter;

    fn deref(&self) -> &MessageWriter {
        &self.writer
    }
}

impl std::ops::DerefMut for ResponseWriter {
    fn deref_mut(&mut self) -> &mut MessageWriter {
        &mut self.writer
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io;
    use std::time::Duration;

    use super::*;

    #[test]
    fn known_status_gets_default_reason() {
        let writer = ResponseWriter::new(404).unwrap();
        assert_eq!(writer.status(), 404);
        assert_eq!(reason_phrase(404), Some("Not Found"));
    }

    #[test]
    fn unknown_status_fails_construction() {
        assert!(matches!(
            ResponseWriter::new(299),
            Err(HttpError::UnknownStatusCode(299))
        ));
        assert!(matches!(
            ResponseWriter::new(606),
            Err(HttpError::UnknownStatusCode(606))
        ));
    }

    #[test]
    fn explicit_reason_bypasses_the_table() {
        let writer = ResponseWriter::with_reason(299, "Custom");
        assert_eq!(writer.status(), 299);
    }

    struct CaptureDevice {
        written: RefCell<Vec<u8>>,
    }

    impl IoDevice for CaptureDevice {
        fn read(&self, _buf: &mut [u8], _deadline: Deadline) -> io::Result<usize> {
            unimplemented!()
        }

        fn write(&self, buf: &[u8], _deadline: Deadline) -> io::Result<usize> {
            self.written.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    #[test]
    fn response_round_trips_through_the_response_parser() {
        let device = CaptureDevice {
            written: RefCell::new(Vec::new()),
        };
        let mut writer = ResponseWriter::new(200).unwrap();
        writer.set_header("Server", "girder", false).unwrap();
        writer
            .write_once(&device, b"pong", Deadline::after(Duration::from_secs(5)))
            .unwrap();

        let mut parser = HttpResponseParser::new();
        let wire = device.written.borrow().clone();
        let mut body = Vec::new();
        for &byte in wire.iter() {
            if let Some(b) = parser.parser_mut().parse(byte) {
                body.push(b);
            }
        }
        assert!(parser.parser().is_completed());
        assert_eq!(parser.status_code(), Some(200));
        assert_eq!(parser.reason(), "OK");
        assert_eq!(parser.version(), "HTTP/1.1");
        assert_eq!(body, b"pong");
    }
}

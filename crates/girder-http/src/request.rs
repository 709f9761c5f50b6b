//! Request-side specialisations: parser accessors, reader with URI, query,
//! form and cookie extraction, and the request stream writer.

use girder_core::clock::Deadline;
use girder_core::io::IoDevice;

use crate::error::Result;
use crate::headers::Headers;
use crate::params::{self, Params};
use crate::parser::{HttpMessageParser, MessageKind, ParserConfig};
use crate::reader::{MessageReader, ReadOutcome};
use crate::writer::MessageWriter;

/// Thin request-side view of [`HttpMessageParser`].
pub struct HttpRequestParser {
    inner: HttpMessageParser,
}

impl HttpRequestParser {
    pub fn new() -> Self {
        HttpRequestParser {
            inner: HttpMessageParser::new(MessageKind::Request),
        }
    }

    pub fn with_config(config: ParserConfig) -> Self {
        HttpRequestParser {
            inner: HttpMessageParser::with_config(MessageKind::Request, config),
        }
    }

    pub fn method(&self) -> &str {
        self.inner.first_token()
    }

    pub fn uri(&self) -> &str {
        self.inner.second_token()
    }

    pub fn version(&self) -> &str {
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

impl Default for HttpRequestParser {
    fn default() -> Self {
        HttpRequestParser::new()
    }
}

/// Reads whole requests from a device, accumulating the body and decoding
/// the request-specific surfaces lazily: path/query, GET and POST parameters
/// and cookies.
pub struct RequestReader {
    reader: MessageReader,
    body: Vec<u8>,
    chunk: Vec<u8>,
    path: String,
    query: String,
    get: Option<Params>,
    post: Option<Params>,
    cookies: Option<Params>,
}

impl RequestReader {
    pub fn new() -> Self {
        RequestReader::with_reader(MessageReader::new(MessageKind::Request))
    }

    pub fn with_reader(reader: MessageReader) -> Self {
        RequestReader {
            reader,
            body: Vec::new(),
            chunk: vec![0; 8192],
            path: String::new(),
            query: String::new(),
            get: None,
            post: None,
            cookies: None,
        }
    }

    /// Read until the request completes or the deadline passes. Returns
    /// `true` on completion; the body and decoded surfaces are then valid
    /// until the next call.
    pub fn read<D: IoDevice>(&mut self, device: &D, deadline: Deadline) -> Result<bool> {
        if self.reader.parser().is_completed() {
            self.start_new_message();
        }
        loop {
            let ReadOutcome {
                completed,
                body_bytes,
            } = self.reader.read(device, &mut self.chunk, deadline)?;
            self.body.extend_from_slice(&self.chunk[..body_bytes]);
            if completed {
                let (path, query) = params::split_uri(self.reader.parser().second_token());
                self.path = path;
                self.query = query;
                return Ok(true);
            }
            if body_bytes == 0 || deadline.has_passed() {
                return Ok(false);
            }
        }
    }

    fn start_new_message(&mut self) {
        self.body.clear();
        self.path.clear();
        self.query.clear();
        self.get = None;
        self.post = None;
        self.cookies = None;
    }

    pub fn method(&self) -> &str {
        self.reader.parser().first_token()
    }

    pub fn uri(&self) -> &str {
        self.reader.parser().second_token()
    }

    pub fn version(&self) -> &str {
        self.reader.parser().third_token()
    }

    pub fn headers(&self) -> &Headers {
        self.reader.parser().headers()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// URI path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, percent encoding intact.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Percent-decoded query parameters, extracted on first access.
    pub fn get_params(&mut self) -> &Params {
        if self.get.is_none() {
            self.get = Some(params::parse_params(&self.query));
        }
        self.get.as_ref().unwrap()
    }

    /// Percent-decoded body parameters when the request is
    /// `application/x-www-form-urlencoded`; empty otherwise.
    pub fn post_params(&mut self) -> &Params {
        if self.post.is_none() {
            let is_form = self
                .headers()
                .get("Content-Type")
                .map(|ct| {
                    ct.split(';')
                        .next()
                        .unwrap_or("")
                        .trim()
                        .eq_ignore_ascii_case("application/x-www-form-urlencoded")
                })
                .unwrap_or(false);
            let parsed = if is_form {
                params::parse_params(&String::from_utf8_lossy(&self.body))
            } else {
                Params::new()
            };
            self.post = Some(parsed);
        }
        self.post.as_ref().unwrap()
    }

    /// Cookie pairs from every `Cookie` header, extracted on first access.
    pub fn cookies(&mut self) -> &Params {
        if self.cookies.is_none() {
            self.cookies = Some(params::parse_cookies(self.headers()));
        }
        self.cookies.as_ref().unwrap()
    }
}

impl Default for RequestReader {
    fn default() -> Self {
        RequestReader::new()
    }
}

/// Stream writer for the request side: `method SP uri SP version`.
pub struct RequestWriter {
    writer: MessageWriter,
}

impl RequestWriter {
    pub fn new(method: &str, uri: &str) -> Self {
        RequestWriter {
            writer: MessageWriter::new(format!("{method} {uri} HTTP/1.1")),
        }
    }

    pub fn writer(&mut self) -> &mut MessageWriter {
        &mut self.writer
    }

    /// Point the writer at the next request. Only legal on a reset writer.
    pub fn set_request_line(&mut self, method: &str, uri: &str) -> Result<()> {
        self.writer.set_first_line(format!("{method} {uri} HTTP/1.1"))
    }
}

impl std::ops::Deref for RequestWriter {
    type Target = MessageWriter;

    fn deref(&self) -> &MessageWriter {
        &self.writer
    }
}

impl std::ops::DerefMut for RequestWriter {
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

    struct OneShotDevice {
        data: RefCell<Vec<u8>>,
    }

    impl OneShotDevice {
        fn new(data: &[u8]) -> Self {
            OneShotDevice {
                data: RefCell::new(data.to_vec()),
            }
        }
    }

    impl IoDevice for OneShotDevice {
        fn read(&self, buf: &mut [u8], _deadline: Deadline) -> io::Result<usize> {
            let mut data = self.data.borrow_mut();
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            data.drain(..n);
            Ok(n)
        }

        fn write(&self, _buf: &[u8], _deadline: Deadline) -> io::Result<usize> {
            unimplemented!()
        }

        fn is_open(&self) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[test]
    fn percent_encoded_query_decodes_lazily() {
        let device = OneShotDevice::new(
            b"GET /i?q=%D0%B0%D0%B1%D0%B2 HTTP/1.1\r\nHost: h\r\n\r\n",
        );
        let mut reader = RequestReader::new();
        assert!(reader.read(&device, deadline()).unwrap());
        assert_eq!(reader.path(), "/i");
        assert_eq!(reader.query(), "q=%D0%B0%D0%B1%D0%B2");
        assert_eq!(reader.get_params().get("q"), Some("абв"));
    }

    #[test]
    fn form_body_populates_post_params() {
        let device = OneShotDevice::new(
            b"POST /f HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 14\r\n\r\nname=girder%21",
        );
        let mut reader = RequestReader::new();
        assert!(reader.read(&device, deadline()).unwrap());
        assert_eq!(reader.post_params().get("name"), Some("girder!"));
    }

    #[test]
    fn non_form_body_yields_no_post_params() {
        let device = OneShotDevice::new(
            b"POST /j HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}",
        );
        let mut reader = RequestReader::new();
        assert!(reader.read(&device, deadline()).unwrap());
        assert_eq!(reader.body(), b"{}");
        assert!(reader.post_params().is_empty());
    }

    #[test]
    fn cookies_extract_from_header() {
        let device = OneShotDevice::new(
            b"GET / HTTP/1.1\r\nCookie: sid=xyz; theme=light\r\n\r\n",
        );
        let mut reader = RequestReader::new();
        assert!(reader.read(&device, deadline()).unwrap());
        assert_eq!(reader.cookies().get("sid"), Some("xyz"));
        assert_eq!(reader.cookies().get("theme"), Some("light"));
    }

    #[test]
    fn second_message_resets_decoded_state() {
        let device = OneShotDevice::new(
            b"GET /a?x=1 HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
        );
        let mut reader = RequestReader::new();
        assert!(reader.read(&device, deadline()).unwrap());
        assert_eq!(reader.path(), "/a");
        assert_eq!(reader.get_params().get("x"), Some("1"));

        assert!(reader.read(&device, deadline()).unwrap());
        assert_eq!(reader.path(), "/b");
        assert_eq!(reader.query(), "");
        assert!(reader.get_params().is_empty());
    }
}

//! Pure envelope builder for one-shot sends; no I/O.

use std::fmt::Write as _;

use crate::error::{HttpError, Result};
use crate::headers::Headers;

const CONTENT_LENGTH: &str = "Content-Length";
const TRANSFER_ENCODING: &str = "Transfer-Encoding";

/// Composes start line plus header block so a caller can issue the whole
/// message in a single write.
///
/// Framing headers in the input (`Content-Length`, `Transfer-Encoding`) are
/// stripped and re-derived from the requested framing. The chunk helpers use
/// the same scheme as the streaming writer: each envelope after the first
/// begins with the CRLF that closes the previous chunk's data.
pub struct MessageComposer {
    first_token: String,
    second_token: String,
    third_token: String,
}

impl MessageComposer {
    pub fn new(
        first_token: impl Into<String>,
        second_token: impl Into<String>,
        third_token: impl Into<String>,
    ) -> Self {
        MessageComposer {
            first_token: first_token.into(),
            second_token: second_token.into(),
            third_token: third_token.into(),
        }
    }

    pub fn reset(
        &mut self,
        first_token: impl Into<String>,
        second_token: impl Into<String>,
        third_token: impl Into<String>,
    ) {
        self.first_token = first_token.into();
        self.second_token = second_token.into();
        self.third_token = third_token.into();
    }

    fn first_line(&self) -> String {
        format!(
            "{} {} {}\r\n",
            self.first_token, self.second_token, self.third_token
        )
    }

    fn header_block(headers: &Headers, out: &mut String) {
        for (name, value) in headers.iter() {
            let _ = write!(out, "{name}: {value}\r\n");
        }
    }

    /// The envelope for an identity-framed message of `data_len` body bytes.
    pub fn compose(&self, headers: &Headers, data_len: usize) -> String {
        let mut actual = headers.clone();
        actual.remove(CONTENT_LENGTH);
        actual.remove(TRANSFER_ENCODING);
        if data_len > 0 {
            actual.append(CONTENT_LENGTH, data_len.to_string());
        }
        let mut envelope = self.first_line();
        Self::header_block(&actual, &mut envelope);
        envelope.push_str("\r\n");
        envelope
    }

    /// Compose the envelope directly in front of a payload already placed in
    /// `packet` at `header_capacity..header_capacity + data_len`.
    ///
    /// Returns `(start, len)`: the whole message occupies
    /// `packet[start..start + len]`.
    pub fn compose_packet(
        &self,
        headers: &Headers,
        packet: &mut [u8],
        header_capacity: usize,
        data_len: usize,
    ) -> Result<(usize, usize)> {
        let envelope = self.compose(headers, data_len);
        if envelope.len() > header_capacity {
            return Err(HttpError::EnvelopeTooLarge {
                needed: envelope.len(),
                available: header_capacity,
            });
        }
        let start = header_capacity - envelope.len();
        packet[start..header_capacity].copy_from_slice(envelope.as_bytes());
        Ok((start, envelope.len() + data_len))
    }

    /// The envelope opening a chunked message: start line, headers with
    /// `Transfer-Encoding: chunked`, and the first chunk-size line.
    pub fn compose_first_chunk(&self, headers: &Headers, data_len: usize) -> Result<String> {
        if data_len == 0 {
            return Err(HttpError::EmptyChunk);
        }
        let mut actual = headers.clone();
        actual.remove(CONTENT_LENGTH);
        actual.remove(TRANSFER_ENCODING);
        actual.append(TRANSFER_ENCODING, "chunked");
        let mut envelope = self.first_line();
        Self::header_block(&actual, &mut envelope);
        let _ = write!(envelope, "\r\n{data_len:x}\r\n");
        Ok(envelope)
    }

    /// A follow-up chunk envelope; closes the previous chunk's data first.
    pub fn compose_chunk(data_len: usize) -> Result<String> {
        if data_len == 0 {
            return Err(HttpError::EmptyChunk);
        }
        Ok(format!("\r\n{data_len:x}\r\n"))
    }

    /// The terminating envelope: zero chunk, trailer fields, final CRLF.
    pub fn compose_last_chunk(trailers: &Headers) -> String {
        let mut envelope = String::from("\r\n0\r\n");
        Self::header_block(trailers, &mut envelope);
        envelope.push_str("\r\n");
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{HttpMessageParser, MessageKind};

    #[test]
    fn identity_envelope_carries_content_length() {
        let composer = MessageComposer::new("HTTP/1.1", "200", "OK");
        let mut headers = Headers::new();
        headers.append("Server", "girder");
        let envelope = composer.compose(&headers, 5);
        assert_eq!(
            envelope,
            "HTTP/1.1 200 OK\r\nServer: girder\r\nContent-Length: 5\r\n\r\n"
        );
    }

    #[test]
    fn empty_body_envelope_has_no_content_length() {
        let composer = MessageComposer::new("GET", "/", "HTTP/1.1");
        let envelope = composer.compose(&Headers::new(), 0);
        assert_eq!(envelope, "GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn conflicting_framing_headers_are_stripped() {
        let composer = MessageComposer::new("HTTP/1.1", "200", "OK");
        let mut headers = Headers::new();
        headers.append("Content-Length", "999");
        headers.append("Transfer-Encoding", "chunked");
        let envelope = composer.compose(&headers, 3);
        assert!(!envelope.contains("999"));
        assert!(!envelope.contains("chunked"));
        assert!(envelope.contains("Content-Length: 3"));
    }

    #[test]
    fn packet_composition_prefixes_the_payload() {
        let composer = MessageComposer::new("HTTP/1.1", "200", "OK");
        let payload = b"hello";
        let header_capacity = 64;
        let mut packet = vec![0u8; header_capacity + payload.len()];
        packet[header_capacity..].copy_from_slice(payload);
        let (start, len) = composer
            .compose_packet(&Headers::new(), &mut packet, header_capacity, payload.len())
            .unwrap();
        let message = &packet[start..start + len];
        assert!(message.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(message.ends_with(b"\r\n\r\nhello"));
    }

    #[test]
    fn packet_composition_checks_capacity() {
        let composer = MessageComposer::new("HTTP/1.1", "200", "OK");
        let mut packet = vec![0u8; 10];
        let result = composer.compose_packet(&Headers::new(), &mut packet, 4, 6);
        assert!(matches!(result, Err(HttpError::EnvelopeTooLarge { .. })));
    }

    #[test]
    fn chunk_envelopes_round_trip_through_the_parser() {
        let composer = MessageComposer::new("POST", "/upload", "HTTP/1.1");
        let mut wire = Vec::new();
        wire.extend_from_slice(
            composer
                .compose_first_chunk(&Headers::new(), 4)
                .unwrap()
                .as_bytes(),
        );
        wire.extend_from_slice(b"abcd");
        wire.extend_from_slice(MessageComposer::compose_chunk(2).unwrap().as_bytes());
        wire.extend_from_slice(b"ef");
        let mut trailers = Headers::new();
        trailers.append("X-Sum", "21");
        wire.extend_from_slice(MessageComposer::compose_last_chunk(&trailers).as_bytes());

        let mut parser = HttpMessageParser::new(MessageKind::Request);
        let mut body = Vec::new();
        for &byte in &wire {
            if let Some(b) = parser.parse(byte) {
                body.push(b);
            }
        }
        assert!(parser.is_completed());
        assert_eq!(body, b"abcdef");
        assert_eq!(parser.headers().get("X-Sum"), Some("21"));
    }

    #[test]
    fn empty_chunks_are_refused() {
        let composer = MessageComposer::new("POST", "/", "HTTP/1.1");
        assert!(matches!(
            composer.compose_first_chunk(&Headers::new(), 0),
            Err(HttpError::EmptyChunk)
        ));
        assert!(matches!(
            MessageComposer::compose_chunk(0),
            Err(HttpError::EmptyChunk)
        ));
    }
}

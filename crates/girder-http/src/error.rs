use thiserror::Error;

/// Everything that can go wrong while parsing, composing or streaming an
/// HTTP/1.x message.
///
/// Parser variants are recorded on the parser when it enters its bad state;
/// the size-limit variants carry the limit that was exceeded.
#[derive(Error, Debug)]
pub enum HttpError {
    // Start-line size limits
    #[error("request method exceeds {0} bytes")]
    MethodTokenTooLong(usize),

    #[error("request URI exceeds {0} bytes")]
    UriTooLong(usize),

    #[error("HTTP version exceeds {0} bytes")]
    VersionTooLong(usize),

    #[error("status code exceeds {0} bytes")]
    StatusCodeTooLong(usize),

    #[error("reason phrase exceeds {0} bytes")]
    ReasonPhraseTooLong(usize),

    // Header limits
    #[error("header field name exceeds {0} bytes")]
    HeaderFieldNameTooLong(usize),

    #[error("header field value exceeds {0} bytes")]
    HeaderFieldValueTooLong(usize),

    #[error("message carries more than {0} header fields")]
    TooManyHeaders(usize),

    // Lexical errors
    #[error("invalid character {0:#04x} in the first start-line token")]
    InvalidCharInFirstToken(u8),

    #[error("invalid character {0:#04x} in the second start-line token")]
    InvalidCharInSecondToken(u8),

    #[error("invalid character {0:#04x} in the third start-line token")]
    InvalidCharInThirdToken(u8),

    #[error("invalid character {0:#04x} in a header field name")]
    InvalidCharInHeaderFieldName(u8),

    #[error("invalid character {0:#04x} in a header field value")]
    InvalidCharInHeaderFieldValue(u8),

    #[error("expected CR, found {0:#04x}")]
    ExpectedCR(u8),

    #[error("expected LF, found {0:#04x}")]
    ExpectedLF(u8),

    #[error("folded header field value (obsolete line folding)")]
    FoldedHeader,

    // Framing errors
    #[error("invalid chunk size")]
    InvalidChunkSize,

    #[error("unsupported transfer encoding: '{0}'")]
    InvalidTransferEncoding(String),

    #[error("invalid Content-Length value: '{0}'")]
    InvalidContentLength(String),

    // Reader errors
    #[error("message body exceeds {0} bytes")]
    BodyTooLong(usize),

    // Writer and composer errors
    #[error("unknown status code: {0}")]
    UnknownStatusCode(u16),

    #[error("header field '{0}' has already been serialised")]
    HeaderFieldAlreadySerialised(String),

    #[error("identity transmission is not possible after a chunked write")]
    IdentityAfterChunked,

    #[error("send buffer must be flushed before further writes")]
    FlushNeeded,

    #[error("chunk envelopes cannot frame empty data")]
    EmptyChunk,

    #[error("envelope needs {needed} bytes but only {available} are reserved")]
    EnvelopeTooLarge { needed: usize, available: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HttpError>;

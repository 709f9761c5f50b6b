#![no_main]

use girder_http::parser::{HttpMessageParser, MessageKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = HttpMessageParser::new(MessageKind::Request);
    let mut body = [0u8; 4096];
    let mut input = data;
    loop {
        let (consumed, _written) = parser.parse_buf(input, &mut body);
        input = &input[consumed..];
        if parser.is_completed() {
            // A completed message must never also carry an error.
            assert!(parser.error().is_none());
            parser.reset();
            continue;
        }
        if parser.is_bad() {
            // A bad message must always record its error kind.
            assert!(parser.error().is_some());
            break;
        }
        if input.is_empty() || consumed == 0 {
            break;
        }
    }
});

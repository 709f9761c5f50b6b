#![no_main]

use girder_http::parser::{HttpMessageParser, MessageKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = HttpMessageParser::new(MessageKind::Response);
    for &byte in data {
        parser.parse(byte);
        if parser.is_bad() {
            assert!(parser.error().is_some());
            break;
        }
    }
});

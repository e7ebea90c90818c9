//! Fuzz target for the dialect parsers.
//!
//! Parsers must never panic for any UTF-8 input, at any chunk boundary,
//! including a final flush.

#![no_main]

use atlas_bridge::parse::{Dialect, DialectParser as _};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    for dialect in [
        Dialect::Acp,
        Dialect::Ndjson,
        Dialect::StreamJsonRpc,
        Dialect::Text,
    ] {
        // Whole input in one call.
        let mut parser = dialect.parser();
        let _ = parser.parse(text);
        let _ = parser.flush();

        // Same input split at an input-derived boundary.
        let split = data.first().map_or(0, |b| *b as usize % (text.len() + 1));
        if text.is_char_boundary(split) {
            let mut parser = dialect.parser();
            let _ = parser.parse(&text[..split]);
            let _ = parser.parse(&text[split..]);
            let _ = parser.flush();
        }
    }
});

//! Fuzzt den XML→DOM Parser: darf nie panicken, nur ParsingError liefern.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    let _ = rngine::safe_parse(source);
});

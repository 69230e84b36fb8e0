//! Fuzz target for SCP control line parsing.

#![no_main]
use libfuzzer_sys::fuzz_target;
use sshwire_proto::ssh::ControlLine;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = ControlLine::parse(data) {
        let encoded = line.to_bytes();
        let reparsed = ControlLine::parse(&encoded[..encoded.len() - 1])
            .expect("re-encoded control line must parse");
        assert_eq!(line, reparsed);
    }
});

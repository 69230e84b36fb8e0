//! Fuzz target for SFTP framing and response decoding.

#![no_main]
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use sshwire_proto::ssh::sftp::message::split_frame;
use sshwire_proto::ssh::sftp::{Request, Response};

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);
    while let Ok(Some((kind, body))) = split_frame(&mut buf) {
        let _ = Response::decode(kind, &body);
        let _ = Request::decode(kind, &body);
    }
});

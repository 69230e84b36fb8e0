//! Feeds arbitrary bytes to the streaming packet decoder in random-sized
//! chunks. The decoder must never panic and must never consume bytes it
//! did not turn into a packet.

#![no_main]
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use sshwire_proto::ssh::{Decoded, PacketCodec};

fuzz_target!(|data: &[u8]| {
    let Some((&chunk, rest)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(chunk).max(1);
    let mut codec = PacketCodec::new();
    let mut input = BytesMut::new();

    for piece in rest.chunks(chunk) {
        input.extend_from_slice(piece);
        loop {
            let before = input.len();
            match codec.decode(&mut input) {
                Ok(Decoded::Packet(_)) => continue,
                Ok(Decoded::NeedMoreData) => {
                    assert_eq!(input.len(), before);
                    break;
                }
                Err(_) => return,
            }
        }
    }
});

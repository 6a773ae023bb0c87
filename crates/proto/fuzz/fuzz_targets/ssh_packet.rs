//! Fuzz target for SSH packet decoding.
//!
//! This fuzzer feeds random bytes to the packet codec to find:
//! - Panics
//! - Out-of-bounds reads
//! - Lengths accepted beyond the packet size limit
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use skiff_proto::ssh::packet::{PacketCodec, MAX_PACKET_SIZE};

fuzz_target!(|data: &[u8]| {
    for codec in [PacketCodec::plain(), PacketCodec::new(16, 32), PacketCodec::aead(16)] {
        if let Ok((packet, consumed)) = codec.decode(data) {
            assert!(consumed <= data.len());
            assert!(packet.packet_length() <= MAX_PACKET_SIZE);

            // Anything that decodes must encode back to the same bytes
            let encoded = codec.encode(&packet);
            assert_eq!(encoded.as_slice(), &data[..consumed]);
        }
    }
});

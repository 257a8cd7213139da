#![cfg(not(target_arch = "wasm32"))]

use fwbus_proto::header::{decode_packet, encode_packet, fill_async_lock, fill_async_write_block};
use fwbus_proto::selfid::SelfIdPacket;
use fwbus_proto::{ExtCode, NodeId, Route, Tcode};
use proptest::prelude::*;

// Extended Self-IDs leave bits 19..18 and 1 reserved.
const EXTENDED_RESERVED: u32 = (0x3 << 18) | (1 << 1);

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        if let Ok(parsed) = decode_packet(&bytes) {
            prop_assert_eq!(parsed.header.len_bytes(), parsed.tcode.header_len());
            prop_assert!(parsed.data().len() <= parsed.payload.len());
        }
    }

    #[test]
    fn selfid_fields_survive_reencoding(low in 0u32..(1 << 30)) {
        let quadlet = (0b10 << 30) | low;
        let packet = SelfIdPacket::decode(quadlet).unwrap();
        let expected = match packet {
            SelfIdPacket::Base(_) => quadlet,
            SelfIdPacket::Extended(_) => quadlet & !EXTENDED_RESERVED,
        };
        prop_assert_eq!(packet.encode(), expected);
        prop_assert_eq!(packet.phy_id(), ((quadlet >> 24) & 0x3f) as u8);
    }

    #[test]
    fn block_payload_is_padded_to_quadlets(
        offset in 0u64..(1 << 48),
        data in prop::collection::vec(any::<u8>(), 0..40),
        tlabel in 0u8..64,
    ) {
        let route = Route::new(NodeId::local(1), NodeId::local(0), tlabel);
        let header = fill_async_write_block(route, offset, data.len() as u16);
        let wire = encode_packet(&header, &data);
        prop_assert_eq!(wire.len() % 4, 0);

        let parsed = decode_packet(&wire).unwrap();
        prop_assert_eq!(parsed.tcode, Tcode::WriteBlock);
        prop_assert_eq!(parsed.header.offset(), offset);
        prop_assert_eq!(parsed.header.tlabel(), tlabel);
        prop_assert_eq!(parsed.data(), &data[..]);
    }
}

#[test]
fn lock_request_header_survives_the_wire() {
    let route = Route::new(NodeId::local(3), NodeId::local(0), 7);
    let header = fill_async_lock(route, 0xffff_f000_0220, ExtCode::CompareSwap, 8);
    let wire = encode_packet(&header, &[0, 0, 0x13, 0x33, 0, 0, 0x12, 0x00]);
    let parsed = decode_packet(&wire).unwrap();
    assert_eq!(parsed.tcode, Tcode::LockRequest);
    assert_eq!(ExtCode::from_raw(parsed.header.ext_code_raw()), Some(ExtCode::CompareSwap));
    assert_eq!(parsed.data(), &[0, 0, 0x13, 0x33, 0, 0, 0x12, 0x00]);
}

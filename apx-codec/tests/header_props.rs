// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Sampled round-trip law for the address header.

use apx_codec::header::{self, ADDRESS_MASK, LOW_ADDRESS_MAX};
use bytes::BytesMut;
use rand::{Rng, SeedableRng};

#[test]
fn test_header_round_trip_sampled() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x41505821);
    for _ in 0..10_000 {
        let address = rng.gen_range(0..=ADDRESS_MASK);
        let more = rng.gen_bool(0.5);
        let mut buf = BytesMut::new();
        let header_len = header::pack_header(&mut buf, address, more).unwrap();
        assert_eq!(buf.len(), header_len);

        // Short form exactly when the address is low and unfragmented.
        let expect_short = address <= LOW_ADDRESS_MAX && !more;
        assert_eq!(header_len == 2, expect_short, "address {address:#x} more {more}");

        buf.extend_from_slice(&[0xAB; 5]);
        let msg = header::unpack(&buf).unwrap();
        assert_eq!(msg.address, address);
        assert_eq!(msg.more_bit, more);
        assert_eq!(msg.payload, &[0xAB; 5]);
    }
}

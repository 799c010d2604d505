// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use iscsi_target_rs::models::{
    common::HEADER_LEN,
    reject::{
        reject_description::RejectReason,
        response::{RejectPdu, RejectPduBuilder},
    },
};
use zerocopy::IntoBytes;

#[test]
fn reject_carries_reason_and_reserved_itt() {
    let builder = RejectPduBuilder::new(RejectReason::TaskInProgress);
    let wire = builder.header.as_bytes();

    assert_eq!(wire[0] & 0x3F, 0x3F);
    assert_eq!(wire[1] & 0x80, 0x80);
    assert_eq!(wire[2], 0x07);
    assert_eq!(&wire[16..20], &[0xff, 0xff, 0xff, 0xff]);
}

#[test]
fn reject_reason_codec_is_total() {
    for byte in 0u8..=0x0d {
        let reason = RejectReason::from_u8(byte);
        assert_eq!(reason.as_u8(), byte, "byte {byte:#04x}");
    }
}

#[test]
fn reject_reparses_from_its_own_bytes() {
    let builder = RejectPduBuilder::new(RejectReason::CommandNotSupported);
    let mut wire = [0u8; HEADER_LEN];
    wire.copy_from_slice(builder.header.as_bytes());

    let parsed = RejectPdu::from_bhs_bytes(&mut wire).expect("parse");
    assert_eq!(parsed.reason.decode(), RejectReason::CommandNotSupported);
}

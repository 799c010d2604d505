// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use iscsi_target_rs::models::{
    async_msg::response::{AsyncMessage, AsyncMessageBuilder, events},
    common::{HEADER_LEN, RESERVED_TAG},
};
use zerocopy::IntoBytes;

#[test]
fn async_message_layout_matches_the_wire() {
    let builder = AsyncMessageBuilder::new(events::DROPPING_CONNECTION)
        .lun(0)
        .parameters(0, 2, 10);

    let wire = builder.header.as_bytes();
    assert_eq!(wire.len(), HEADER_LEN);
    assert_eq!(wire[0] & 0x3F, 0x32);
    assert_eq!(wire[1], 0x80);
    assert_eq!(
        u32::from_ne_bytes(wire[16..20].try_into().expect("itt")),
        RESERVED_TAG
    );
    assert_eq!(wire[36], events::DROPPING_CONNECTION);
    // Parameter2/Parameter3 carry Time2Wait / Time2Retain
    assert_eq!(u16::from_be_bytes(wire[40..42].try_into().expect("p2")), 2);
    assert_eq!(u16::from_be_bytes(wire[42..44].try_into().expect("p3")), 10);
}

#[test]
fn async_message_reparses() {
    let builder = AsyncMessageBuilder::new(events::REQUEST_LOGOUT);
    let mut wire = [0u8; HEADER_LEN];
    wire.copy_from_slice(builder.header.as_bytes());

    let parsed = AsyncMessage::from_bhs_bytes(&mut wire).expect("parse");
    assert_eq!(parsed.async_event, events::REQUEST_LOGOUT);
}

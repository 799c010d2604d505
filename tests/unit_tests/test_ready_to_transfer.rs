// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use iscsi_target_rs::models::{
    common::HEADER_LEN,
    ready_2_transfer::response::{ReadyToTransfer, ReadyToTransferBuilder},
};
use zerocopy::IntoBytes;

#[test]
fn r2t_field_offsets_match_the_wire() {
    let builder = ReadyToTransferBuilder::new()
        .lun(0x0001_0000_0000_0000)
        .initiator_task_tag(0x42)
        .target_transfer_tag(0x99)
        .r2t_sn(1)
        .buffer_offset(8192)
        .desired_data_transfer_length(8192);

    let wire = builder.header.as_bytes();
    assert_eq!(wire.len(), HEADER_LEN);
    assert_eq!(wire[0] & 0x3F, 0x31);
    assert_eq!(u32::from_be_bytes(wire[20..24].try_into().expect("ttt")), 0x99);
    assert_eq!(u32::from_be_bytes(wire[36..40].try_into().expect("r2t_sn")), 1);
    assert_eq!(u32::from_be_bytes(wire[40..44].try_into().expect("offset")), 8192);
    assert_eq!(u32::from_be_bytes(wire[44..48].try_into().expect("len")), 8192);
}

#[test]
fn r2t_reparses_from_its_own_bytes() {
    let builder = ReadyToTransferBuilder::new()
        .r2t_sn(3)
        .buffer_offset(0)
        .desired_data_transfer_length(65536);

    let mut wire = [0u8; HEADER_LEN];
    wire.copy_from_slice(builder.header.as_bytes());

    let parsed = ReadyToTransfer::from_bhs_bytes(&mut wire).expect("parse");
    assert_eq!(parsed.r2t_sn.get(), 3);
    assert_eq!(parsed.desired_data_transfer_length.get(), 65536);
}

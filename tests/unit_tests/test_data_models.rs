// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use hex_literal::hex;
use iscsi_target_rs::models::{
    command::common::ScsiStatus,
    common::{BasicHeaderSegment, HEADER_LEN, RESERVED_TAG},
    data::{
        request::{ScsiDataOut, ScsiDataOutBuilder},
        response::{ScsiDataIn, ScsiDataInBuilder},
        sense_data::{SenseData, keys},
    },
};
use zerocopy::IntoBytes;

#[test]
fn data_out_wire_fixture_parses() {
    // opcode | F | rsvd | ahs | dsl | lun | itt | ttt | rsvd | ExpStatSN |
    // rsvd | DataSN | BufferOffset | rsvd
    let mut wire = hex!(
        "05 80 0000 00 000020"
        "0000000000000000"
        "deadbeef 00001234"
        "00000000 00000007 00000000"
        "00000000 00002000 00000000"
    );
    assert_eq!(wire.len(), HEADER_LEN);

    let pdu = ScsiDataOut::from_bhs_bytes(&mut wire).expect("parse fixture");
    assert!(pdu.flags.fin());
    assert_eq!(pdu.target_transfer_tag.get(), 0x1234);
    assert_eq!(pdu.exp_stat_sn.get(), 7);
    assert_eq!(pdu.buffer_offset.get(), 0x2000);
    assert_eq!(pdu.get_data_length_bytes(), 0x20);

    // Re-encoding reproduces the fixture byte for byte.
    let reencoded = hex::encode(pdu.as_bytes());
    assert_eq!(reencoded, hex::encode(wire));
}

#[test]
fn data_out_field_offsets_match_the_wire() {
    let builder = ScsiDataOutBuilder::new()
        .initiator_task_tag(0x77)
        .target_transfer_tag(0x1234)
        .exp_stat_sn(9)
        .data_sn(2)
        .buffer_offset(8192)
        .final_bit();

    let wire = builder.header.as_bytes();
    assert_eq!(wire.len(), HEADER_LEN);
    assert_eq!(wire[0] & 0x3F, 0x05);
    assert_eq!(wire[1] & 0x80, 0x80);
    // TTT at 20..24, ExpStatSN at 28..32, DataSN at 36..40, offset at 40..44
    assert_eq!(u32::from_be_bytes(wire[20..24].try_into().expect("ttt")), 0x1234);
    assert_eq!(u32::from_be_bytes(wire[28..32].try_into().expect("esn")), 9);
    assert_eq!(u32::from_be_bytes(wire[36..40].try_into().expect("dsn")), 2);
    assert_eq!(u32::from_be_bytes(wire[40..44].try_into().expect("off")), 8192);
}

#[test]
fn unsolicited_data_out_is_detected_by_reserved_ttt() {
    let unsol = ScsiDataOutBuilder::new();
    assert!(unsol.header.is_unsolicited());

    let solicited = ScsiDataOutBuilder::new().target_transfer_tag(7);
    assert!(!solicited.header.is_unsolicited());
    assert_ne!(RESERVED_TAG, 7);
}

#[test]
fn data_in_status_forces_final() {
    let mut hdr = ScsiDataInBuilder::new().header;
    hdr.set_scsi_status(Some(ScsiStatus::Good));
    assert!(hdr.flags.s());
    assert!(hdr.flags.fin());
    assert_eq!(hdr.scsi_status(), Some(ScsiStatus::Good));

    hdr.set_scsi_status(None);
    assert!(!hdr.flags.s());
    assert_eq!(hdr.scsi_status(), None);
}

#[test]
fn data_in_serialization_zeroes_status_fields_without_s() {
    let mut hdr = ScsiDataInBuilder::new().final_bit().header;
    hdr.stat_sn_or_rsvd.set(0xdead_beef);
    hdr.residual_count.set(42);

    let mut wire = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut wire).expect("serialize");
    assert_eq!(&wire[24..28], &[0, 0, 0, 0]);
    assert_eq!(&wire[44..48], &[0, 0, 0, 0]);
}

#[test]
fn data_in_rejects_underflow_and_overflow_together() {
    let mut wire = [0u8; HEADER_LEN];
    wire[0] = 0x25;
    wire[1] = 0x80 | 0x04 | 0x02 | 0x01; // F|O|U|S
    assert!(ScsiDataIn::from_bhs_bytes(&mut wire).is_err());
}

#[test]
fn data_out_parse_checks_opcode() {
    let mut wire = [0u8; HEADER_LEN];
    wire[0] = 0x01;
    assert!(ScsiDataOut::from_bhs_bytes(&mut wire).is_err());
    wire[0] = 0x05;
    assert!(ScsiDataOut::from_bhs_bytes(&mut wire).is_ok());
}

#[test]
fn sense_blob_carries_length_prefix_and_fixed_format() {
    let blob = SenseData::build(keys::ABORTED_COMMAND, 0x47, 0x05);
    assert_eq!(u16::from_be_bytes([blob[0], blob[1]]), 14);
    assert_eq!(blob[2], 0xf0);

    let parsed = SenseData::parse(&blob).expect("parse");
    assert_eq!(parsed.sense_key, keys::ABORTED_COMMAND);
    assert_eq!(parsed.asc, 0x47);
    assert_eq!(parsed.ascq, 0x05);
}

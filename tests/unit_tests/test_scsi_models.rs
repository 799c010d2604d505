// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use iscsi_target_rs::models::{
    command::{
        common::{ResponseCode, ScsiStatus, TaskAttribute},
        request::{ScsiCommandRequest, ScsiCommandRequestBuilder},
        response::ScsiCommandResponseBuilder,
    },
    common::HEADER_LEN,
};
use zerocopy::FromBytes;

fn sample_write_request() -> ScsiCommandRequestBuilder {
    let mut cdb = [0u8; 16];
    cdb[0] = 0x2a; // WRITE(10)
    ScsiCommandRequestBuilder::new()
        .lun(0x0001_0000_0000_0000)
        .initiator_task_tag(0x10)
        .cmd_sn(5)
        .exp_stat_sn(3)
        .expected_data_transfer_length(16384)
        .scsi_descriptor_block(&cdb)
        .write()
        .final_bit()
        .task_attribute(TaskAttribute::Simple)
}

#[test]
fn request_roundtrips_through_wire_bytes() {
    let builder = sample_write_request();

    let mut wire = [0u8; HEADER_LEN];
    builder
        .header
        .to_bhs_bytes(&mut wire)
        .expect("serialize BHS");

    let parsed = ScsiCommandRequest::ref_from_bytes(&wire).expect("reparse");
    assert_eq!(parsed.cmd_sn.get(), 5);
    assert_eq!(parsed.exp_stat_sn.get(), 3);
    assert_eq!(parsed.expected_data_transfer_length.get(), 16384);
    assert!(parsed.flags.write());
    assert!(parsed.flags.fin());
    assert!(!parsed.flags.read());
    assert_eq!(parsed.cdb()[0], 0x2a);
}

#[test]
fn write_and_read_sizes_follow_flags() {
    let write = sample_write_request();
    assert_eq!(write.header.write_size(), 16384);
    assert_eq!(write.header.read_size(), 0);

    let mut cdb = [0u8; 16];
    cdb[0] = 0x28; // READ(10)
    let read = ScsiCommandRequestBuilder::new()
        .expected_data_transfer_length(4096)
        .scsi_descriptor_block(&cdb)
        .read()
        .final_bit();
    assert_eq!(read.header.read_size(), 4096);
    assert_eq!(read.header.write_size(), 0);
}

#[test]
fn response_records_underflow_residual() {
    let builder = ScsiCommandResponseBuilder::new()
        .initiator_task_tag(0x10)
        .status(ScsiStatus::CheckCondition)
        .residual(4096);

    let hdr = &builder.header;
    assert!(hdr.flags.fin());
    assert!(hdr.flags.u_big());
    assert!(!hdr.flags.o_big());
    assert_eq!(hdr.residual_count.get(), 4096);
    assert_eq!(hdr.response.decode().expect("code"), ResponseCode::CommandCompleted);
    assert_eq!(hdr.status.decode().expect("status"), ScsiStatus::CheckCondition);
}

#[test]
fn response_records_overflow_residual() {
    let builder = ScsiCommandResponseBuilder::new().residual(-512);
    assert!(builder.header.flags.o_big());
    assert!(!builder.header.flags.u_big());
    assert_eq!(builder.header.residual_count.get(), 512);
}

#[test]
fn task_attribute_codec_covers_reserved() {
    for v in 0u8..8 {
        let attr = TaskAttribute::from(v);
        assert_eq!(u8::from(attr), v, "attr {v}");
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A READ that fits one Data-In PDU: single FINAL+STATUS chunk with the
//! status collapsed in, correct sequence stamping, no residual.

use bytes::Bytes;
use iscsi_target_rs::{
    models::{
        command::{common::TaskAttribute, request::ScsiCommandRequestBuilder},
        common::{BasicHeaderSegment, HEADER_LEN, RESERVED_TAG},
        data::response::ScsiDataIn,
    },
    target::backend::ExecResult,
};
use zerocopy::FromBytes;

use super::common::{self, MemBackend, expect_silence, read_pdu, send_frame};

#[tokio::test]
async fn read_fits_one_pdu() {
    let backend = MemBackend::new();
    let payload = Bytes::from(vec![0xabu8; 4096]);
    backend.respond_to(0x28, ExecResult {
        data: payload.clone(),
        ..ExecResult::good()
    });

    let mut h = common::setup(common::test_config(), backend).await;
    h.session.set_exp_cmd_sn(5);

    let mut cdb = [0u8; 16];
    cdb[0] = 0x28; // READ(10)
    let hdr = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x10)
        .cmd_sn(5)
        .expected_data_transfer_length(4096)
        .scsi_descriptor_block(&cdb)
        .read()
        .final_bit()
        .task_attribute(TaskAttribute::Simple)
        .header;

    let mut bhs = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    let (rsp_bhs, rsp_data) = read_pdu(&mut h.client).await;
    let data_in = ScsiDataIn::ref_from_bytes(&rsp_bhs).expect("Data-In");

    assert!(data_in.flags.fin(), "FINAL expected");
    assert!(data_in.flags.s(), "status collapsed into the final chunk");
    assert_eq!(data_in.initiator_task_tag, hdr.initiator_task_tag);
    assert_eq!(data_in.target_transfer_tag.get(), RESERVED_TAG);
    assert_eq!(data_in.buffer_offset.get(), 0);
    assert_eq!(data_in.data_sn.get(), 0);
    assert_eq!(data_in.stat_sn_or_rsvd.get(), 0, "first StatSN");
    assert_eq!(data_in.exp_cmd_sn.get(), 6, "window advanced past CmdSN 5");
    assert_eq!(data_in.max_cmd_sn.get(), 6 + 32);
    assert_eq!(data_in.residual_count.get(), 0);
    assert_eq!(data_in.get_data_length_bytes(), 4096);
    assert_eq!(rsp_data, payload);

    expect_silence(&mut h.client).await;
}

#[tokio::test]
async fn read_larger_than_xmit_limit_is_segmented() {
    let backend = MemBackend::new();
    let payload = Bytes::from((0..16384u32).map(|i| i as u8).collect::<Vec<_>>());
    backend.respond_to(0x28, ExecResult {
        data: payload.clone(),
        ..ExecResult::good()
    });

    let mut h = common::setup(common::test_config(), backend).await;

    let mut cdb = [0u8; 16];
    cdb[0] = 0x28;
    let hdr = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x11)
        .cmd_sn(0)
        .expected_data_transfer_length(16384)
        .scsi_descriptor_block(&cdb)
        .read()
        .final_bit()
        .header;

    let mut bhs = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    let mut collected = Vec::new();
    for chunk in 0..2 {
        let (rsp_bhs, rsp_data) = read_pdu(&mut h.client).await;
        let data_in = ScsiDataIn::ref_from_bytes(&rsp_bhs).expect("Data-In");
        assert_eq!(data_in.data_sn.get(), chunk);
        assert_eq!(data_in.buffer_offset.get(), chunk * 8192);
        assert_eq!(data_in.get_data_length_bytes(), 8192);
        if chunk == 1 {
            assert!(data_in.flags.fin());
            assert!(data_in.flags.s());
        } else {
            assert!(!data_in.flags.fin());
            assert!(!data_in.flags.s());
        }
        collected.extend_from_slice(&rsp_data);
    }
    assert_eq!(collected, payload);
}

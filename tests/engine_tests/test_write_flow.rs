// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Solicited write: R2T issuance up to MaxOutstandingR2T, Data-Out
//! accounting, and the final status once the declared length arrived.

use iscsi_target_rs::models::{
    command::{
        common::ScsiStatus, request::ScsiCommandRequestBuilder,
        response::ScsiCommandResponse,
    },
    common::{BasicHeaderSegment, HEADER_LEN},
    data::request::ScsiDataOutBuilder,
    ready_2_transfer::response::ReadyToTransfer,
};
use zerocopy::FromBytes;

use super::common::{self, MemBackend, expect_silence, read_pdu, send_frame};

#[tokio::test]
async fn write_solicited_with_two_bursts() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    let mut cdb = [0u8; 16];
    cdb[0] = 0x2a; // WRITE(10)
    let hdr = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x20)
        .cmd_sn(0)
        .expected_data_transfer_length(16384)
        .scsi_descriptor_block(&cdb)
        .write()
        .final_bit()
        .header;

    let mut bhs = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    // Both R2Ts arrive up front (MaxOutstandingR2T = 2, MaxBurst = 8192).
    let mut ttt = 0;
    for i in 0..2u32 {
        let (r2t_bhs, _) = read_pdu(&mut h.client).await;
        let r2t = ReadyToTransfer::ref_from_bytes(&r2t_bhs).expect("R2T");
        assert_eq!(r2t.r2t_sn.get(), i);
        assert_eq!(r2t.buffer_offset.get(), i * 8192);
        assert_eq!(r2t.desired_data_transfer_length.get(), 8192);
        assert_eq!(r2t.initiator_task_tag, hdr.initiator_task_tag);
        assert_eq!(r2t.exp_cmd_sn.get(), 1);
        ttt = r2t.target_transfer_tag.get();
    }

    // Answer each R2T with one FINAL Data-Out covering its burst.
    for i in 0..2u32 {
        let mut dout = ScsiDataOutBuilder::new()
            .initiator_task_tag(0x20)
            .target_transfer_tag(ttt)
            .buffer_offset(i * 8192)
            .data_sn(0)
            .final_bit()
            .header;
        dout.set_data_length_bytes(8192);

        let mut dout_bhs = [0u8; HEADER_LEN];
        dout.to_bhs_bytes(&mut dout_bhs).expect("serialize");
        let burst = vec![(0x30 + i) as u8; 8192];
        send_frame(&mut h.client, &dout_bhs, &burst).await;
    }

    // Backend executed once all 16384 bytes arrived; GOOD, no residual.
    let (rsp_bhs, _) = read_pdu(&mut h.client).await;
    let rsp = ScsiCommandResponse::ref_from_bytes(&rsp_bhs).expect("SCSI Response");
    assert_eq!(rsp.initiator_task_tag, hdr.initiator_task_tag);
    assert_eq!(rsp.status.decode().expect("status"), ScsiStatus::Good);
    assert_eq!(rsp.stat_sn.get(), 0, "R2Ts must not consume StatSN");
    assert_eq!(rsp.residual_count.get(), 0);
    assert!(!rsp.flags.u_big());
    assert!(!rsp.flags.o_big());

    // The backend saw the full, correctly-assembled payload.
    let writes = h.backend.writes.lock().clone();
    assert_eq!(writes.len(), 1);
    let (_lun, data) = &writes[0];
    assert_eq!(data.len(), 16384);
    assert!(data[..8192].iter().all(|b| *b == 0x30));
    assert!(data[8192..].iter().all(|b| *b == 0x31));

    expect_silence(&mut h.client).await;
}

#[tokio::test]
async fn single_outstanding_r2t_resolicits_after_each_burst() {
    let backend = MemBackend::new();
    let mut cfg = common::test_config();
    cfg.negotiation.write_flow.max_outstanding_r2t = 1;
    let mut h = common::setup(cfg, backend).await;

    let mut cdb = [0u8; 16];
    cdb[0] = 0x2a;
    let hdr = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x21)
        .cmd_sn(0)
        .expected_data_transfer_length(16384)
        .scsi_descriptor_block(&cdb)
        .write()
        .final_bit()
        .header;

    let mut bhs = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    for i in 0..2u32 {
        let (r2t_bhs, _) = read_pdu(&mut h.client).await;
        let r2t = ReadyToTransfer::ref_from_bytes(&r2t_bhs).expect("R2T");
        assert_eq!(r2t.r2t_sn.get(), i, "one R2T per burst");
        assert_eq!(r2t.buffer_offset.get(), i * 8192);

        let mut dout = ScsiDataOutBuilder::new()
            .initiator_task_tag(0x21)
            .target_transfer_tag(r2t.target_transfer_tag.get())
            .buffer_offset(i * 8192)
            .final_bit()
            .header;
        dout.set_data_length_bytes(8192);
        let mut dout_bhs = [0u8; HEADER_LEN];
        dout.to_bhs_bytes(&mut dout_bhs).expect("serialize");
        send_frame(&mut h.client, &dout_bhs, &vec![0u8; 8192]).await;
    }

    let (rsp_bhs, _) = read_pdu(&mut h.client).await;
    let rsp = ScsiCommandResponse::ref_from_bytes(&rsp_bhs).expect("SCSI Response");
    assert_eq!(rsp.initiator_task_tag, hdr.initiator_task_tag);
}

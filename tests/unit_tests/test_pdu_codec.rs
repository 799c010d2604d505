// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{Bytes, BytesMut};
use iscsi_target_rs::{
    cfg::{
        config::{
            Config, Flow, Identity, Integrity, NegotiationConfig, Queue,
            RuntimeConfig, WriteFlow,
        },
        enums::{Digest, YesNo},
    },
    models::{
        command::request::ScsiCommandRequestBuilder,
        common::{Builder, HEADER_LEN},
        data::request::ScsiDataOut,
        data_fromat::{PduRequest, PduResponse},
        nop::response::NopInResponse,
    },
};

pub fn test_config(digests: Digest) -> Config {
    Config {
        negotiation: NegotiationConfig {
            identity: Identity {
                target_name: "iqn.2004-10.com.example:disk0".to_string(),
                target_alias: String::new(),
            },
            integrity: Integrity {
                header_digest: digests,
                data_digest: digests,
            },
            flow: Flow {
                max_recv_data_segment_length: 8192,
                max_xmit_data_segment_length: 8192,
                max_burst_length: 262144,
                first_burst_length: 65536,
            },
            write_flow: WriteFlow {
                initial_r2t: YesNo::No,
                immediate_data: YesNo::Yes,
                max_outstanding_r2t: 1,
            },
            queue: Queue {
                max_queued_cmnds: 32,
            },
        },
        runtime: RuntimeConfig {
            worker_threads: Some(2),
        },
    }
}

#[test]
fn build_pads_payload_and_appends_crc32c() {
    let cfg = test_config(Digest::CRC32C);

    let header = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x11)
        .expected_data_transfer_length(5)
        .write()
        .final_bit()
        .header;
    let mut header_buf = [0u8; HEADER_LEN];
    header.to_bhs_bytes(&mut header_buf).expect("serialize");

    let mut pdu = PduRequest::<iscsi_target_rs::models::command::request::ScsiCommandRequest>::new_request(
        header_buf, &cfg,
    );
    pdu.append_data(b"abcde");

    let (hdr, body) = pdu.build(8192, true, true).expect("build");
    // data segment length patched to 5
    assert_eq!(&hdr[5..8], &[0, 0, 5]);
    // header digest (4) + data (5) + pad (3) + data digest (4)
    assert_eq!(body.len(), 4 + 5 + 3 + 4);
    assert_eq!(&body[4..9], b"abcde");
    assert_eq!(&body[9..12], &[0, 0, 0]);
}

#[test]
fn parse_rejects_truncated_buffers() {
    let cfg = test_config(Digest::None);

    let header = ScsiCommandRequestBuilder::new()
        .expected_data_transfer_length(16)
        .write()
        .final_bit()
        .header;
    let mut header_buf = [0u8; HEADER_LEN];
    header.to_bhs_bytes(&mut header_buf).expect("serialize");

    let mut pdu = PduRequest::<iscsi_target_rs::models::command::request::ScsiCommandRequest>::new_request(
        header_buf, &cfg,
    );
    pdu.append_data(&[0u8; 16]);
    let (hdr, _body) = pdu.build(8192, false, false).expect("build");

    let mut reparse = PduRequest::<iscsi_target_rs::models::command::request::ScsiCommandRequest>::new_request(
        hdr, &cfg,
    );
    let short = BytesMut::from(&[0u8; 7][..]);
    assert!(reparse.parse_with_buff_mut(short, false, false).is_err());
}

#[test]
fn digest_mismatch_is_detected_on_parse() {
    let cfg = test_config(Digest::CRC32C);

    let header = ScsiCommandRequestBuilder::new()
        .expected_data_transfer_length(8)
        .write()
        .final_bit()
        .header;
    let mut header_buf = [0u8; HEADER_LEN];
    header.to_bhs_bytes(&mut header_buf).expect("serialize");

    let mut pdu = PduRequest::<iscsi_target_rs::models::command::request::ScsiCommandRequest>::new_request(
        header_buf, &cfg,
    );
    pdu.append_data(&[0xa5u8; 8]);
    let (hdr, mut body) = pdu.build(8192, true, true).expect("build");

    // flip one payload byte; the trailing CRC32C no longer matches
    body[5] ^= 0xff;

    let mut reparse = PduRequest::<iscsi_target_rs::models::command::request::ScsiCommandRequest>::new_request(
        hdr, &cfg,
    );
    assert!(
        reparse
            .parse_with_buff_mut(BytesMut::from(&body[..]), true, true)
            .is_err()
    );
}

#[test]
fn to_bytes_goes_through_the_builder() {
    use iscsi_target_rs::models::codec::ToBytes;

    let cfg = test_config(Digest::None);
    let header = ScsiCommandRequestBuilder::new().final_bit().header;
    let mut header_buf = [0u8; HEADER_LEN];
    header.to_bhs_bytes(&mut header_buf).expect("serialize");

    let mut pdu = PduRequest::<iscsi_target_rs::models::command::request::ScsiCommandRequest>::new_request(
        header_buf, &cfg,
    );
    let (hdr, body) = pdu.to_bytes(8192, false, false).expect("to_bytes");
    assert_eq!(hdr.len(), HEADER_LEN);
    assert!(body.is_empty());
}

#[test]
fn response_view_exposes_data_window() {
    let cfg = test_config(Digest::None);

    let mut header_buf = [0u8; HEADER_LEN];
    header_buf[0] = 0x20; // NOP-In
    header_buf[5..8].copy_from_slice(&[0, 0, 4]);

    let mut pdu = PduResponse::<NopInResponse>::from_header_slice(header_buf, &cfg);
    let payload = Bytes::from_static(b"ping");
    pdu.parse_with_buff(&payload, false, false).expect("parse");
    assert_eq!(pdu.data().expect("data"), b"ping");
}

#[test]
fn rebind_keeps_raw_bytes() {
    let cfg = test_config(Digest::None);

    let mut header_buf = [0u8; HEADER_LEN];
    header_buf[0] = 0x05; // Data-Out
    let pdu = PduResponse::<NopInResponse>::from_header_slice(header_buf, &cfg);
    let rebound = pdu.rebind_pdu::<ScsiDataOut>().expect("rebind");
    assert_eq!(rebound.header_buf[0], 0x05);
}

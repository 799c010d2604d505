// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fs;

use iscsi_target_rs::cfg::{
    cli::resolve_config_path,
    config::{Config, SessionParams},
    enums::Digest,
};
use serial_test::serial;

const SAMPLE: &str = r#"
negotiation:
  identity:
    TargetName: "iqn.2004-10.com.example:disk0"
  integrity:
    HeaderDigest: "None"
    DataDigest: "CRC32C"
  flow:
    MaxRecvDataSegmentLength: 8192
    MaxXmitDataSegmentLength: 8192
    MaxBurstLength: 262144
    FirstBurstLength: 65536
  write_flow:
    InitialR2T: "Yes"
    ImmediateData: "No"
    MaxOutstandingR2T: 2
  queue:
    MaxQueuedCmnds: 32
runtime:
  WorkerThreads: 4
"#;

#[test]
#[serial]
fn config_loads_from_yaml_with_rfc_key_names() {
    let path = std::env::temp_dir().join("iscsi-target-rs-test-config.yaml");
    fs::write(&path, SAMPLE).expect("write sample config");

    let cfg = Config::load_from_file(&path).expect("load config");
    assert_eq!(
        cfg.negotiation.identity.target_name,
        "iqn.2004-10.com.example:disk0"
    );
    assert_eq!(cfg.negotiation.integrity.header_digest, Digest::None);
    assert_eq!(cfg.negotiation.integrity.data_digest, Digest::CRC32C);
    assert_eq!(cfg.negotiation.write_flow.max_outstanding_r2t, 2);
    assert_eq!(cfg.runtime.worker_threads, Some(4));

    let params = SessionParams::from_config(&cfg, "iqn.1993-08.org.debian:01:abc");
    assert!(params.initial_r2t);
    assert!(!params.immediate_data);
    assert!(params.data_digest.enabled());

    let resolved = resolve_config_path(path.to_str().expect("utf-8 path"))
        .expect("resolve absolute path");
    assert!(resolved.is_absolute());

    fs::remove_file(&path).ok();
}

#[test]
fn invalid_config_is_refused() {
    let mut bad: Config = serde_yaml::from_str(SAMPLE).expect("parse sample");
    bad.negotiation.flow.first_burst_length = 1 << 30;
    assert!(bad.validate().is_err());

    let mut bad: Config = serde_yaml::from_str(SAMPLE).expect("parse sample");
    bad.negotiation.identity.target_name.clear();
    assert!(bad.validate().is_err());
}

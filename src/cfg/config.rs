// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{Digest, YesNo};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Parameters a login phase would have negotiated with the initiator.
    /// The engine treats them as read-only facts about the session.
    pub negotiation: NegotiationConfig,
    /// Implementation/runtime parameters that live outside the iSCSI protocol.
    pub runtime: RuntimeConfig,
}

/// Negotiated operational parameters grouped by logical domains.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NegotiationConfig {
    /// Target identity.
    pub identity: Identity,
    /// Header/Data digest selection.
    pub integrity: Integrity,
    /// Receive/transmit flow limits.
    pub flow: Flow,
    /// Write-data solicitation parameters (InitialR2T / ImmediateData /
    /// MaxOutstandingR2T).
    pub write_flow: WriteFlow,
    /// Command-window depth (MaxCmdSN = ExpCmdSN + MaxQueuedCmnds).
    pub queue: Queue,
}

/// Identity of the target portal this engine serves.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Identity {
    #[serde(rename = "TargetName")]
    /// Target IQN (mandatory).
    pub target_name: String,

    #[serde(default, rename = "TargetAlias")]
    /// Optional human-readable alias for the target.
    pub target_alias: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Digest selection negotiated via HeaderDigest/DataDigest.
pub struct Integrity {
    #[serde(rename = "HeaderDigest")]
    /// Header digest algorithm.
    pub header_digest: Digest,
    #[serde(rename = "DataDigest")]
    /// Data digest algorithm.
    pub data_digest: Digest,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Flow-control limits for the data paths.
pub struct Flow {
    #[serde(rename = "MaxRecvDataSegmentLength")]
    /// Maximum data segment length the target accepts in one PDU.
    pub max_recv_data_segment_length: u32,
    #[serde(rename = "MaxXmitDataSegmentLength")]
    /// Maximum data segment length the initiator accepts in one PDU.
    pub max_xmit_data_segment_length: u32,
    #[serde(rename = "MaxBurstLength")]
    /// Maximum bytes solicited by a single R2T.
    pub max_burst_length: u32,
    #[serde(rename = "FirstBurstLength")]
    /// Unsolicited burst size allowed before the first R2T.
    pub first_burst_length: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Write-data solicitation settings.
pub struct WriteFlow {
    #[serde(rename = "InitialR2T")]
    /// Whether the target demands an R2T before any write data (Yes/No).
    pub initial_r2t: YesNo,
    #[serde(rename = "ImmediateData")]
    /// Whether immediate unsolicited data is permitted.
    pub immediate_data: YesNo,
    #[serde(rename = "MaxOutstandingR2T")]
    /// Maximum number of concurrent outstanding R2T requests per task.
    pub max_outstanding_r2t: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Command-queue depth advertised through MaxCmdSN.
pub struct Queue {
    #[serde(rename = "MaxQueuedCmnds")]
    /// How far CmdSN may run ahead of ExpCmdSN.
    pub max_queued_cmnds: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Runtime-only settings that do not map to RFC keys.
pub struct RuntimeConfig {
    #[serde(default, rename = "WorkerThreads")]
    /// Size of each of the reader/writer pools; defaults to
    /// max(online CPUs, 2) when omitted.
    pub worker_threads: Option<usize>,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates invariants of the negotiated parameter set.
    pub fn validate(&self) -> Result<()> {
        let n = &self.negotiation;

        ensure!(
            !n.identity.target_name.is_empty(),
            "TargetName must not be empty"
        );
        ensure!(
            n.flow.max_recv_data_segment_length >= 512,
            "MaxRecvDataSegmentLength must be >= 512"
        );
        ensure!(
            n.flow.max_xmit_data_segment_length >= 512,
            "MaxXmitDataSegmentLength must be >= 512"
        );
        ensure!(n.flow.max_burst_length >= 512, "MaxBurstLength must be >= 512");
        ensure!(
            n.flow.first_burst_length <= n.flow.max_burst_length,
            "FirstBurstLength must not exceed MaxBurstLength"
        );
        ensure!(
            n.write_flow.max_outstanding_r2t >= 1,
            "MaxOutstandingR2T must be >= 1"
        );
        ensure!(n.queue.max_queued_cmnds >= 1, "MaxQueuedCmnds must be >= 1");

        if let Some(threads) = self.runtime.worker_threads {
            ensure!(threads >= 1, "WorkerThreads must be >= 1");
        }

        Ok(())
    }
}

/// Per-session view of the negotiated parameters, read-only to the engine
/// core. Built from the portal [`Config`] plus what login learned about the
/// peer.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub initiator_name: String,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub max_recv_data_length: u32,
    pub max_xmit_data_length: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub max_outstanding_r2t: u32,
    pub max_queued_cmnds: u32,
    pub header_digest: Digest,
    pub data_digest: Digest,
}

impl SessionParams {
    pub fn from_config(cfg: &Config, initiator_name: impl Into<String>) -> Self {
        let n = &cfg.negotiation;
        Self {
            initiator_name: initiator_name.into(),
            initial_r2t: n.write_flow.initial_r2t.as_bool(),
            immediate_data: n.write_flow.immediate_data.as_bool(),
            max_recv_data_length: n.flow.max_recv_data_segment_length,
            max_xmit_data_length: n.flow.max_xmit_data_segment_length,
            max_burst_length: n.flow.max_burst_length,
            first_burst_length: n.flow.first_burst_length,
            max_outstanding_r2t: n.write_flow.max_outstanding_r2t,
            max_queued_cmnds: n.queue.max_queued_cmnds,
            header_digest: n.integrity.header_digest,
            data_digest: n.integrity.data_digest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::enums::{Digest, YesNo};

    fn base() -> Config {
        Config {
            negotiation: NegotiationConfig {
                identity: Identity {
                    target_name: "iqn.2004-10.com.example:disk0".to_string(),
                    target_alias: String::new(),
                },
                integrity: Integrity {
                    header_digest: Digest::None,
                    data_digest: Digest::None,
                },
                flow: Flow {
                    max_recv_data_segment_length: 8192,
                    max_xmit_data_segment_length: 8192,
                    max_burst_length: 262144,
                    first_burst_length: 65536,
                },
                write_flow: WriteFlow {
                    initial_r2t: YesNo::Yes,
                    immediate_data: YesNo::No,
                    max_outstanding_r2t: 1,
                },
                queue: Queue {
                    max_queued_cmnds: 32,
                },
            },
            runtime: RuntimeConfig {
                worker_threads: None,
            },
        }
    }

    #[test]
    fn validate_accepts_sane_defaults() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn validate_rejects_first_burst_above_max_burst() {
        let mut cfg = base();
        cfg.negotiation.flow.first_burst_length = 1 << 20;
        cfg.negotiation.flow.max_burst_length = 8192;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_params_mirror_negotiation() {
        let cfg = base();
        let p = SessionParams::from_config(&cfg, "iqn.1993-08.org.debian:01:abc");
        assert!(p.initial_r2t);
        assert!(!p.immediate_data);
        assert_eq!(p.max_burst_length, 262144);
        assert_eq!(p.max_queued_cmnds, 32);
        assert_eq!(p.initiator_name, "iqn.1993-08.org.debian:01:abc");
    }
}

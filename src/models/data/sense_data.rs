// SPDX-License-Identifier: AGPL-3.0-or-later GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use anyhow::{Context, Result, anyhow};
use bytes::{BufMut, BytesMut};

/// Fixed-format sense bytes the target builds for CHECK CONDITION
/// responses: response code 0x70, the sense key, and an additional
/// length of 6 covering ASC/ASCQ.
pub const FIXED_SENSE_LEN: usize = 14;

#[repr(C)]
#[derive(Default, PartialEq)]
pub struct SenseData {
    pub valid: bool,
    pub response_code: u8,
    pub sense_key: u8,
    pub ili: bool,
    pub eom: bool,
    pub filemark: bool,
    pub information: u32,
    pub additional_len: u8,
    pub cmd_specific: u32,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    /// Fixed-format sense bytes for (key, asc, ascq), as they appear
    /// after the iSCSI sense-length prefix.
    pub fn fixed(sense_key: u8, asc: u8, ascq: u8) -> [u8; FIXED_SENSE_LEN] {
        let mut sense = [0u8; FIXED_SENSE_LEN];
        sense[0] = 0xf0;
        sense[2] = sense_key & 0x0F;
        sense[7] = 6; // Additional sense length
        sense[12] = asc;
        sense[13] = ascq;
        sense
    }

    /// Encode the iSCSI sense blob carried in a SCSI Response data
    /// segment: a 2-byte big-endian SenseLength followed by fixed-format
    /// sense bytes, zero-padded by the caller to a 4-byte boundary.
    pub fn build(sense_key: u8, asc: u8, ascq: u8) -> BytesMut {
        let mut buf = BytesMut::with_capacity(2 + FIXED_SENSE_LEN);
        buf.put_u16(FIXED_SENSE_LEN as u16);
        buf.put_slice(&Self::fixed(sense_key, asc, ascq));
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_SENSE_LEN {
            return Err(anyhow!("sense buffer too small: {}", buf.len()));
        }

        let sense = if buf.len() >= 3 {
            let maybe_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            let rc = buf[2] & 0x7F;
            if maybe_len + 2 <= buf.len() && matches!(rc, 0x70..=0x73) {
                &buf[2..]
            } else {
                buf
            }
        } else {
            buf
        };

        if sense.len() < FIXED_SENSE_LEN {
            return Err(anyhow!(
                "sense payload too small after prefix stripping: {}",
                sense.len()
            ));
        }

        let response_code = sense[0] & 0x7F;

        match response_code {
            0x70 | 0x71 => Self::parse_fixed(sense),
            0x72 | 0x73 => Err(anyhow!(
                "descriptor-format sense (0x{:02x}) is not supported yet",
                response_code
            )),
            other => Err(anyhow!("unknown sense response code 0x{:02x}", other)),
        }
    }

    fn parse_fixed(sense: &[u8]) -> Result<Self> {
        if sense.len() < FIXED_SENSE_LEN {
            return Err(anyhow!("fixed sense too small: {}", sense.len()));
        }

        let valid = sense[0] & 0x80 != 0;
        let response_code = sense[0] & 0x7F;

        let filemark = sense[2] & 0x80 != 0;
        let eom = sense[2] & 0x40 != 0;
        let ili = sense[2] & 0x20 != 0;
        let sense_key = sense[2] & 0x0F;

        let information = u32::from_be_bytes(
            sense[3..7]
                .try_into()
                .context("failed to read Information (3..6)")?,
        );

        let additional_len = sense[7];

        let cmd_specific = u32::from_be_bytes(
            sense[8..12]
                .try_into()
                .context("failed to read Cmd-specific (8..11)")?,
        );

        let asc = sense[12];
        let ascq = sense[13];

        Ok(SenseData {
            valid,
            response_code,
            sense_key,
            ili,
            eom,
            filemark,
            information,
            additional_len,
            cmd_specific,
            asc,
            ascq,
        })
    }
}

impl fmt::Debug for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenseData")
            .field("valid", &self.valid)
            .field(
                "response_code",
                &format_args!("{:#04x}", self.response_code),
            )
            .field("sense_key", &format_args!("{:#x}", self.sense_key))
            .field("filemark", &self.filemark)
            .field("eom", &self.eom)
            .field("ili", &self.ili)
            .field("information", &self.information)
            .field("additional_len", &self.additional_len)
            .field("cmd_specific", &self.cmd_specific)
            .field("asc", &format_args!("{:#04x}", self.asc))
            .field("ascq", &format_args!("{:#04x}", self.ascq))
            .finish()
    }
}

/// Sense keys the engine raises on its own behalf.
pub mod keys {
    pub const ABORTED_COMMAND: u8 = 0x0b;
    pub const HARDWARE_ERROR: u8 = 0x04;
}

/// ASC/ASCQ pair for a data-phase CRC failure detected by the target.
pub const CRC_ERROR_ASC: u8 = 0x47;
pub const CRC_ERROR_ASCQ: u8 = 0x05;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_fixed_sense() {
        let blob = SenseData::build(keys::ABORTED_COMMAND, CRC_ERROR_ASC, CRC_ERROR_ASCQ);
        assert_eq!(u16::from_be_bytes([blob[0], blob[1]]) as usize, FIXED_SENSE_LEN);

        let parsed = SenseData::parse(&blob).expect("parse back");
        assert_eq!(parsed.sense_key, keys::ABORTED_COMMAND);
        assert_eq!(parsed.asc, CRC_ERROR_ASC);
        assert_eq!(parsed.ascq, CRC_ERROR_ASCQ);
        assert_eq!(parsed.response_code, 0x70);
        assert!(parsed.valid);
    }
}

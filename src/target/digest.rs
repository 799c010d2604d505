// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use bytes::BytesMut;
use tracing::{debug, error};

use crate::{
    models::data::sense_data::{CRC_ERROR_ASC, CRC_ERROR_ASCQ, SenseData, keys},
    models::data_fromat::compute_data_digest,
    target::{cmnd::Cmnd, tx},
};

/// Compute the CRC32C data digest of an outgoing PDU's payload window
/// (zero-padded to a 4-byte boundary, per the wire rules).
pub(crate) fn digest_tx_data(cmnd: &Cmnd) -> u32 {
    let payload = tx::tx_payload(cmnd);
    compute_data_digest(&payload)
}

/// Verify the digests of every Data-Out PDU queued on a write request.
/// Runs from the backend's pre-exec hook; a mismatch aborts execution
/// with a CRC sense blob. Verified entries are dropped; on failure the
/// remainder of the list is left for release to clean up.
pub(crate) fn verify_rx_ddigests(req: &Arc<Cmnd>) -> Result<(), BytesMut> {
    loop {
        let dcmnd = {
            let list = req.rx_ddigest_cmd_list.lock();
            list.first().cloned()
        };
        let Some(dcmnd) = dcmnd else {
            return Ok(());
        };

        debug!(id = dcmnd.id(), "checking rx ddigest");

        let offset = {
            let bhs = dcmnd.bhs();
            u32::from_be_bytes([bhs[40], bhs[41], bhs[42], bhs[43]]) as usize
        };
        let size = dcmnd.datasize() as usize;

        let computed = {
            let sg = req.sg.lock();
            compute_data_digest(&sg.slice(offset, size))
        };
        let received = dcmnd.rx_ddigest.load(Ordering::SeqCst);

        if computed != received {
            error!(
                id = dcmnd.id(),
                received = format_args!("{received:#010x}"),
                computed = format_args!("{computed:#010x}"),
                "rx data digest mismatch"
            );
            return Err(SenseData::build(
                keys::ABORTED_COMMAND,
                CRC_ERROR_ASC,
                CRC_ERROR_ASCQ,
            ));
        }

        let mut list = req.rx_ddigest_cmd_list.lock();
        if !list.is_empty() {
            list.remove(0);
        }
    }
}

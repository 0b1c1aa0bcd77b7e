//! Receive-role transaction state machines (classes 1 and 2).
//!
//! Class 1 reception is purely event driven: file data is written as it
//! arrives and the EOF PDU triggers the final size and checksum validation,
//! after which the transaction resets no matter the outcome.
//!
//! Class 2 records every received byte range in the transaction's chunk
//! tracker and, once the EOF is known, repeatedly runs a completion check
//! which either issues NAKs for missing metadata or file ranges or declares
//! the transfer complete. The file checksum is recomputed from the stored
//! file under a per-cycle byte budget before the Finished PDU goes out.
use alloc::vec::Vec;

use crate::engine::{
    declare_fault, filestore_fault, outbound_header, reset_transaction, send_pdu,
    write_file_segment, Sys,
};
use crate::filestore::VirtualFilestore;
use crate::pdu::{
    ack::AckPdu, eof::EofPdu, file_data::FileDataPdu, finished::FinishedPdu,
    metadata::MetadataPdu, nak::{NakPdu, SegmentRequest}, ConditionCode, DeliveryCode,
    FileDirectiveType, FileStatus, Pdu, PduPayload, TransactionStatus,
};
use crate::timer::Timer;
use crate::transaction::{RecvSub, Transaction, TxnState};
use crate::transport::PduTransport;
use crate::user::TransferUser;

/// Progress of the budgeted deferred checksum calculation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CrcCalc {
    InProgress,
    Done(u32),
    Failed,
}

/// Inbound PDU routed to a receiving transaction.
pub(crate) fn dispatch_pdu<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    pdu: &Pdu,
) {
    if txn.state == TxnState::Drop {
        // Class 1 file data without metadata: the sink consumes everything
        // without further accounting.
        return;
    }
    match &pdu.payload {
        PduPayload::FileData(fd) => handle_file_data(txn, sys, fd),
        PduPayload::Metadata(md) => handle_metadata(txn, sys, md),
        PduPayload::Eof(eof) => handle_eof(txn, sys, eof),
        PduPayload::Ack(ack) => handle_ack(txn, sys, ack),
        // NAK and Finished target the sending entity.
        _ => sys.counters.recv.errors += 1,
    }
}

fn handle_file_data<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    fd: &FileDataPdu,
) {
    if write_file_segment(sys.fs, txn, fd.offset, &fd.data).is_err() {
        filestore_fault(txn, sys);
        return;
    }
    txn.file_offset = txn.file_offset.max(fd.end());
    if txn.state == TxnState::R1 {
        // Class 1 trusts in-order delivery: the digest runs in arrival
        // order and a reordered stream surfaces as a checksum failure at
        // EOF.
        txn.crc.digest(&fd.data);
        return;
    }
    txn.chunks.add(fd.offset, fd.data.len() as u64);
    let flags = txn.role.recv_params().unwrap().flags;
    if flags.eof_received && flags.nak_sent {
        // Repair data is flowing in, see whether this closed the last gap.
        // Another NAK round is only issued by the NAK activity timer.
        check_complete(txn, sys, false);
    }
}

fn handle_metadata<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    md: &MetadataPdu,
) {
    let Some(params) = txn.role.recv_params() else {
        sys.counters.recv.errors += 1;
        return;
    };
    if params.flags.metadata_received {
        // Duplicate metadata carries nothing new.
        return;
    }
    if params.flags.eof_received && params.eof_size != md.file_size {
        declare_fault(txn, sys, ConditionCode::FileSizeError);
        reset_transaction(txn, sys, true);
        return;
    }
    // Late metadata: the data received so far lives in the temporary file,
    // move it to its real destination and continue there.
    let temp_name = sys.histories[txn.history.unwrap().index()]
        .dest_filename
        .clone();
    if let Some(file) = txn.file.take() {
        let _ = sys.fs.close(file);
    }
    if sys.fs.rename(&temp_name, &md.dest_filename).is_err() {
        filestore_fault(txn, sys);
        return;
    }
    match sys.fs.open_for_update(&md.dest_filename) {
        Ok(file) => {
            txn.file = Some(file);
            txn.cached_position = 0;
        }
        Err(_) => {
            filestore_fault(txn, sys);
            return;
        }
    }
    let history = &mut sys.histories[txn.history.unwrap().index()];
    history.source_filename.clone_from(&md.source_filename);
    history.dest_filename.clone_from(&md.dest_filename);
    let params = txn.role.recv_params_mut().unwrap();
    params.using_temp_file = false;
    params.flags.metadata_received = true;
    let eof_received = params.flags.eof_received;
    if !eof_received {
        txn.file_size = md.file_size;
    } else {
        check_complete(txn, sys, true);
    }
}

fn handle_eof<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    eof: &EofPdu,
) {
    sys.user.eof_received(&txn.transaction_id());
    if txn.state == TxnState::R1 {
        handle_eof_r1(txn, sys, eof);
        return;
    }
    let params = txn.role.recv_params_mut().unwrap();
    if params.flags.eof_received {
        // Duplicate EOF, acknowledge again.
        params.flags.send_ack = true;
        return;
    }
    params.eof_crc = eof.checksum;
    params.eof_size = eof.file_size;
    params.eof_condition = eof.condition_code;
    params.flags.eof_received = true;
    params.flags.send_ack = true;
    let metadata_received = params.flags.metadata_received;
    if eof.condition_code != ConditionCode::NoError {
        // Sender-side abort. The EOF still gets acknowledged (best effort),
        // then the transaction winds down without a Finished exchange.
        txn.condition_code = eof.condition_code;
        send_eof_ack_now(txn, sys);
        reset_transaction(txn, sys, true);
        return;
    }
    if metadata_received && txn.file_size != eof.file_size {
        declare_fault(txn, sys, ConditionCode::FileSizeError);
        send_eof_ack_now(txn, sys);
        reset_transaction(txn, sys, true);
        return;
    }
    txn.file_size = eof.file_size;
    txn.ack_timer = Timer::new(sys.cfg.nak_timer_seconds, sys.cfg.ticks_per_second);
    txn.flags.ack_timer_armed = true;
    check_complete(txn, sys, true);
}

fn handle_eof_r1<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    eof: &EofPdu,
) {
    if let Some(params) = txn.role.recv_params_mut() {
        params.sub = RecvSub::Eof;
    }
    if eof.condition_code != ConditionCode::NoError {
        txn.condition_code = eof.condition_code;
        reset_transaction(txn, sys, true);
        return;
    }
    let computed = txn.crc.finalize();
    txn.flags.crc_calculated = true;
    if txn.file_offset != eof.file_size {
        declare_fault(txn, sys, ConditionCode::FileSizeError);
    } else if computed != eof.checksum {
        declare_fault(txn, sys, ConditionCode::FileChecksumFailure);
    }
    // Success keeps the file; there is no second chance either way.
    reset_transaction(txn, sys, true);
}

fn handle_ack<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    ack: &AckPdu,
) {
    let sub = txn.role.recv_params().map(|params| params.sub);
    if txn.state == TxnState::R2
        && sub == Some(RecvSub::WaitFinAck)
        && ack.acked_directive == FileDirectiveType::FinishedPdu
    {
        // Closure complete.
        reset_transaction(txn, sys, true);
    } else {
        sys.counters.recv.errors += 1;
    }
}

/// Best effort EOF acknowledgement on paths which reset right afterwards.
fn send_eof_ack_now<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) {
    let condition = txn.role.recv_params().unwrap().eof_condition;
    let ack = AckPdu::new(
        FileDirectiveType::EofPdu,
        condition,
        TransactionStatus::Active,
    );
    let header = outbound_header(txn, sys.cfg.local_eid);
    if send_pdu(sys, header, PduPayload::Ack(ack)).is_ok() {
        txn.role.recv_params_mut().unwrap().flags.send_ack = false;
    }
}

/// Decide whether a class 2 transaction is complete, needs another NAK
/// round, or ran out of NAK attempts.
///
/// Invoked after the EOF, after NAK-driven progress and on expiry of the
/// NAK activity timer. Only the latter two EOF/timer paths are allowed to
/// open a new NAK round (`ok_to_send_nak`); the per-segment re-check merely
/// looks for completion while a round is outstanding.
pub(crate) fn check_complete<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    ok_to_send_nak: bool,
) {
    let nak_limit = sys.cfg.nak_limit;
    let params = txn.role.recv_params().unwrap();
    if !params.flags.eof_received {
        return;
    }
    if !params.flags.metadata_received {
        if !ok_to_send_nak {
            return;
        }
        if params.nak_count >= nak_limit {
            force_completion(txn, sys);
        } else {
            txn.role.recv_params_mut().unwrap().flags.send_nak = true;
        }
        return;
    }
    let gap_count = txn.chunks.compute_gaps(1, txn.file_size, 0, |_| {});
    if gap_count > 0 {
        if !ok_to_send_nak {
            return;
        }
        if params.nak_count >= nak_limit {
            force_completion(txn, sys);
        } else {
            txn.role.recv_params_mut().unwrap().flags.send_nak = true;
        }
    } else {
        let params = txn.role.recv_params_mut().unwrap();
        params.flags.send_nak = false;
        params.flags.nak_sent = false;
        params.flags.complete = true;
        params.flags.send_fin = true;
    }
}

/// The NAK limit was reached: stop waiting and close the transaction with
/// whatever data is there.
fn force_completion<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) {
    declare_fault(txn, sys, ConditionCode::NakLimitReached);
    let params = txn.role.recv_params_mut().unwrap();
    params.flags.send_nak = false;
    params.flags.complete = true;
    params.flags.send_fin = true;
}

/// Tick processing for transactions on the receive queue.
pub(crate) fn tick<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) {
    if txn.flags.suspended {
        return;
    }
    if txn.inactivity_timer.expired() {
        declare_fault(txn, sys, ConditionCode::InactivityDetected);
        reset_transaction(txn, sys, true);
        return;
    }
    txn.inactivity_timer.tick();
    if txn.state != TxnState::R2 {
        // Class 1 reception and the drop sink are purely event driven.
        return;
    }
    // Deferred EOF acknowledgement.
    if txn.role.recv_params().unwrap().flags.send_ack {
        send_eof_ack_now(txn, sys);
        if txn.role.recv_params().unwrap().flags.send_ack {
            // Still no transport buffer, retry next tick.
            return;
        }
    }
    // Deferred NAK round.
    if txn.role.recv_params().unwrap().flags.send_nak && !send_nak_round(txn, sys) {
        return;
    }
    // Deferred Finished PDU, preceded by the budgeted checksum.
    if txn.role.recv_params().unwrap().flags.send_fin {
        tick_send_fin(txn, sys);
        return;
    }
    tick_ack_timer(txn, sys);
}

fn tick_ack_timer<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) {
    if !txn.flags.ack_timer_armed {
        return;
    }
    if !txn.ack_timer.expired() {
        txn.ack_timer.tick();
        return;
    }
    if txn.role.recv_params().unwrap().sub == RecvSub::WaitFinAck {
        // Finished PDU was not acknowledged in time.
        let params = txn.role.recv_params_mut().unwrap();
        params.ack_count += 1;
        if params.ack_count >= sys.cfg.ack_limit {
            declare_fault(txn, sys, ConditionCode::PositiveAckLimitReached);
            reset_transaction(txn, sys, true);
            return;
        }
        if send_fin_pdu(txn, sys) {
            txn.ack_timer = Timer::new(sys.cfg.ack_timer_seconds, sys.cfg.ticks_per_second);
        }
    } else {
        // NAK activity timer: no (sufficient) repair data arrived, run the
        // completion check again for another NAK round.
        txn.flags.ack_timer_armed = false;
        check_complete(txn, sys, true);
    }
}

fn tick_send_fin<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) {
    if txn.condition_code == ConditionCode::NoError && !txn.flags.crc_calculated {
        match continue_crc_calc(txn, sys) {
            CrcCalc::InProgress => return,
            CrcCalc::Failed => {
                filestore_fault(txn, sys);
                return;
            }
            CrcCalc::Done(computed) => {
                txn.flags.crc_calculated = true;
                let expected = txn.role.recv_params().unwrap().eof_crc;
                if computed != expected {
                    declare_fault(txn, sys, ConditionCode::FileChecksumFailure);
                }
            }
        }
    }
    if send_fin_pdu(txn, sys) {
        let params = txn.role.recv_params_mut().unwrap();
        params.flags.send_fin = false;
        params.sub = RecvSub::WaitFinAck;
        params.ack_count = 0;
        txn.ack_timer = Timer::new(sys.cfg.ack_timer_seconds, sys.cfg.ticks_per_second);
        txn.flags.ack_timer_armed = true;
    }
}

fn send_fin_pdu<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) -> bool {
    let fin = if txn.condition_code == ConditionCode::NoError {
        FinishedPdu::new_success()
    } else {
        FinishedPdu::new(
            txn.condition_code,
            DeliveryCode::Incomplete,
            FileStatus::DiscardDeliberately,
        )
    };
    let header = outbound_header(txn, sys.cfg.local_eid);
    send_pdu(sys, header, PduPayload::Finished(fin)).is_ok()
}

fn send_nak_round<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) -> bool {
    let metadata_received = txn.role.recv_params().unwrap().flags.metadata_received;
    let nak = if !metadata_received {
        NakPdu::with_segment_requests(
            0,
            txn.file_size,
            alloc::vec![SegmentRequest::metadata_request()],
        )
    } else {
        let mut requests: Vec<SegmentRequest> = Vec::with_capacity(sys.cfg.max_gaps_per_nak);
        txn.chunks
            .compute_gaps(sys.cfg.max_gaps_per_nak, txn.file_size, 0, |gap| {
                requests.push(SegmentRequest::new(gap.offset, gap.end()))
            });
        NakPdu::with_segment_requests(0, txn.file_size, requests)
    };
    let header = outbound_header(txn, sys.cfg.local_eid);
    match send_pdu(sys, header, PduPayload::Nak(nak)) {
        Ok(()) => {
            sys.counters.sent.naks += 1;
            let params = txn.role.recv_params_mut().unwrap();
            params.flags.send_nak = false;
            params.flags.nak_sent = true;
            params.nak_count += 1;
            txn.ack_timer = Timer::new(sys.cfg.nak_timer_seconds, sys.cfg.ticks_per_second);
            txn.flags.ack_timer_armed = true;
            true
        }
        Err(_) => false,
    }
}

/// Digest up to the configured per-wakeup byte budget of the stored file
/// into the transaction's checksum.
fn continue_crc_calc<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) -> CrcCalc {
    let mut budget = sys.cfg.rx_crc_calc_bytes_per_wakeup;
    let mut buf = [0u8; 1024];
    loop {
        let position = txn.role.recv_params().unwrap().crc_calc_position;
        if position >= txn.file_size || budget == 0 {
            break;
        }
        let want = (buf.len() as u64).min(budget).min(txn.file_size - position) as usize;
        let Some(file) = txn.file.as_mut() else {
            return CrcCalc::Failed;
        };
        if txn.cached_position != position && sys.fs.seek(file, position).is_err() {
            return CrcCalc::Failed;
        }
        let read = match sys.fs.read(file, &mut buf[..want]) {
            Ok(0) | Err(_) => return CrcCalc::Failed,
            Ok(read) => read,
        };
        txn.crc.digest(&buf[..read]);
        txn.cached_position = position + read as u64;
        txn.role.recv_params_mut().unwrap().crc_calc_position = position + read as u64;
        budget -= read as u64;
    }
    if txn.role.recv_params().unwrap().crc_calc_position >= txn.file_size {
        CrcCalc::Done(txn.crc.finalize())
    } else {
        CrcCalc::InProgress
    }
}

/// Cancel a receiving transaction. Class 2 still closes the protocol with a
/// Finished PDU, class 1 and the drop sink reset immediately.
pub(crate) fn cancel<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) {
    if txn.flags.canceled {
        return;
    }
    txn.flags.canceled = true;
    if txn.condition_code == ConditionCode::NoError {
        txn.condition_code = ConditionCode::CancelRequestReceived;
    }
    match txn.state {
        TxnState::R2 => {
            let params = txn.role.recv_params_mut().unwrap();
            params.flags.send_nak = false;
            params.flags.send_fin = true;
        }
        _ => {
            // No protocol closure is possible.
            reset_transaction(txn, sys, true);
        }
    }
}

//! Send-role transaction state machines (classes 1 and 2).
//!
//! An outgoing transaction walks `Metadata -> FileData -> Eof`; class 2 then
//! continues through `WaitEofAck -> WaitFin -> SendFinAck` while class 1 is
//! done after the EOF attempt. The active transaction progresses in
//! [cycle_active] (driven once per engine cycle for one transaction per
//! channel), everything waiting for acknowledgements is driven from
//! [tick_waiting].
use alloc::vec::Vec;

use crate::engine::{
    declare_fault, filestore_fault, outbound_header, read_file_segment, reset_transaction,
    send_pdu, Sys,
};
use crate::filestore::VirtualFilestore;
use crate::pdu::{
    ack::AckPdu, eof::EofPdu, file_data::FileDataPdu, metadata::MetadataPdu, ConditionCode,
    FileDirectiveType, PduPayload, TransactionStatus,
};
use crate::queue::QueueId;
use crate::timer::Timer;
use crate::transaction::{FinDisposition, SendSub, Transaction, TxnState};
use crate::transport::PduTransport;
use crate::user::TransferUser;

/// Outcome of one state machine step of the active transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum StepResult {
    /// A PDU went out or a sub-state transition happened.
    Progress,
    /// The transport has no buffer this cycle, retry on the next one.
    Blocked,
    /// Nothing further to do this cycle.
    Done,
}

/// Outcome of servicing pending NAK responses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum NakService {
    Nothing,
    Sent,
    Blocked,
    Failed,
}

/// Drive the channel's active outgoing transaction for one engine cycle.
pub(crate) fn cycle_active<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) {
    if txn.flags.suspended {
        return;
    }
    let budget = sys.channel_config().outgoing_messages_per_wakeup.max(1);
    for _ in 0..budget {
        if step(txn, sys) != StepResult::Progress || txn.state == TxnState::Idle {
            break;
        }
    }
}

fn step<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) -> StepResult {
    let Some(sub) = txn.role.send_params().map(|params| params.sub) else {
        return StepResult::Done;
    };
    match sub {
        SendSub::Metadata => step_metadata(txn, sys),
        SendSub::FileData => step_file_data(txn, sys),
        SendSub::Eof => step_eof(txn, sys),
        // The acknowledgement states are driven by tick processing.
        _ => StepResult::Done,
    }
}

fn step_metadata<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) -> StepResult {
    let (source_name, dest_name) = sys.filenames(txn);
    if txn.file.is_none() {
        let mut file = match sys.fs.open_for_read(&source_name) {
            Ok(file) => file,
            Err(_) => {
                filestore_fault(txn, sys);
                return StepResult::Done;
            }
        };
        match sys.fs.file_size(&mut file) {
            Ok(size) => {
                txn.file_size = size;
                txn.cached_position = 0;
                txn.file = Some(file);
            }
            Err(_) => {
                let _ = sys.fs.close(file);
                filestore_fault(txn, sys);
                return StepResult::Done;
            }
        }
    }
    let metadata = MetadataPdu::new(txn.file_size, source_name, dest_name);
    let header = outbound_header(txn, sys.cfg.local_eid);
    match send_pdu(sys, header, PduPayload::Metadata(metadata)) {
        Ok(()) => {
            txn.role.send_params_mut().unwrap().sub = SendSub::FileData;
            StepResult::Progress
        }
        Err(_) => StepResult::Blocked,
    }
}

fn step_file_data<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) -> StepResult {
    // NAK responses preempt in-order progress for this cycle.
    if txn.state == TxnState::S2 {
        match service_nak_response(txn, sys) {
            NakService::Sent => return StepResult::Progress,
            NakService::Blocked => return StepResult::Blocked,
            NakService::Failed => return StepResult::Done,
            NakService::Nothing => {}
        }
    }
    if txn.file_offset >= txn.file_size {
        txn.role.send_params_mut().unwrap().sub = SendSub::Eof;
        return StepResult::Progress;
    }
    let offset = txn.file_offset;
    let len = (sys.cfg.outgoing_file_chunk_size as u64).min(txn.file_size - offset) as usize;
    let mut data = alloc::vec![0u8; len];
    if read_file_segment(sys.fs, txn, offset, &mut data).is_err() {
        filestore_fault(txn, sys);
        return StepResult::Done;
    }
    let header = outbound_header(txn, sys.cfg.local_eid);
    let payload = data.clone();
    match send_pdu(sys, header, PduPayload::FileData(FileDataPdu::new(offset, payload))) {
        Ok(()) => {
            // In-order data feeds the running checksum; retransmissions do
            // not go through here.
            txn.crc.digest(&data);
            txn.file_offset = offset + len as u64;
            sys.counters.sent.file_data_bytes += len as u64;
            if txn.file_offset >= txn.file_size {
                txn.role.send_params_mut().unwrap().sub = SendSub::Eof;
            }
            StepResult::Progress
        }
        Err(_) => StepResult::Blocked,
    }
}

fn step_eof<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) -> StepResult {
    let checksum = txn.crc.finalize();
    txn.flags.crc_calculated = true;
    let eof = EofPdu::new(txn.condition_code, checksum, txn.file_offset);
    let header = outbound_header(txn, sys.cfg.local_eid);
    let class1 = txn.state == TxnState::S1;
    match send_pdu(sys, header, PduPayload::Eof(eof)) {
        Ok(()) => {
            sys.user.eof_sent(&txn.transaction_id());
            if class1 {
                // No acknowledgement path exists, the transaction is over.
                reset_transaction(txn, sys, true);
            } else {
                let params = txn.role.send_params_mut().unwrap();
                params.sub = SendSub::WaitEofAck;
                params.ack_count = 0;
                txn.ack_timer = Timer::new(sys.cfg.ack_timer_seconds, sys.cfg.ticks_per_second);
                txn.flags.ack_timer_armed = true;
                txn.inactivity_timer =
                    Timer::new(sys.cfg.inactivity_timer_seconds, sys.cfg.ticks_per_second);
                sys.queues.move_txn(txn, QueueId::TxWait);
                if *sys.cur_tx == Some(txn.handle) {
                    *sys.cur_tx = None;
                }
            }
            StepResult::Done
        }
        Err(_) => {
            if class1 {
                // Class 1 has no retry channel, give up either way.
                reset_transaction(txn, sys, true);
                return StepResult::Done;
            }
            StepResult::Blocked
        }
    }
}

/// Service a pending NAK response: a deferred metadata re-send or the next
/// queued retransmission range.
fn service_nak_response<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) -> NakService {
    if txn
        .role
        .send_params()
        .map(|params| params.flags.metadata_needs_send)
        .unwrap_or(false)
    {
        let (source_name, dest_name) = sys.filenames(txn);
        let metadata = MetadataPdu::new(txn.file_size, source_name, dest_name);
        let header = outbound_header(txn, sys.cfg.local_eid);
        return match send_pdu(sys, header, PduPayload::Metadata(metadata)) {
            Ok(()) => {
                txn.role.send_params_mut().unwrap().flags.metadata_needs_send = false;
                NakService::Sent
            }
            Err(_) => NakService::Blocked,
        };
    }
    let Some(chunk) = txn.chunks.first() else {
        return NakService::Nothing;
    };
    let len = chunk.size.min(sys.cfg.outgoing_file_chunk_size as u64) as usize;
    let mut data: Vec<u8> = alloc::vec![0u8; len];
    if read_file_segment(sys.fs, txn, chunk.offset, &mut data).is_err() {
        filestore_fault(txn, sys);
        return NakService::Failed;
    }
    let header = outbound_header(txn, sys.cfg.local_eid);
    match send_pdu(
        sys,
        header,
        PduPayload::FileData(FileDataPdu::new(chunk.offset, data)),
    ) {
        Ok(()) => {
            txn.chunks.remove_from_first(len as u64);
            sys.counters.sent.file_data_bytes += len as u64;
            NakService::Sent
        }
        Err(_) => NakService::Blocked,
    }
}

/// Tick processing for transactions on the transmit wait queue.
pub(crate) fn tick_waiting<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
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
    let Some(sub) = txn.role.send_params().map(|params| params.sub) else {
        return;
    };
    match sub {
        SendSub::WaitEofAck => tick_wait_eof_ack(txn, sys),
        SendSub::WaitFin => {
            // FIN can only arrive after all repair requests were serviced.
            let _ = service_nak_response(txn, sys);
        }
        SendSub::SendFinAck => tick_send_fin_ack(txn, sys),
        _ => {}
    }
}

fn tick_wait_eof_ack<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
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
    let params = txn.role.send_params_mut().unwrap();
    params.ack_count += 1;
    if params.ack_count >= sys.cfg.ack_limit {
        declare_fault(txn, sys, ConditionCode::PositiveAckLimitReached);
        reset_transaction(txn, sys, true);
        return;
    }
    let eof = EofPdu::new(txn.condition_code, txn.crc.finalize(), txn.file_offset);
    let header = outbound_header(txn, sys.cfg.local_eid);
    if send_pdu(sys, header, PduPayload::Eof(eof)).is_ok() {
        txn.ack_timer = Timer::new(sys.cfg.ack_timer_seconds, sys.cfg.ticks_per_second);
    }
    // On backpressure the timer stays expired and the send is retried on the
    // next tick.
}

fn tick_send_fin_ack<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) {
    let fin = txn.role.send_params().unwrap().fin.unwrap_or(FinDisposition {
        condition_code: txn.condition_code,
        delivery_code: crate::pdu::DeliveryCode::Complete,
        file_status: crate::pdu::FileStatus::Unreported,
    });
    let ack = AckPdu::new(
        FileDirectiveType::FinishedPdu,
        fin.condition_code,
        TransactionStatus::Terminated,
    );
    let header = outbound_header(txn, sys.cfg.local_eid);
    if send_pdu(sys, header, PduPayload::Ack(ack)).is_ok() {
        // The transaction is only over once the FIN ACK actually went out.
        reset_transaction(txn, sys, true);
    }
}

/// Inbound PDU routed to a sending transaction.
pub(crate) fn dispatch_pdu<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    pdu: &crate::pdu::Pdu,
) {
    match &pdu.payload {
        PduPayload::Ack(ack) => handle_ack(txn, sys, ack),
        PduPayload::Finished(fin) => handle_fin(txn, sys, fin),
        PduPayload::Nak(nak) => handle_nak(txn, sys, nak),
        // File data and the receiver-directed directives can not be
        // processed by the sending role.
        _ => sys.counters.recv.errors += 1,
    }
}

fn handle_ack<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    ack: &AckPdu,
) {
    if txn.state == TxnState::S1 {
        // Class 1 maps no handler for acknowledgements.
        return;
    }
    let sub = txn.role.send_params().map(|params| params.sub);
    if sub == Some(SendSub::WaitEofAck) && ack.acked_directive == FileDirectiveType::EofPdu {
        txn.flags.ack_timer_armed = false;
        if txn.condition_code == ConditionCode::NoError && !txn.flags.canceled {
            txn.role.send_params_mut().unwrap().sub = SendSub::WaitFin;
        } else {
            // The acknowledged EOF carried an error, the closure ends here.
            reset_transaction(txn, sys, true);
        }
    } else {
        sys.counters.recv.errors += 1;
    }
}

fn handle_fin<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    fin: &crate::pdu::finished::FinishedPdu,
) {
    if txn.state == TxnState::S1 {
        // Class 1 maps no handler for the Finished PDU.
        return;
    }
    let Some(sub) = txn.role.send_params().map(|params| params.sub) else {
        return;
    };
    if sub < SendSub::WaitFin {
        // Early FIN before the file went out completely aborts the
        // transaction.
        sys.counters.recv.errors += 1;
        let cond = if fin.condition_code != ConditionCode::NoError {
            fin.condition_code
        } else {
            ConditionCode::CancelRequestReceived
        };
        declare_fault(txn, sys, cond);
        reset_transaction(txn, sys, true);
        return;
    }
    if fin.condition_code != ConditionCode::NoError
        && txn.condition_code == ConditionCode::NoError
    {
        txn.condition_code = fin.condition_code;
    }
    let params = txn.role.send_params_mut().unwrap();
    params.fin = Some(FinDisposition {
        condition_code: fin.condition_code,
        delivery_code: fin.delivery_code,
        file_status: fin.file_status,
    });
    params.sub = SendSub::SendFinAck;
    txn.flags.ack_timer_armed = false;
    // The FIN ACK goes out from tick processing, gated on transport buffer
    // availability.
}

fn handle_nak<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    nak: &crate::pdu::nak::NakPdu,
) {
    if txn.state == TxnState::S1 {
        // Class 1 maps no handler for NAKs.
        return;
    }
    for request in &nak.segment_requests {
        if request.is_metadata_request() {
            if let Some(params) = txn.role.send_params_mut() {
                params.flags.metadata_needs_send = true;
            }
        } else if request.start >= request.end || request.end > txn.file_size {
            // Malformed requests are counted but do not abort the
            // transaction.
            sys.counters.recv.nak_segment_errors += 1;
        } else {
            txn.chunks.add(request.start, request.end - request.start);
        }
    }
}

/// Cancel an outgoing transaction: force the sub-state to EOF so the normal
/// cycling emits the closing EOF with the cancel condition code.
pub(crate) fn cancel<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    _sys: &mut Sys<'_, Fs, Tp, U>,
) {
    if txn.flags.canceled {
        return;
    }
    txn.flags.canceled = true;
    if txn.condition_code == ConditionCode::NoError {
        txn.condition_code = ConditionCode::CancelRequestReceived;
    }
    if let Some(params) = txn.role.send_params_mut() {
        if params.sub < SendSub::Eof {
            params.sub = SendSub::Eof;
        }
    }
}

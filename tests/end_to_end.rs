//! End-to-end tests: two engines wired back to back over an observable
//! in-process bus, one acting as the file sender and one as the receiver.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use cfdp_engine::checksum::checksum_of;
use cfdp_engine::engine::{Engine, TransmitFileRequest};
use cfdp_engine::filestore::InMemoryFilestore;
use cfdp_engine::pdu::{
    ack::AckPdu, eof::EofPdu, file_data::FileDataPdu, metadata::MetadataPdu, ConditionCode,
    FileDirectiveType, Pdu, PduHeader, PduPayload, TransactionStatus, TransmissionMode,
};
use cfdp_engine::queue::QueueId;
use cfdp_engine::transport::{PduTransport, TransportError};
use cfdp_engine::user::NullUser;
use cfdp_engine::{EngineConfig, EntityId};

const SENDER_EID: EntityId = EntityId(1);
const RECEIVER_EID: EntityId = EntityId(2);

/// Shared state of the test bus between the two engines.
#[derive(Default)]
struct BusState {
    to_a: VecDeque<Pdu>,
    to_b: VecDeque<Pdu>,
    /// Everything side A successfully handed to the bus.
    log_a: Vec<Pdu>,
    /// Everything side B successfully handed to the bus.
    log_b: Vec<Pdu>,
    /// Drop A-to-B file data whose offset falls into this range. Cleared
    /// when an EOF passes, so retransmissions get through.
    drop_fd_to_b: Option<(u64, u64)>,
    /// Drop all A-to-B file data, permanently.
    drop_all_fd_to_b: bool,
    /// Bound on queued A-to-B PDUs, to exercise backpressure.
    capacity_to_b: Option<usize>,
}

#[derive(Clone)]
struct BusEnd {
    state: Rc<RefCell<BusState>>,
    side_a: bool,
}

fn bus() -> (BusEnd, BusEnd, Rc<RefCell<BusState>>) {
    let state = Rc::new(RefCell::new(BusState::default()));
    (
        BusEnd {
            state: state.clone(),
            side_a: true,
        },
        BusEnd {
            state: state.clone(),
            side_a: false,
        },
        state,
    )
}

impl PduTransport for BusEnd {
    fn try_recv(&mut self, _channel: u8) -> Option<Pdu> {
        let mut state = self.state.borrow_mut();
        if self.side_a {
            state.to_a.pop_front()
        } else {
            state.to_b.pop_front()
        }
    }

    fn try_send(&mut self, _channel: u8, pdu: Pdu) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if self.side_a {
            if let Some(capacity) = state.capacity_to_b {
                if state.to_b.len() >= capacity {
                    return Err(TransportError::Backpressure);
                }
            }
            state.log_a.push(pdu.clone());
            let mut dropped = false;
            if let PduPayload::FileData(fd) = &pdu.payload {
                if state.drop_all_fd_to_b {
                    dropped = true;
                } else if let Some((lo, hi)) = state.drop_fd_to_b {
                    dropped = fd.offset >= lo && fd.offset < hi;
                }
            }
            if matches!(pdu.payload, PduPayload::Eof(_)) {
                state.drop_fd_to_b = None;
            }
            if !dropped {
                state.to_b.push_back(pdu);
            }
        } else {
            state.log_b.push(pdu.clone());
            state.to_a.push_back(pdu);
        }
        Ok(())
    }
}

type TestEngine = Engine<InMemoryFilestore, BusEnd, NullUser>;

fn test_config(local: EntityId) -> EngineConfig {
    let mut cfg = EngineConfig::new_with_default_values(local);
    cfg.ticks_per_second = 1;
    cfg.ack_timer_seconds = 2;
    cfg.nak_timer_seconds = 2;
    cfg.inactivity_timer_seconds = 30;
    cfg.outgoing_file_chunk_size = 500;
    cfg
}

fn test_engine(cfg: EngineConfig, transport: BusEnd) -> TestEngine {
    Engine::new(cfg, InMemoryFilestore::new(), transport, NullUser).unwrap()
}

fn engine_pair() -> (TestEngine, TestEngine, Rc<RefCell<BusState>>) {
    let (end_a, end_b, state) = bus();
    (
        test_engine(test_config(SENDER_EID), end_a),
        test_engine(test_config(RECEIVER_EID), end_b),
        state,
    )
}

fn run(a: &mut TestEngine, b: &mut TestEngine, cycles: usize) {
    for _ in 0..cycles {
        a.cycle();
        b.cycle();
    }
}

fn test_file(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn send_request(source: &str, dest: &str, mode: TransmissionMode) -> TransmitFileRequest {
    TransmitFileRequest {
        source_filename: source.to_string(),
        dest_filename: dest.to_string(),
        mode,
        keep: true,
        channel: 0,
        priority: 10,
        dest_eid: RECEIVER_EID,
    }
}

fn history_lines(engine: &TestEngine) -> String {
    let mut out = String::new();
    engine.write_queue(0, QueueId::Hist, &mut out).unwrap();
    out
}

fn all_slots_free(engine: &TestEngine) -> bool {
    engine.queue_len(0, QueueId::Free) == engine.config().num_transactions_per_channel
}

#[test]
fn class1_transfer_pdu_census_and_file_integrity() {
    let (mut a, mut b, state) = engine_pair();
    let data = test_file(2300);
    a.filestore_mut().insert_file("src.bin", &data);
    a.transmit_file(send_request("src.bin", "dst.bin", TransmissionMode::Unacknowledged))
        .unwrap();
    run(&mut a, &mut b, 10);

    // Exactly one metadata PDU, ceil(2300 / 500) file data PDUs, one EOF.
    let state_ref = state.borrow();
    let log = &state_ref.log_a;
    let md = log
        .iter()
        .filter(|p| matches!(p.payload, PduPayload::Metadata(_)))
        .count();
    let fd = log
        .iter()
        .filter(|p| matches!(p.payload, PduPayload::FileData(_)))
        .count();
    let eof = log
        .iter()
        .filter(|p| matches!(p.payload, PduPayload::Eof(_)))
        .count();
    assert_eq!((md, fd, eof), (1, 5, 1));
    assert_eq!(log.len(), 7);
    // Class 1 without closure: the receiver stays quiet.
    assert!(state.borrow().log_b.is_empty());

    assert_eq!(b.filestore().file_data("dst.bin").unwrap(), &data[..]);
    assert!(all_slots_free(&a));
    assert!(all_slots_free(&b));
    assert!(history_lines(&a).contains("NoError"));
    assert!(history_lines(&b).contains("NoError"));
}

#[test]
fn class2_transfer_without_loss_needs_no_naks() {
    let (mut a, mut b, state) = engine_pair();
    let data = test_file(3000);
    a.filestore_mut().insert_file("src.bin", &data);
    a.transmit_file(send_request("src.bin", "dst.bin", TransmissionMode::Acknowledged))
        .unwrap();
    run(&mut a, &mut b, 20);

    assert_eq!(b.filestore().file_data("dst.bin").unwrap(), &data[..]);
    assert_eq!(b.counters(0).unwrap().sent.naks, 0);
    let naks = state
        .borrow()
        .log_b
        .iter()
        .filter(|p| matches!(p.payload, PduPayload::Nak(_)))
        .count();
    assert_eq!(naks, 0);
    assert!(all_slots_free(&a));
    assert!(all_slots_free(&b));
    assert!(history_lines(&a).contains("NoError"));
    assert!(history_lines(&b).contains("NoError"));
}

#[test]
fn class2_gap_repair_sends_exactly_one_nak() {
    let (mut a, mut b, state) = engine_pair();
    let data = test_file(3000);
    a.filestore_mut().insert_file("src.bin", &data);
    // First transmission of the byte range [1000, 2000) is lost.
    state.borrow_mut().drop_fd_to_b = Some((1000, 2000));
    a.transmit_file(send_request("src.bin", "dst.bin", TransmissionMode::Acknowledged))
        .unwrap();
    run(&mut a, &mut b, 30);

    let naks: Vec<Pdu> = state
        .borrow()
        .log_b
        .iter()
        .filter(|p| matches!(p.payload, PduPayload::Nak(_)))
        .cloned()
        .collect();
    assert_eq!(naks.len(), 1, "expected exactly one NAK round");
    let PduPayload::Nak(nak) = &naks[0].payload else {
        unreachable!();
    };
    assert_eq!(nak.segment_requests.len(), 1);
    assert_eq!(
        (nak.segment_requests[0].start, nak.segment_requests[0].end),
        (1000, 2000)
    );

    assert_eq!(b.filestore().file_data("dst.bin").unwrap(), &data[..]);
    assert!(all_slots_free(&a));
    assert!(all_slots_free(&b));
    assert!(history_lines(&a).contains("NoError"));
    assert!(history_lines(&b).contains("NoError"));
    assert_eq!(b.counters(0).unwrap().fault.crc_mismatch, 0);
}

#[test]
fn receiver_starved_of_repairs_terminates_with_nak_limit() {
    let (mut a, mut b, state) = engine_pair();
    let data = test_file(1500);
    a.filestore_mut().insert_file("src.bin", &data);
    state.borrow_mut().drop_all_fd_to_b = true;
    a.transmit_file(send_request("src.bin", "dst.bin", TransmissionMode::Acknowledged))
        .unwrap();
    run(&mut a, &mut b, 60);

    let nak_limit = b.config().nak_limit as u64;
    assert_eq!(b.counters(0).unwrap().sent.naks, nak_limit);
    assert_eq!(b.counters(0).unwrap().fault.nak_limit, 1);
    assert!(history_lines(&b).contains("NakLimitReached"));
    // The sender learns the outcome through the Finished PDU.
    assert!(history_lines(&a).contains("NakLimitReached"));
    // The incomplete file does not survive.
    assert!(b.filestore().file_data("dst.bin").is_none());
    assert!(all_slots_free(&a));
    assert!(all_slots_free(&b));
}

#[test]
fn class2_transfer_survives_transport_backpressure() {
    let (mut a, mut b, state) = engine_pair();
    let data = test_file(3000);
    a.filestore_mut().insert_file("src.bin", &data);
    state.borrow_mut().capacity_to_b = Some(2);
    a.transmit_file(send_request("src.bin", "dst.bin", TransmissionMode::Acknowledged))
        .unwrap();
    run(&mut a, &mut b, 40);

    assert_eq!(b.filestore().file_data("dst.bin").unwrap(), &data[..]);
    // Nothing was lost, so nothing was sent twice either.
    let fd = state
        .borrow()
        .log_a
        .iter()
        .filter(|p| matches!(p.payload, PduPayload::FileData(_)))
        .count();
    assert_eq!(fd, 6);
    assert!(all_slots_free(&a));
    assert!(all_slots_free(&b));
    assert!(history_lines(&a).contains("NoError"));
}

#[test]
fn cancel_mid_transfer_closes_with_cancel_condition() {
    let (end_a, end_b, _state) = bus();
    let mut cfg_a = test_config(SENDER_EID);
    // One PDU per cycle keeps the transfer going long enough to cancel it.
    cfg_a.channels[0].outgoing_messages_per_wakeup = 1;
    let mut a = test_engine(cfg_a, end_a);
    let mut b = test_engine(test_config(RECEIVER_EID), end_b);
    let data = test_file(3000);
    a.filestore_mut().insert_file("src.bin", &data);
    let id = a
        .transmit_file(send_request("src.bin", "dst.bin", TransmissionMode::Acknowledged))
        .unwrap();
    run(&mut a, &mut b, 3);
    let handle = a.find_transaction(0, id.seq_num, SENDER_EID).unwrap();
    assert!(a.cancel(handle));
    run(&mut a, &mut b, 10);

    assert!(history_lines(&a).contains("CancelRequestReceived"));
    assert!(history_lines(&b).contains("CancelRequestReceived"));
    // The receiver does not keep the partial delivery.
    assert!(b.filestore().file_data("dst.bin").is_none());
    assert!(all_slots_free(&a));
    assert!(all_slots_free(&b));
}

#[test]
fn class2_metadata_after_file_data_recovers_through_temp_file() {
    let (mut injector, end_b, state) = bus();
    let mut b = test_engine(test_config(RECEIVER_EID), end_b);
    let data = test_file(1000);
    let header = PduHeader::new(EntityId(5), RECEIVER_EID, 9, TransmissionMode::Acknowledged);

    // File data ahead of the metadata lands in a temporary file.
    injector
        .try_send(
            0,
            Pdu::new(
                header,
                PduPayload::FileData(FileDataPdu::new(0, data[..500].to_vec())),
            ),
        )
        .unwrap();
    b.cycle();
    let temp_name = format!("{}5_9", b.config().temp_file_prefix);
    assert!(b.filestore().file_data(&temp_name).is_some());

    injector
        .try_send(
            0,
            Pdu::new(
                header,
                PduPayload::FileData(FileDataPdu::new(500, data[500..].to_vec())),
            ),
        )
        .unwrap();
    injector
        .try_send(
            0,
            Pdu::new(
                header,
                PduPayload::Metadata(MetadataPdu::new(1000, "src.bin", "final.bin")),
            ),
        )
        .unwrap();
    b.cycle();
    // Metadata renames the temporary file to its real destination.
    assert!(b.filestore().file_data(&temp_name).is_none());
    assert!(b.filestore().file_data("final.bin").is_some());

    injector
        .try_send(
            0,
            Pdu::new(
                header,
                PduPayload::Eof(EofPdu::new_no_error(checksum_of(&data), 1000)),
            ),
        )
        .unwrap();
    b.cycle();
    b.cycle();
    // The receiver acknowledged the EOF and finished the delivery.
    let sent: Vec<Pdu> = state.borrow().log_b.clone();
    assert!(sent
        .iter()
        .any(|p| matches!(p.payload, PduPayload::Ack(_))));
    let fins: Vec<&Pdu> = sent
        .iter()
        .filter(|p| matches!(p.payload, PduPayload::Finished(_)))
        .collect();
    assert_eq!(fins.len(), 1);
    let PduPayload::Finished(fin) = &fins[0].payload else {
        unreachable!();
    };
    assert_eq!(fin.condition_code, ConditionCode::NoError);

    // Closing FIN ACK ends the transaction.
    injector
        .try_send(
            0,
            Pdu::new(
                header,
                PduPayload::Ack(AckPdu::new(
                    FileDirectiveType::FinishedPdu,
                    ConditionCode::NoError,
                    TransactionStatus::Terminated,
                )),
            ),
        )
        .unwrap();
    b.cycle();
    assert_eq!(b.filestore().file_data("final.bin").unwrap(), &data[..]);
    assert!(all_slots_free(&b));
    assert!(history_lines(&b).contains("final.bin"));
    assert!(history_lines(&b).contains("NoError"));
}

#[test]
fn stalled_receive_transaction_times_out_with_inactivity() {
    let (mut injector, end_b, _state) = bus();
    let mut cfg = test_config(RECEIVER_EID);
    cfg.inactivity_timer_seconds = 5;
    let mut b = test_engine(cfg, end_b);
    let header = PduHeader::new(EntityId(5), RECEIVER_EID, 1, TransmissionMode::Acknowledged);
    injector
        .try_send(
            0,
            Pdu::new(
                header,
                PduPayload::Metadata(MetadataPdu::new(1000, "src.bin", "dst.bin")),
            ),
        )
        .unwrap();
    for _ in 0..10 {
        b.cycle();
    }
    assert_eq!(b.counters(0).unwrap().fault.inactivity, 1);
    assert!(history_lines(&b).contains("InactivityDetected"));
    assert!(b.filestore().file_data("dst.bin").is_none());
    assert!(all_slots_free(&b));
}

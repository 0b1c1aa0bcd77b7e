//! The transaction engine: channels, resource pools and the cycle loop.
//!
//! [Engine] owns every pool (transactions, histories, per-transaction chunk
//! trackers) and its three collaborators. All protocol work happens inside
//! [Engine::cycle], which the surrounding application invokes once per
//! scheduler wakeup: a bounded number of inbound PDUs is dispatched per
//! channel, the single active outgoing transaction of each channel makes
//! progress, and a tick pass over the receive and transmit-wait queues
//! drives timers and deferred ACK/NAK/FIN emission.
//!
//! There is no global state: everything lives in the engine object passed
//! by reference into every operation.
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::filestore::{FilestoreError, VirtualFilestore};
use crate::pdu::{
    ConditionCode, Pdu, PduHeader, PduPayload, PacketTarget, TransmissionMode,
};
use crate::queue::{HandleList, QueueId};
use crate::seq_count::{SeqCountProvider, SeqCountProviderSimple};
use crate::timer::Timer;
use crate::transaction::{
    History, HistoryHandle, RecvParams, RoleData, SendFlags, SendParams, Transaction, TxnHandle,
    TxnState,
};
use crate::transport::{PduTransport, TransportError};
use crate::user::TransferUser;
use crate::{recv, send, ChannelConfig, ConfigError, Direction, EngineConfig, EntityId,
    TransactionId, TransactionSeqNum};

/// Counters over inbound PDU processing.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecvCounters {
    pub pdus: u64,
    /// PDUs which could not be processed in the state they arrived in.
    pub errors: u64,
    /// PDUs for unknown transactions which only the other role could start.
    pub spurious: u64,
    /// PDUs dropped because no transaction slot was available.
    pub dropped: u64,
    /// Malformed NAK segment requests.
    pub nak_segment_errors: u64,
}

/// Counters over outbound PDU emission.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SentCounters {
    pub pdus: u64,
    pub file_data_bytes: u64,
    pub naks: u64,
}

/// Fault tallies, one per terminating condition class.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FaultCounters {
    pub ack_limit: u64,
    pub nak_limit: u64,
    pub inactivity: u64,
    pub filestore: u64,
    pub crc_mismatch: u64,
    pub size_mismatch: u64,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelCounters {
    pub recv: RecvCounters,
    pub sent: SentCounters,
    pub fault: FaultCounters,
}

/// The per-channel queue set.
#[derive(Debug)]
pub(crate) struct ChannelQueues {
    pub(crate) pend: HandleList<TxnHandle>,
    pub(crate) tx_active: HandleList<TxnHandle>,
    pub(crate) tx_wait: HandleList<TxnHandle>,
    pub(crate) rx: HandleList<TxnHandle>,
    pub(crate) free: HandleList<TxnHandle>,
    pub(crate) hist: HandleList<HistoryHandle>,
    pub(crate) hist_free: HandleList<HistoryHandle>,
}

impl ChannelQueues {
    fn new(num_transactions: usize, num_histories: usize) -> Self {
        Self {
            pend: HandleList::with_capacity(num_transactions),
            tx_active: HandleList::with_capacity(num_transactions),
            tx_wait: HandleList::with_capacity(num_transactions),
            rx: HandleList::with_capacity(num_transactions),
            free: HandleList::with_capacity(num_transactions),
            hist: HandleList::with_capacity(num_histories),
            hist_free: HandleList::with_capacity(num_histories),
        }
    }

    pub(crate) fn txn_list(&self, queue: QueueId) -> &HandleList<TxnHandle> {
        match queue {
            QueueId::Pend => &self.pend,
            QueueId::TxActive => &self.tx_active,
            QueueId::TxWait => &self.tx_wait,
            QueueId::Rx => &self.rx,
            QueueId::Free => &self.free,
            _ => unreachable!("history queue holds no transactions"),
        }
    }

    pub(crate) fn txn_list_mut(&mut self, queue: QueueId) -> &mut HandleList<TxnHandle> {
        match queue {
            QueueId::Pend => &mut self.pend,
            QueueId::TxActive => &mut self.tx_active,
            QueueId::TxWait => &mut self.tx_wait,
            QueueId::Rx => &mut self.rx,
            QueueId::Free => &mut self.free,
            _ => unreachable!("history queue holds no transactions"),
        }
    }

    /// Move a transaction to another queue, keeping its membership field in
    /// sync. A transaction is on exactly one queue at all times.
    pub(crate) fn move_txn<F>(&mut self, txn: &mut Transaction<F>, to: QueueId) {
        if txn.queue == to {
            return;
        }
        let removed = self.txn_list_mut(txn.queue).remove(txn.handle);
        debug_assert!(removed);
        self.txn_list_mut(to).push_back(txn.handle);
        txn.queue = to;
    }

    fn outgoing_count(&self) -> usize {
        self.pend.len() + self.tx_active.len() + self.tx_wait.len()
    }
}

/// One directory playback in progress.
#[derive(Debug, Clone)]
struct PlaybackSlot {
    pending: VecDeque<String>,
    request: PlaybackRequest,
}

/// Per-channel state.
#[derive(Debug)]
struct Channel {
    queues: ChannelQueues,
    counters: ChannelCounters,
    /// The single transaction currently allowed to emit file data.
    cur_tx: Option<TxnHandle>,
    playback: Vec<Option<PlaybackSlot>>,
}

/// Admission request for one outgoing file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransmitFileRequest {
    pub source_filename: String,
    pub dest_filename: String,
    pub mode: TransmissionMode,
    /// Keep the source file after successful transmission.
    pub keep: bool,
    pub channel: u8,
    /// Lower values are served first.
    pub priority: u8,
    pub dest_eid: EntityId,
}

/// Admission request for playing back a whole directory.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlaybackRequest {
    pub source_dir: String,
    pub dest_dir: String,
    pub mode: TransmissionMode,
    pub keep: bool,
    pub channel: u8,
    pub priority: u8,
    pub dest_eid: EntityId,
}

/// Errors of the admission interfaces.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("channel {0} out of range")]
    InvalidChannel(u8),
    #[error("engine is disabled")]
    Disabled,
    #[error("concurrent transmit limit reached")]
    TxLimitReached,
    #[error("no free transaction slot")]
    NoFreeTransaction,
    #[error("no free history slot")]
    NoFreeHistory,
    #[error("all playback slots are busy")]
    PlaybackSlotsBusy,
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
}

/// Borrowed view of one channel's surroundings handed into the state
/// machine functions.
pub(crate) struct Sys<'a, Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser> {
    pub(crate) cfg: &'a EngineConfig,
    pub(crate) chan: u8,
    pub(crate) fs: &'a mut Fs,
    pub(crate) transport: &'a mut Tp,
    pub(crate) user: &'a mut U,
    pub(crate) histories: &'a mut [History],
    pub(crate) queues: &'a mut ChannelQueues,
    pub(crate) counters: &'a mut ChannelCounters,
    pub(crate) cur_tx: &'a mut Option<TxnHandle>,
}

impl<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser> Sys<'_, Fs, Tp, U> {
    pub(crate) fn channel_config(&self) -> &ChannelConfig {
        &self.cfg.channels[self.chan as usize]
    }

    /// Source and destination file names of a transaction, from its history
    /// record.
    pub(crate) fn filenames(&self, txn: &Transaction<Fs::File>) -> (String, String) {
        let history = &self.histories[txn.history.unwrap().index()];
        (
            history.source_filename.clone(),
            history.dest_filename.clone(),
        )
    }
}

/// Build the header for a PDU emitted by this transaction.
///
/// Every PDU of a transaction carries the transaction's source entity and
/// sequence number; the destination field names the entity receiving the
/// file.
pub(crate) fn outbound_header<F>(txn: &Transaction<F>, local_eid: EntityId) -> PduHeader {
    let dest_id = match txn.direction() {
        Direction::Tx => txn.peer_id,
        Direction::Rx => local_eid,
    };
    PduHeader::new(txn.source_id, dest_id, txn.seq_num, txn.mode)
}

/// Hand one PDU to the transport, keeping the sent counter in sync.
pub(crate) fn send_pdu<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    sys: &mut Sys<'_, Fs, Tp, U>,
    header: PduHeader,
    payload: PduPayload,
) -> Result<(), TransportError> {
    sys.transport.try_send(sys.chan, Pdu::new(header, payload))?;
    sys.counters.sent.pdus += 1;
    Ok(())
}

/// Read exactly `buf.len()` bytes at `offset`, seeking only when the cached
/// file position does not already match.
pub(crate) fn read_file_segment<Fs: VirtualFilestore>(
    fs: &mut Fs,
    txn: &mut Transaction<Fs::File>,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), FilestoreError> {
    let file = txn.file.as_mut().ok_or(FilestoreError::FileDoesNotExist)?;
    if txn.cached_position != offset {
        fs.seek(file, offset)?;
    }
    // A partially reachable position counts as a failed read.
    txn.cached_position = offset;
    let mut done = 0;
    while done < buf.len() {
        let read = fs.read(file, &mut buf[done..])?;
        if read == 0 {
            return Err(FilestoreError::Other);
        }
        done += read;
        txn.cached_position += read as u64;
    }
    Ok(())
}

/// Write a whole segment at `offset`, seeking only when necessary.
pub(crate) fn write_file_segment<Fs: VirtualFilestore>(
    fs: &mut Fs,
    txn: &mut Transaction<Fs::File>,
    offset: u64,
    data: &[u8],
) -> Result<(), FilestoreError> {
    let file = txn.file.as_mut().ok_or(FilestoreError::FileDoesNotExist)?;
    if txn.cached_position != offset {
        fs.seek(file, offset)?;
    }
    txn.cached_position = offset;
    fs.write(file, data)?;
    txn.cached_position += data.len() as u64;
    Ok(())
}

/// Record a fault against a transaction: condition code, fault counter and
/// user indication. Whether the transaction resets or keeps winding down is
/// decided by the caller.
pub(crate) fn declare_fault<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    cond: ConditionCode,
) {
    txn.condition_code = cond;
    match cond {
        ConditionCode::PositiveAckLimitReached => sys.counters.fault.ack_limit += 1,
        ConditionCode::NakLimitReached => sys.counters.fault.nak_limit += 1,
        ConditionCode::InactivityDetected => sys.counters.fault.inactivity += 1,
        ConditionCode::FilestoreRejection => sys.counters.fault.filestore += 1,
        ConditionCode::FileChecksumFailure => sys.counters.fault.crc_mismatch += 1,
        ConditionCode::FileSizeError => sys.counters.fault.size_mismatch += 1,
        _ => {}
    }
    if cond == ConditionCode::InactivityDetected {
        if let RoleData::Recv(params) = &mut txn.role {
            params.flags.inactivity_fired = true;
        }
    }
    sys.user.fault(&txn.transaction_id(), cond, txn.progress());
}

/// Shorthand for the common "file I/O failed, give up" path.
pub(crate) fn filestore_fault<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
) {
    declare_fault(txn, sys, ConditionCode::FilestoreRejection);
    reset_transaction(txn, sys, true);
}

/// Wind a transaction down completely: close and dispose the file, finalize
/// and queue the history record, clear the slot and return it to the free
/// pool.
pub(crate) fn reset_transaction<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser>(
    txn: &mut Transaction<Fs::File>,
    sys: &mut Sys<'_, Fs, Tp, U>,
    keep_history: bool,
) {
    if let Some(file) = txn.file.take() {
        let _ = sys.fs.close(file);
    }
    if let Some(history_handle) = txn.history {
        let (source_name, dest_name) = {
            let history = &sys.histories[history_handle.index()];
            (
                history.source_filename.clone(),
                history.dest_filename.clone(),
            )
        };
        match txn.direction() {
            Direction::Rx => {
                // An incomplete delivery does not leave a partial file
                // behind.
                if txn.condition_code != ConditionCode::NoError && !dest_name.is_empty() {
                    let _ = sys.fs.remove(&dest_name);
                }
            }
            Direction::Tx => {
                let keep = txn
                    .role
                    .send_params()
                    .map(|params| params.keep)
                    .unwrap_or(true);
                if txn.condition_code == ConditionCode::NoError
                    && !keep
                    && !source_name.is_empty()
                {
                    let _ = sys.fs.remove(&source_name);
                }
            }
        }
    }
    if let Some(history_handle) = txn.history.take() {
        sys.histories[history_handle.index()].condition_code = txn.condition_code;
        if keep_history {
            sys.queues.hist.push_back(history_handle);
            sys.user
                .transaction_finished(&sys.histories[history_handle.index()]);
        } else {
            sys.queues.hist_free.push_back(history_handle);
        }
    }
    if *sys.cur_tx == Some(txn.handle) {
        *sys.cur_tx = None;
    }
    sys.queues.move_txn(txn, QueueId::Free);
    txn.clear();
}

fn alloc_history(queues: &mut ChannelQueues) -> Option<HistoryHandle> {
    // Recycle the oldest retained record when the free pool is dry.
    queues.hist_free.pop_front().or_else(|| queues.hist.pop_front())
}

/// The CFDP transaction engine.
pub struct Engine<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser> {
    cfg: EngineConfig,
    fs: Fs,
    transport: Tp,
    user: U,
    transactions: Vec<Transaction<Fs::File>>,
    histories: Vec<History>,
    channels: Vec<Channel>,
    seq_counter: SeqCountProviderSimple,
    enabled: bool,
}

impl<Fs: VirtualFilestore, Tp: PduTransport, U: TransferUser> Engine<Fs, Tp, U> {
    /// Validate the configuration and allocate every pool. This is the only
    /// place the engine allocates.
    pub fn new(cfg: EngineConfig, fs: Fs, transport: Tp, user: U) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let num_channels = cfg.channels.len();
        let txns_per_channel = cfg.num_transactions_per_channel;
        let hists_per_channel = txns_per_channel + cfg.num_histories_per_channel;
        let mut transactions = Vec::with_capacity(num_channels * txns_per_channel);
        let mut histories = Vec::with_capacity(num_channels * hists_per_channel);
        let mut channels = Vec::with_capacity(num_channels);
        for chan in 0..num_channels {
            let mut queues = ChannelQueues::new(txns_per_channel, hists_per_channel);
            for _ in 0..txns_per_channel {
                let handle = TxnHandle::new(transactions.len() as u16);
                transactions.push(Transaction::new_free_slot(
                    handle,
                    chan as u8,
                    cfg.max_chunks_per_transaction,
                ));
                queues.free.push_back(handle);
            }
            for _ in 0..hists_per_channel {
                let handle = HistoryHandle::new(histories.len() as u16);
                histories.push(History::default());
                queues.hist_free.push_back(handle);
            }
            channels.push(Channel {
                queues,
                counters: ChannelCounters::default(),
                cur_tx: None,
                playback: (0..cfg.channels[chan].num_playback_slots)
                    .map(|_| None)
                    .collect(),
            });
        }
        Ok(Self {
            cfg,
            fs,
            transport,
            user,
            transactions,
            histories,
            channels,
            seq_counter: SeqCountProviderSimple::new(),
            enabled: true,
        })
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    #[inline]
    pub fn local_eid(&self) -> EntityId {
        self.cfg.local_eid
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn counters(&self, channel: u8) -> Option<&ChannelCounters> {
        self.channels.get(channel as usize).map(|ch| &ch.counters)
    }

    pub fn filestore(&self) -> &Fs {
        &self.fs
    }

    pub fn filestore_mut(&mut self) -> &mut Fs {
        &mut self.fs
    }

    pub fn user(&self) -> &U {
        &self.user
    }

    pub fn transaction(&self, handle: TxnHandle) -> Option<&Transaction<Fs::File>> {
        self.transactions.get(handle.index())
    }

    pub fn queue_len(&self, channel: u8, queue: QueueId) -> usize {
        let Some(ch) = self.channels.get(channel as usize) else {
            return 0;
        };
        match queue {
            QueueId::Hist => ch.queues.hist.len(),
            QueueId::HistFree => ch.queues.hist_free.len(),
            _ => ch.queues.txn_list(queue).len(),
        }
    }

    /// Run one engine cycle. Invoked once per scheduler wakeup.
    pub fn cycle(&mut self) {
        if !self.enabled {
            return;
        }
        for chan in 0..self.channels.len() {
            self.process_inbound(chan);
            self.cycle_playback(chan);
            self.cycle_tx(chan);
            self.tick_transactions(chan);
        }
    }

    /// Abandon every active transaction and stop cycling.
    pub fn disable(&mut self) {
        for chan in 0..self.channels.len() {
            for queue in [QueueId::Rx, QueueId::Pend, QueueId::TxActive, QueueId::TxWait] {
                for handle in self.channels[chan].queues.txn_list(queue).snapshot() {
                    self.abandon(handle);
                }
            }
        }
        self.enabled = false;
    }

    /// Admit a new outgoing file transfer.
    pub fn transmit_file(
        &mut self,
        request: TransmitFileRequest,
    ) -> Result<TransactionId, RequestError> {
        self.transmit_file_internal(request, true)
    }

    /// Admit a directory playback: every plain file below `source_dir` is
    /// sent to `dest_dir` on the peer, as transmit capacity frees up.
    pub fn playback_directory(&mut self, request: PlaybackRequest) -> Result<(), RequestError> {
        if !self.enabled {
            return Err(RequestError::Disabled);
        }
        let chan = request.channel as usize;
        if chan >= self.channels.len() {
            return Err(RequestError::InvalidChannel(request.channel));
        }
        let slot_index = self.channels[chan]
            .playback
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(RequestError::PlaybackSlotsBusy)?;
        let mut names = Vec::new();
        self.fs.list_directory(&request.source_dir, &mut names)?;
        self.channels[chan].playback[slot_index] = Some(PlaybackSlot {
            pending: names.into_iter().collect(),
            request,
        });
        Ok(())
    }

    /// Cooperatively cancel a transaction: flags and condition code change,
    /// normal state machine advancement winds the transaction down.
    pub fn cancel(&mut self, handle: TxnHandle) -> bool {
        let Some(txn) = self.transactions.get(handle.index()) else {
            return false;
        };
        let state = txn.state;
        let chan = txn.channel as usize;
        match state {
            TxnState::Idle => false,
            TxnState::S1 | TxnState::S2 => {
                let (txn, mut sys) = self.split_borrow(chan, handle);
                send::cancel(txn, &mut sys);
                true
            }
            _ => {
                let (txn, mut sys) = self.split_borrow(chan, handle);
                recv::cancel(txn, &mut sys);
                true
            }
        }
    }

    /// Forced reset without protocol closure.
    pub fn abandon(&mut self, handle: TxnHandle) -> bool {
        let Some(txn) = self.transactions.get(handle.index()) else {
            return false;
        };
        if txn.state == TxnState::Idle {
            return false;
        }
        let chan = txn.channel as usize;
        let (txn, mut sys) = self.split_borrow(chan, handle);
        reset_transaction(txn, &mut sys, true);
        true
    }

    /// Freeze a transaction: timers and emission stop until [Engine::resume].
    pub fn suspend(&mut self, handle: TxnHandle) -> bool {
        match self.transactions.get_mut(handle.index()) {
            Some(txn) if txn.state != TxnState::Idle => {
                txn.flags.suspended = true;
                true
            }
            _ => false,
        }
    }

    pub fn resume(&mut self, handle: TxnHandle) -> bool {
        match self.transactions.get_mut(handle.index()) {
            Some(txn) if txn.state != TxnState::Idle => {
                txn.flags.suspended = false;
                true
            }
            _ => false,
        }
    }

    /// Look a transaction up by its protocol identity.
    pub fn find_transaction(
        &self,
        channel: u8,
        seq_num: TransactionSeqNum,
        source_id: EntityId,
    ) -> Option<TxnHandle> {
        let ch = self.channels.get(channel as usize)?;
        for queue in [QueueId::Rx, QueueId::Pend, QueueId::TxActive, QueueId::TxWait] {
            for handle in ch.queues.txn_list(queue).iter() {
                let txn = &self.transactions[handle.index()];
                if txn.seq_num == seq_num && txn.source_id == source_id {
                    return Some(handle);
                }
            }
        }
        None
    }

    /// Serialize the contents of a queue to a byte sink, one fixed-format
    /// line per entry: sequence, direction, peer, condition code, source and
    /// destination file names.
    pub fn write_queue(
        &self,
        channel: u8,
        queue: QueueId,
        sink: &mut impl fmt::Write,
    ) -> fmt::Result {
        let Some(ch) = self.channels.get(channel as usize) else {
            return Ok(());
        };
        match queue {
            QueueId::Hist => {
                for handle in ch.queues.hist.iter() {
                    self.histories[handle.index()].write_status_line(sink)?;
                }
            }
            QueueId::HistFree | QueueId::Free => {}
            _ => {
                for handle in ch.queues.txn_list(queue).iter() {
                    let txn = &self.transactions[handle.index()];
                    let Some(history_handle) = txn.history else {
                        continue;
                    };
                    let mut line = self.histories[history_handle.index()].clone();
                    line.condition_code = txn.condition_code;
                    line.write_status_line(sink)?;
                }
            }
        }
        Ok(())
    }

    fn transmit_file_internal(
        &mut self,
        request: TransmitFileRequest,
        commanded: bool,
    ) -> Result<TransactionId, RequestError> {
        if !self.enabled {
            return Err(RequestError::Disabled);
        }
        let chan = request.channel as usize;
        if chan >= self.channels.len() {
            return Err(RequestError::InvalidChannel(request.channel));
        }
        if self.channels[chan].queues.outgoing_count()
            >= self.cfg.channels[chan].max_concurrent_tx
        {
            return Err(RequestError::TxLimitReached);
        }
        let Some(handle) = self.channels[chan].queues.free.pop_front() else {
            return Err(RequestError::NoFreeTransaction);
        };
        let Some(history_handle) = alloc_history(&mut self.channels[chan].queues) else {
            self.channels[chan].queues.free.push_front(handle);
            return Err(RequestError::NoFreeHistory);
        };
        let seq_num = self.seq_counter.get_and_increment();
        let local_eid = self.cfg.local_eid;

        let history = &mut self.histories[history_handle.index()];
        history.seq_num = seq_num;
        history.source_id = local_eid;
        history.peer_id = request.dest_eid;
        history.direction = Direction::Tx;
        history.condition_code = ConditionCode::NoError;
        history.source_filename.clone_from(&request.source_filename);
        history.dest_filename.clone_from(&request.dest_filename);

        let txn = &mut self.transactions[handle.index()];
        txn.source_id = local_eid;
        txn.peer_id = request.dest_eid;
        txn.seq_num = seq_num;
        txn.mode = request.mode;
        txn.state = match request.mode {
            TransmissionMode::Unacknowledged => TxnState::S1,
            TransmissionMode::Acknowledged => TxnState::S2,
        };
        txn.history = Some(history_handle);
        txn.role = RoleData::Send(SendParams {
            priority: request.priority,
            keep: request.keep,
            flags: SendFlags {
                commanded,
                ..SendFlags::default()
            },
            ..SendParams::default()
        });

        // Priority ordered admission; equal priorities stay first come,
        // first served.
        let insert_at = {
            let queues = &self.channels[chan].queues;
            let mut insert_at = queues.pend.len();
            for (idx, other) in queues.pend.iter().enumerate() {
                let other_priority = self.transactions[other.index()]
                    .role
                    .send_params()
                    .map(|params| params.priority)
                    .unwrap_or(u8::MAX);
                if other_priority > request.priority {
                    insert_at = idx;
                    break;
                }
            }
            insert_at
        };
        self.channels[chan].queues.pend.insert_at(insert_at, handle);
        self.transactions[handle.index()].queue = QueueId::Pend;

        let id = TransactionId::new(local_eid, seq_num);
        self.user.transaction_started(&id);
        Ok(id)
    }

    fn process_inbound(&mut self, chan: usize) {
        let budget = self.cfg.channels[chan].rx_messages_per_wakeup;
        for _ in 0..budget {
            let Some(pdu) = self.transport.try_recv(chan as u8) else {
                break;
            };
            self.dispatch_pdu(chan, pdu);
        }
    }

    fn dispatch_pdu(&mut self, chan: usize, pdu: Pdu) {
        self.channels[chan].counters.recv.pdus += 1;
        if let Some(handle) =
            self.find_transaction(chan as u8, pdu.header.seq_num, pdu.header.source_id)
        {
            let state = self.transactions[handle.index()].state;
            let (txn, mut sys) = self.split_borrow(chan, handle);
            // Any traffic for the transaction counts as activity.
            txn.inactivity_timer = Timer::new(
                sys.cfg.inactivity_timer_seconds,
                sys.cfg.ticks_per_second,
            );
            match state {
                TxnState::S1 | TxnState::S2 => send::dispatch_pdu(txn, &mut sys, &pdu),
                _ => recv::dispatch_pdu(txn, &mut sys, &pdu),
            }
            return;
        }
        match pdu.target() {
            PacketTarget::DestEntity => self.start_rx_transaction(chan, pdu),
            PacketTarget::SourceEntity => {
                // Sender-directed PDU for a transaction this engine does not
                // run (any more).
                self.channels[chan].counters.recv.spurious += 1;
            }
        }
    }

    /// First PDU of an unknown inbound transaction.
    fn start_rx_transaction(&mut self, chan: usize, pdu: Pdu) {
        if pdu.header.dest_id != self.cfg.local_eid {
            self.channels[chan].counters.recv.errors += 1;
            return;
        }
        if !matches!(
            pdu.payload,
            PduPayload::Metadata(_) | PduPayload::FileData(_) | PduPayload::Eof(_)
        ) {
            self.channels[chan].counters.recv.spurious += 1;
            return;
        }
        let Some(handle) = self.channels[chan].queues.free.pop_front() else {
            self.channels[chan].counters.recv.dropped += 1;
            return;
        };
        let Some(history_handle) = alloc_history(&mut self.channels[chan].queues) else {
            self.channels[chan].queues.free.push_front(handle);
            self.channels[chan].counters.recv.dropped += 1;
            return;
        };

        let history = &mut self.histories[history_handle.index()];
        history.seq_num = pdu.header.seq_num;
        history.source_id = pdu.header.source_id;
        history.peer_id = pdu.header.source_id;
        history.direction = Direction::Rx;
        history.condition_code = ConditionCode::NoError;
        history.source_filename.clear();
        history.dest_filename.clear();

        let txn = &mut self.transactions[handle.index()];
        txn.source_id = pdu.header.source_id;
        txn.peer_id = pdu.header.source_id;
        txn.seq_num = pdu.header.seq_num;
        txn.mode = pdu.header.mode;
        txn.history = Some(history_handle);
        txn.inactivity_timer = Timer::new(
            self.cfg.inactivity_timer_seconds,
            self.cfg.ticks_per_second,
        );
        self.channels[chan].queues.rx.push_back(handle);
        self.transactions[handle.index()].queue = QueueId::Rx;

        match (&pdu.payload, pdu.header.mode) {
            (PduPayload::Metadata(md), mode) => {
                let md = md.clone();
                let txn = &mut self.transactions[handle.index()];
                txn.state = match mode {
                    TransmissionMode::Unacknowledged => TxnState::R1,
                    TransmissionMode::Acknowledged => TxnState::R2,
                };
                txn.file_size = md.file_size;
                let mut params = RecvParams::default();
                params.flags.metadata_received = true;
                txn.role = RoleData::Recv(params);
                let history = &mut self.histories[history_handle.index()];
                history.source_filename.clone_from(&md.source_filename);
                history.dest_filename.clone_from(&md.dest_filename);
                let id = TransactionId::new(pdu.header.source_id, pdu.header.seq_num);
                self.user.transaction_started(&id);
                let (txn, mut sys) = self.split_borrow(chan, handle);
                match sys.fs.create(&md.dest_filename) {
                    Ok(file) => {
                        txn.file = Some(file);
                        txn.cached_position = 0;
                    }
                    Err(_) => filestore_fault(txn, &mut sys),
                }
            }
            (_, TransmissionMode::Acknowledged) => {
                // File data or EOF ahead of the metadata: store the data in
                // a temporary file so nothing is lost.
                let temp_name = alloc::format!(
                    "{}{}_{}",
                    self.cfg.temp_file_prefix,
                    pdu.header.source_id,
                    pdu.header.seq_num
                );
                let txn = &mut self.transactions[handle.index()];
                txn.state = TxnState::R2;
                let mut params = RecvParams::default();
                params.using_temp_file = true;
                txn.role = RoleData::Recv(params);
                self.histories[history_handle.index()]
                    .dest_filename
                    .clone_from(&temp_name);
                let id = TransactionId::new(pdu.header.source_id, pdu.header.seq_num);
                self.user.transaction_started(&id);
                let (txn, mut sys) = self.split_borrow(chan, handle);
                match sys.fs.create(&temp_name) {
                    Ok(file) => {
                        txn.file = Some(file);
                        txn.cached_position = 0;
                        recv::dispatch_pdu(txn, &mut sys, &pdu);
                    }
                    Err(_) => filestore_fault(txn, &mut sys),
                }
            }
            (_, TransmissionMode::Unacknowledged) => {
                // Class 1 data without metadata can not be stored anywhere;
                // the slot only soaks up the rest of the transaction.
                let txn = &mut self.transactions[handle.index()];
                txn.state = TxnState::Drop;
                txn.role = RoleData::Recv(RecvParams::default());
                let id = TransactionId::new(pdu.header.source_id, pdu.header.seq_num);
                self.user.transaction_started(&id);
            }
        }
    }

    /// Select and drive the single active outgoing transaction.
    fn cycle_tx(&mut self, chan: usize) {
        if self.channels[chan].cur_tx.is_none() {
            if let Some(handle) = self.channels[chan].queues.pend.front() {
                let (txn, mut sys) = self.split_borrow(chan, handle);
                sys.queues.move_txn(txn, QueueId::TxActive);
                *sys.cur_tx = Some(handle);
            }
        }
        if let Some(handle) = self.channels[chan].cur_tx {
            let (txn, mut sys) = self.split_borrow(chan, handle);
            send::cycle_active(txn, &mut sys);
        }
    }

    /// Tick pass over everything that is time driven.
    fn tick_transactions(&mut self, chan: usize) {
        for handle in self.channels[chan].queues.rx.snapshot() {
            if self.transactions[handle.index()].queue != QueueId::Rx {
                continue;
            }
            let (txn, mut sys) = self.split_borrow(chan, handle);
            recv::tick(txn, &mut sys);
        }
        for handle in self.channels[chan].queues.tx_wait.snapshot() {
            if self.transactions[handle.index()].queue != QueueId::TxWait {
                continue;
            }
            let (txn, mut sys) = self.split_borrow(chan, handle);
            send::tick_waiting(txn, &mut sys);
        }
    }

    /// Feed playback entries into the normal admission path as capacity
    /// frees up.
    fn cycle_playback(&mut self, chan: usize) {
        for slot_index in 0..self.channels[chan].playback.len() {
            loop {
                if self.channels[chan].queues.outgoing_count()
                    >= self.cfg.channels[chan].max_concurrent_tx
                {
                    return;
                }
                let Some((name, request)) = ({
                    let slot = &mut self.channels[chan].playback[slot_index];
                    match slot {
                        Some(playback) => match playback.pending.pop_front() {
                            Some(name) => Some((name, playback.request.clone())),
                            None => {
                                // Fully fed, release the slot.
                                *slot = None;
                                None
                            }
                        },
                        None => None,
                    }
                }) else {
                    break;
                };
                let dest = alloc::format!(
                    "{}/{}",
                    request.dest_dir.trim_end_matches('/'),
                    basename(&name)
                );
                let result = self.transmit_file_internal(
                    TransmitFileRequest {
                        source_filename: name.clone(),
                        dest_filename: dest,
                        mode: request.mode,
                        keep: request.keep,
                        channel: chan as u8,
                        priority: request.priority,
                        dest_eid: request.dest_eid,
                    },
                    false,
                );
                match result {
                    Ok(_) => {}
                    Err(
                        RequestError::TxLimitReached
                        | RequestError::NoFreeTransaction
                        | RequestError::NoFreeHistory,
                    ) => {
                        // Put the entry back and try again next cycle.
                        if let Some(playback) = &mut self.channels[chan].playback[slot_index] {
                            playback.pending.push_front(name);
                        }
                        return;
                    }
                    Err(_) => {}
                }
            }
        }
    }

    /// Split the engine borrow into the addressed transaction and the
    /// [Sys] view over everything else.
    fn split_borrow(
        &mut self,
        chan: usize,
        handle: TxnHandle,
    ) -> (&mut Transaction<Fs::File>, Sys<'_, Fs, Tp, U>) {
        let Engine {
            cfg,
            fs,
            transport,
            user,
            transactions,
            histories,
            channels,
            ..
        } = self;
        let channel = &mut channels[chan];
        let txn = &mut transactions[handle.index()];
        let sys = Sys {
            cfg,
            chan: chan as u8,
            fs,
            transport,
            user,
            histories: histories.as_mut_slice(),
            queues: &mut channel.queues,
            counters: &mut channel.counters,
            cur_tx: &mut channel.cur_tx,
        };
        (txn, sys)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::filestore::InMemoryFilestore;
    use crate::pdu::metadata::MetadataPdu;
    use crate::transport::MpscTransport;
    use crate::user::NullUser;
    use alloc::string::ToString;

    type TestEngine = Engine<InMemoryFilestore, MpscTransport, NullUser>;

    fn test_engine() -> (TestEngine, MpscTransport) {
        let (near, far) = MpscTransport::pair(1, 64);
        let mut cfg = EngineConfig::new_with_default_values(EntityId(1));
        cfg.channels[0].max_concurrent_tx = 2;
        let engine = Engine::new(cfg, InMemoryFilestore::new(), near, NullUser).unwrap();
        (engine, far)
    }

    fn tx_request(source: &str) -> TransmitFileRequest {
        TransmitFileRequest {
            source_filename: source.to_string(),
            dest_filename: alloc::format!("dl/{}", basename(source)),
            mode: TransmissionMode::Acknowledged,
            keep: true,
            channel: 0,
            priority: 10,
            dest_eid: EntityId(2),
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (near, _far) = MpscTransport::pair(1, 4);
        let mut cfg = EngineConfig::new_with_default_values(EntityId(1));
        cfg.channels.clear();
        assert_eq!(
            Engine::new(cfg, InMemoryFilestore::new(), near, NullUser)
                .err()
                .unwrap(),
            ConfigError::NoChannels
        );
    }

    #[test]
    fn admission_respects_channel_and_tx_limits() {
        let (mut engine, _far) = test_engine();
        engine.filestore_mut().insert_file("a", &[1]);
        let mut bad_chan = tx_request("a");
        bad_chan.channel = 9;
        assert_eq!(
            engine.transmit_file(bad_chan).unwrap_err(),
            RequestError::InvalidChannel(9)
        );
        engine.transmit_file(tx_request("a")).unwrap();
        engine.transmit_file(tx_request("a")).unwrap();
        assert_eq!(
            engine.transmit_file(tx_request("a")).unwrap_err(),
            RequestError::TxLimitReached
        );
        assert_eq!(engine.queue_len(0, QueueId::Pend), 2);
    }

    #[test]
    fn admission_orders_pending_queue_by_priority() {
        let (mut engine, _far) = test_engine();
        let mut low = tx_request("low");
        low.priority = 200;
        let mut high = tx_request("high");
        high.priority = 1;
        engine.transmit_file(low).unwrap();
        engine.transmit_file(high).unwrap();
        let front = engine.channels[0].queues.pend.front().unwrap();
        let txn = engine.transaction(front).unwrap();
        let (source, _) = {
            let history = &engine.histories[txn.history.unwrap().index()];
            (
                history.source_filename.clone(),
                history.dest_filename.clone(),
            )
        };
        assert_eq!(source, "high");
    }

    #[test]
    fn inbound_metadata_creates_receive_transaction() {
        let (mut engine, mut far) = test_engine();
        let header = PduHeader::new(EntityId(5), EntityId(1), 77, TransmissionMode::Acknowledged);
        far.try_send(
            0,
            Pdu::new(
                header,
                PduPayload::Metadata(MetadataPdu::new(4, "src.bin", "dst.bin")),
            ),
        )
        .unwrap();
        engine.cycle();
        let handle = engine.find_transaction(0, 77, EntityId(5)).unwrap();
        let txn = engine.transaction(handle).unwrap();
        assert_eq!(txn.state(), TxnState::R2);
        assert_eq!(txn.queue(), QueueId::Rx);
        assert!(engine.filestore().file_data("dst.bin").is_some());
        assert_eq!(engine.counters(0).unwrap().recv.pdus, 1);
    }

    #[test]
    fn class1_file_data_without_metadata_lands_in_drop_state() {
        let (mut engine, mut far) = test_engine();
        let header =
            PduHeader::new(EntityId(5), EntityId(1), 3, TransmissionMode::Unacknowledged);
        far.try_send(
            0,
            Pdu::new(
                header,
                PduPayload::FileData(crate::pdu::file_data::FileDataPdu::new(
                    0,
                    alloc::vec![1, 2],
                )),
            ),
        )
        .unwrap();
        engine.cycle();
        let handle = engine.find_transaction(0, 3, EntityId(5)).unwrap();
        assert_eq!(engine.transaction(handle).unwrap().state(), TxnState::Drop);
    }

    #[test]
    fn misaddressed_pdu_is_counted_not_processed() {
        let (mut engine, mut far) = test_engine();
        let header = PduHeader::new(EntityId(5), EntityId(9), 1, TransmissionMode::Acknowledged);
        far.try_send(
            0,
            Pdu::new(
                header,
                PduPayload::Metadata(MetadataPdu::new(4, "a", "b")),
            ),
        )
        .unwrap();
        engine.cycle();
        assert!(engine.find_transaction(0, 1, EntityId(5)).is_none());
        assert_eq!(engine.counters(0).unwrap().recv.errors, 1);
    }

    #[test]
    fn abandon_returns_slot_to_free_queue() {
        let (mut engine, _far) = test_engine();
        engine.filestore_mut().insert_file("a", &[1]);
        let id = engine.transmit_file(tx_request("a")).unwrap();
        let handle = engine.find_transaction(0, id.seq_num, EntityId(1)).unwrap();
        let free_before = engine.queue_len(0, QueueId::Free);
        assert!(engine.abandon(handle));
        assert_eq!(engine.queue_len(0, QueueId::Free), free_before + 1);
        assert_eq!(engine.queue_len(0, QueueId::Hist), 1);
        assert!(!engine.abandon(handle));
    }

    #[test]
    fn queue_export_writes_one_line_per_entry() {
        let (mut engine, _far) = test_engine();
        engine.filestore_mut().insert_file("a", &[1]);
        engine.transmit_file(tx_request("a")).unwrap();
        let mut out = String::new();
        engine.write_queue(0, QueueId::Pend, &mut out).unwrap();
        assert_eq!(out, "0,TX,2,NoError,a,dl/a\n");
    }

    #[test]
    fn disable_abandons_everything() {
        let (mut engine, _far) = test_engine();
        engine.filestore_mut().insert_file("a", &[1]);
        engine.transmit_file(tx_request("a")).unwrap();
        engine.disable();
        assert!(!engine.is_enabled());
        assert_eq!(engine.queue_len(0, QueueId::Pend), 0);
        assert_eq!(
            engine.queue_len(0, QueueId::Free),
            engine.config().num_transactions_per_channel
        );
        assert_eq!(
            engine.transmit_file(tx_request("a")).unwrap_err(),
            RequestError::Disabled
        );
    }

    #[test]
    fn playback_requires_free_slot() {
        let (mut engine, _far) = test_engine();
        engine.filestore_mut().insert_file("pb/a", &[1]);
        let request = PlaybackRequest {
            source_dir: "pb".to_string(),
            dest_dir: "dl".to_string(),
            mode: TransmissionMode::Acknowledged,
            keep: true,
            channel: 0,
            priority: 50,
            dest_eid: EntityId(2),
        };
        engine.playback_directory(request.clone()).unwrap();
        engine.playback_directory(request.clone()).unwrap();
        assert_eq!(
            engine.playback_directory(request).unwrap_err(),
            RequestError::PlaybackSlotsBusy
        );
    }

    #[test]
    fn playback_feeds_transactions_through_admission() {
        let (mut engine, _far) = test_engine();
        engine.filestore_mut().insert_file("pb/a", &[1]);
        engine.filestore_mut().insert_file("pb/b", &[2]);
        engine
            .playback_directory(PlaybackRequest {
                source_dir: "pb".to_string(),
                dest_dir: "dl/".to_string(),
                mode: TransmissionMode::Acknowledged,
                keep: true,
                channel: 0,
                priority: 50,
                dest_eid: EntityId(2),
            })
            .unwrap();
        engine.cycle();
        // Both fit below the concurrent transmit limit of two; the first one
        // may already have progressed to the wait queue within this cycle.
        let outgoing = engine.queue_len(0, QueueId::Pend)
            + engine.queue_len(0, QueueId::TxActive)
            + engine.queue_len(0, QueueId::TxWait);
        assert_eq!(outgoing, 2);
        let mut out = String::new();
        for queue in [QueueId::Pend, QueueId::TxActive, QueueId::TxWait] {
            engine.write_queue(0, queue, &mut out).unwrap();
        }
        assert!(out.contains("pb/a,dl/a"));
        assert!(out.contains("pb/b,dl/b"));
    }
}

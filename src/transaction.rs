//! Transaction and history records.
//!
//! A [Transaction] is one slot of the engine's fixed transaction pool. The
//! protocol role of a slot is captured by [RoleData]: the sending and the
//! receiving role carry different sub-state and flag sets, and the tagged
//! representation makes it impossible to read send flags on a receive
//! transaction.
//!
//! Each active transaction references a [History] record which holds the
//! file names and the final condition code. The history outlives the
//! transaction slot on the bounded history queue until it gets recycled.
use alloc::string::String;
use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::chunks::ChunkTracker;
use crate::pdu::{ConditionCode, DeliveryCode, FileStatus, TransmissionMode};
use crate::queue::QueueId;
use crate::timer::Timer;
use crate::{Direction, EntityId, TransactionId, TransactionSeqNum};

/// Stable index of a transaction slot in the engine pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxnHandle(u16);

impl TxnHandle {
    pub(crate) const fn new(index: u16) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable index of a history record in the engine pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HistoryHandle(u16);

impl HistoryHandle {
    pub(crate) const fn new(index: u16) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Top level transaction state.
///
/// `R`/`S` is the receiving/sending role, the digit the CFDP transfer class.
/// [TxnState::Drop] is the sink for class 1 file data arriving without
/// metadata: such data can neither be stored nor repaired, so the
/// transaction only exists to consume the PDUs until it goes inactive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxnState {
    #[default]
    Idle,
    R1,
    S1,
    R2,
    S2,
    Drop,
}

/// Progress of a sending transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendSub {
    #[default]
    Metadata,
    FileData,
    Eof,
    WaitEofAck,
    WaitFin,
    SendFinAck,
}

/// Progress of a receiving transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecvSub {
    #[default]
    FileData,
    Eof,
    WaitFinAck,
}

/// Flags shared by both roles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommonFlags {
    pub suspended: bool,
    pub canceled: bool,
    /// The file checksum has been finalized.
    pub crc_calculated: bool,
    pub ack_timer_armed: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SendFlags {
    /// A NAK asked for the Metadata PDU to be re-sent.
    pub metadata_needs_send: bool,
    /// Admitted through the command interface rather than playback.
    pub commanded: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecvFlags {
    pub metadata_received: bool,
    pub eof_received: bool,
    /// An ACK of the received EOF is pending transmission.
    pub send_ack: bool,
    /// A NAK round is pending transmission.
    pub send_nak: bool,
    /// The Finished PDU is pending transmission.
    pub send_fin: bool,
    /// A NAK was sent and its answer is outstanding.
    pub nak_sent: bool,
    /// All file data and metadata are present.
    pub complete: bool,
    pub inactivity_fired: bool,
}

/// Delivery outcome reported by the peer's Finished PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FinDisposition {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

/// Role specific state of a sending transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SendParams {
    pub sub: SendSub,
    pub flags: SendFlags,
    pub priority: u8,
    /// Keep the source file after successful transmission.
    pub keep: bool,
    /// Expirations of the ack timer while waiting for the EOF ACK or the
    /// Finished PDU.
    pub ack_count: u32,
    pub fin: Option<FinDisposition>,
}

/// Role specific state of a receiving transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RecvParams {
    pub sub: RecvSub,
    pub flags: RecvFlags,
    /// Checksum reported in the EOF PDU.
    pub eof_crc: u32,
    /// File size reported in the EOF PDU.
    pub eof_size: u64,
    /// Condition code reported in the EOF PDU.
    pub eof_condition: ConditionCode,
    /// NAK rounds issued so far.
    pub nak_count: u32,
    /// Finished PDU retransmissions so far.
    pub ack_count: u32,
    /// Read position of the deferred checksum calculation.
    pub crc_calc_position: u64,
    /// File data arrived before metadata; data goes to a temporary file
    /// until the metadata supplies the real name.
    pub using_temp_file: bool,
}

impl Default for RecvParams {
    fn default() -> Self {
        Self {
            sub: RecvSub::default(),
            flags: RecvFlags::default(),
            eof_crc: 0,
            eof_size: 0,
            eof_condition: ConditionCode::NoError,
            nak_count: 0,
            ack_count: 0,
            crc_calc_position: 0,
            using_temp_file: false,
        }
    }
}

/// Role specific portion of a transaction.
///
/// Keeping the send and receive flag sets in a tagged variant means the type
/// system, not convention, prevents interpreting one role's flags as the
/// other's.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RoleData {
    #[default]
    Idle,
    Send(SendParams),
    Recv(RecvParams),
}

impl RoleData {
    pub fn send_params(&self) -> Option<&SendParams> {
        match self {
            RoleData::Send(params) => Some(params),
            _ => None,
        }
    }

    pub fn send_params_mut(&mut self) -> Option<&mut SendParams> {
        match self {
            RoleData::Send(params) => Some(params),
            _ => None,
        }
    }

    pub fn recv_params(&self) -> Option<&RecvParams> {
        match self {
            RoleData::Recv(params) => Some(params),
            _ => None,
        }
    }

    pub fn recv_params_mut(&mut self) -> Option<&mut RecvParams> {
        match self {
            RoleData::Recv(params) => Some(params),
            _ => None,
        }
    }
}

/// Retained summary of a finished (or failed) transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct History {
    pub seq_num: TransactionSeqNum,
    pub source_id: EntityId,
    pub peer_id: EntityId,
    pub direction: Direction,
    pub condition_code: ConditionCode,
    pub source_filename: String,
    pub dest_filename: String,
}

impl Default for History {
    fn default() -> Self {
        Self {
            seq_num: 0,
            source_id: EntityId(0),
            peer_id: EntityId(0),
            direction: Direction::Rx,
            condition_code: ConditionCode::NoError,
            source_filename: String::new(),
            dest_filename: String::new(),
        }
    }
}

impl History {
    #[inline]
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.source_id, self.seq_num)
    }

    /// One fixed-format status line, used by the queue export.
    pub fn write_status_line(&self, sink: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            sink,
            "{},{},{},{:?},{},{}",
            self.seq_num,
            self.direction,
            self.peer_id,
            self.condition_code,
            self.source_filename,
            self.dest_filename
        )
    }
}

/// One slot of the engine's transaction pool.
///
/// `F` is the open file handle type of the configured
/// [crate::filestore::VirtualFilestore].
#[derive(Debug)]
pub struct Transaction<F> {
    pub(crate) handle: TxnHandle,
    pub(crate) channel: u8,
    pub(crate) state: TxnState,
    /// Queue membership; a transaction is on exactly one queue at all times.
    pub(crate) queue: QueueId,
    pub(crate) source_id: EntityId,
    pub(crate) peer_id: EntityId,
    pub(crate) seq_num: TransactionSeqNum,
    pub(crate) mode: TransmissionMode,
    pub(crate) condition_code: ConditionCode,
    pub(crate) file_size: u64,
    /// Next in-order byte offset (send) or received high water mark
    /// (class 1 receive).
    pub(crate) file_offset: u64,
    /// Last known file position, to skip redundant seeks.
    pub(crate) cached_position: u64,
    pub(crate) crc: Checksum,
    pub(crate) inactivity_timer: Timer,
    pub(crate) ack_timer: Timer,
    pub(crate) flags: CommonFlags,
    pub(crate) role: RoleData,
    pub(crate) history: Option<HistoryHandle>,
    pub(crate) chunks: ChunkTracker,
    pub(crate) file: Option<F>,
}

impl<F> Transaction<F> {
    pub(crate) fn new_free_slot(handle: TxnHandle, channel: u8, max_chunks: usize) -> Self {
        Self {
            handle,
            channel,
            state: TxnState::Idle,
            queue: QueueId::Free,
            source_id: EntityId(0),
            peer_id: EntityId(0),
            seq_num: 0,
            mode: TransmissionMode::Unacknowledged,
            condition_code: ConditionCode::NoError,
            file_size: 0,
            file_offset: 0,
            cached_position: 0,
            crc: Checksum::new(),
            inactivity_timer: Timer::expired_timer(),
            ack_timer: Timer::expired_timer(),
            flags: CommonFlags::default(),
            role: RoleData::Idle,
            history: None,
            chunks: ChunkTracker::new(max_chunks),
            file: None,
        }
    }

    #[inline]
    pub fn handle(&self) -> TxnHandle {
        self.handle
    }

    #[inline]
    pub fn channel(&self) -> u8 {
        self.channel
    }

    #[inline]
    pub fn state(&self) -> TxnState {
        self.state
    }

    #[inline]
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    #[inline]
    pub fn condition_code(&self) -> ConditionCode {
        self.condition_code
    }

    #[inline]
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.source_id, self.seq_num)
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        match self.state {
            TxnState::S1 | TxnState::S2 => Direction::Tx,
            _ => Direction::Rx,
        }
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.flags.suspended
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.flags.canceled
    }

    /// Transfer progress in bytes, used for fault indications.
    #[inline]
    pub fn progress(&self) -> u64 {
        self.file_offset
    }

    /// Return the slot to its pristine free state. The file must already be
    /// closed and the history detached by the caller.
    pub(crate) fn clear(&mut self) {
        debug_assert!(self.file.is_none());
        self.state = TxnState::Idle;
        self.source_id = EntityId(0);
        self.peer_id = EntityId(0);
        self.seq_num = 0;
        self.mode = TransmissionMode::Unacknowledged;
        self.condition_code = ConditionCode::NoError;
        self.file_size = 0;
        self.file_offset = 0;
        self.cached_position = 0;
        self.crc.reset();
        self.inactivity_timer = Timer::expired_timer();
        self.ack_timer = Timer::expired_timer();
        self.flags = CommonFlags::default();
        self.role = RoleData::Idle;
        self.history = None;
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_slot_is_idle_on_the_free_queue() {
        let txn: Transaction<()> = Transaction::new_free_slot(TxnHandle::new(3), 1, 4);
        assert_eq!(txn.handle().index(), 3);
        assert_eq!(txn.channel(), 1);
        assert_eq!(txn.state(), TxnState::Idle);
        assert_eq!(txn.queue(), QueueId::Free);
        assert!(txn.history.is_none());
    }

    #[test]
    fn clear_resets_protocol_state() {
        let mut txn: Transaction<()> = Transaction::new_free_slot(TxnHandle::new(0), 0, 4);
        txn.state = TxnState::R2;
        txn.seq_num = 99;
        txn.condition_code = ConditionCode::InactivityDetected;
        txn.chunks.add(0, 10);
        txn.crc.digest(&[1, 2, 3]);
        txn.flags.canceled = true;
        txn.role = RoleData::Recv(RecvParams::default());
        txn.clear();
        assert_eq!(txn.state(), TxnState::Idle);
        assert_eq!(txn.seq_num, 0);
        assert_eq!(txn.condition_code(), ConditionCode::NoError);
        assert!(txn.chunks.is_empty());
        assert_eq!(txn.crc.finalize(), 0);
        assert!(!txn.flags.canceled);
        assert_eq!(txn.role, RoleData::Idle);
    }

    #[test]
    fn send_sub_states_are_ordered() {
        assert!(SendSub::Metadata < SendSub::FileData);
        assert!(SendSub::FileData < SendSub::Eof);
        assert!(SendSub::WaitEofAck < SendSub::WaitFin);
        assert!(SendSub::WaitFin < SendSub::SendFinAck);
    }

    #[test]
    fn role_data_accessors_are_role_safe() {
        let mut role = RoleData::Send(SendParams::default());
        assert!(role.send_params().is_some());
        assert!(role.recv_params().is_none());
        assert!(role.recv_params_mut().is_none());
        role = RoleData::Recv(RecvParams::default());
        assert!(role.recv_params().is_some());
        assert!(role.send_params().is_none());
    }

    #[test]
    fn history_status_line_format() {
        let history = History {
            seq_num: 12,
            source_id: EntityId(1),
            peer_id: EntityId(7),
            direction: Direction::Tx,
            condition_code: ConditionCode::NoError,
            source_filename: String::from("/ram/a.bin"),
            dest_filename: String::from("/dl/a.bin"),
        };
        let mut out = String::new();
        history.write_status_line(&mut out).unwrap();
        assert_eq!(out, "12,TX,7,NoError,/ram/a.bin,/dl/a.bin\n");
    }
}

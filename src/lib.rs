//! # CFDP transaction engine
//!
//! This crate contains a tick-driven transaction engine for the CCSDS File
//! Delivery Protocol (CFDP) as specified in
//! [CCSDS 727.0-B-5](https://public.ccsds.org/Pubs/727x0b5e1.pdf), targeted at
//! flight software which runs the protocol as a cyclically scheduled
//! application. It implements both the unacknowledged (class 1) and the
//! acknowledged (class 2) transmission modes, in both the sending and the
//! receiving role, over fixed resource pools which are allocated once at
//! construction time.
//!
//! The core component is the [engine::Engine] which owns all transaction,
//! history and received-range pools and drives every active transaction a
//! little further on each [engine::Engine::cycle] call. The engine is generic
//! over three collaborators:
//!
//! - A [filestore::VirtualFilestore] which decouples the protocol from the
//!   underlying filesystem. [filestore::NativeFilestore] covers `std` targets,
//!   [filestore::InMemoryFilestore] covers tests and RAM file systems.
//! - A [transport::PduTransport] which moves logical PDUs in and out of the
//!   engine. Encoding those PDUs to their wire representation is the job of
//!   the transport integration and outside the scope of this crate.
//! - A [user::TransferUser] which receives indications about transaction
//!   progress and faults.
//!
//! There is no internal threading and no locking: one engine cycle runs to
//! completion on the caller's task, and all timers are counted in scheduler
//! ticks rather than wall-clock time.
#![no_std]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(any(feature = "std", test))]
extern crate std;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod checksum;
#[cfg(feature = "alloc")]
pub mod chunks;
#[cfg(feature = "alloc")]
pub mod engine;
#[cfg(feature = "alloc")]
pub mod filestore;
#[cfg(feature = "alloc")]
pub mod pdu;
#[cfg(feature = "alloc")]
pub mod queue;
#[cfg(feature = "alloc")]
pub(crate) mod recv;
#[cfg(feature = "alloc")]
pub(crate) mod send;
pub mod seq_count;
pub mod timer;
#[cfg(feature = "alloc")]
pub mod transaction;
#[cfg(feature = "alloc")]
pub mod transport;
#[cfg(feature = "alloc")]
pub mod user;

#[cfg(feature = "alloc")]
use alloc::{string::String, vec::Vec};
use core::fmt;

/// Numeric CFDP entity identifier.
///
/// The width on the wire is a codec concern; the engine always carries the
/// value widened to 64 bit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EntityId(pub u64);

impl EntityId {
    #[inline]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for EntityId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction sequence numbers are assigned by the sending entity.
pub type TransactionSeqNum = u32;

/// The CFDP transaction ID consists of the source entity ID and the sequence
/// number assigned by that entity. It is unique for the lifetime of the
/// transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransactionId {
    pub source_id: EntityId,
    pub seq_num: TransactionSeqNum,
}

impl TransactionId {
    pub const fn new(source_id: EntityId, seq_num: TransactionSeqNum) -> Self {
        Self { source_id, seq_num }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source_id, self.seq_num)
    }
}

/// Direction of a transaction as seen from the local entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Rx,
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

/// Static configuration of one engine channel.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelConfig {
    /// Admission limit for concurrently pending or active outgoing
    /// transactions.
    pub max_concurrent_tx: usize,
    /// Upper bound of inbound PDUs dispatched per engine cycle.
    pub rx_messages_per_wakeup: u32,
    /// Upper bound of file data PDUs the active outgoing transaction may
    /// emit per engine cycle.
    pub outgoing_messages_per_wakeup: u32,
    /// Number of directory playback slots.
    pub num_playback_slots: usize,
}

#[cfg(feature = "alloc")]
impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tx: 2,
            rx_messages_per_wakeup: 32,
            outgoing_messages_per_wakeup: 4,
            num_playback_slots: 2,
        }
    }
}

/// Static configuration of the whole engine.
///
/// All pool sizes are fixed here; [engine::Engine::new] allocates every pool
/// exactly once and nothing grows afterwards.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineConfig {
    /// Entity ID of the local CFDP entity.
    pub local_eid: EntityId,
    /// Scheduler ticks per second, used to scale all timer durations.
    pub ticks_per_second: u32,
    /// Expiry period for PDUs which require a positive acknowledgement.
    pub ack_timer_seconds: u32,
    /// Expiry period for the deferred lost segment (NAK) procedure.
    pub nak_timer_seconds: u32,
    /// A transaction without any inbound activity for this long is
    /// terminated with [pdu::ConditionCode::InactivityDetected].
    pub inactivity_timer_seconds: u32,
    /// Number of ack timer expirations before a transaction is terminated
    /// with [pdu::ConditionCode::PositiveAckLimitReached].
    pub ack_limit: u32,
    /// Number of NAK rounds without progress before reception is forced
    /// complete with [pdu::ConditionCode::NakLimitReached].
    pub nak_limit: u32,
    /// Payload size of outgoing file data PDUs.
    pub outgoing_file_chunk_size: usize,
    /// Budget for the deferred receive-side checksum calculation, in file
    /// bytes digested per engine cycle.
    pub rx_crc_calc_bytes_per_wakeup: u64,
    pub num_transactions_per_channel: usize,
    /// Retained post-transaction history records per channel, in addition to
    /// the records bound to active transaction slots.
    pub num_histories_per_channel: usize,
    /// Capacity of the received-range tracker of each transaction slot.
    pub max_chunks_per_transaction: usize,
    /// Upper bound of segment requests placed into a single NAK PDU.
    pub max_gaps_per_nak: usize,
    /// Name prefix for files received before their metadata.
    pub temp_file_prefix: String,
    pub channels: Vec<ChannelConfig>,
}

#[cfg(feature = "alloc")]
impl EngineConfig {
    /// Default values suitable for tests and small deployments, with one
    /// channel.
    pub fn new_with_default_values(local_eid: EntityId) -> Self {
        Self {
            local_eid,
            ticks_per_second: 1,
            ack_timer_seconds: 3,
            nak_timer_seconds: 3,
            inactivity_timer_seconds: 30,
            ack_limit: 4,
            nak_limit: 4,
            outgoing_file_chunk_size: 512,
            rx_crc_calc_bytes_per_wakeup: 16384,
            num_transactions_per_channel: 8,
            num_histories_per_channel: 16,
            max_chunks_per_transaction: 16,
            max_gaps_per_nak: 8,
            temp_file_prefix: String::from(".cfdp_tmp_"),
            channels: alloc::vec![ChannelConfig::default()],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        if self.ticks_per_second == 0 {
            return Err(ConfigError::ZeroField("ticks_per_second"));
        }
        if self.outgoing_file_chunk_size == 0 {
            return Err(ConfigError::ZeroField("outgoing_file_chunk_size"));
        }
        if self.num_transactions_per_channel == 0 {
            return Err(ConfigError::ZeroField("num_transactions_per_channel"));
        }
        if self.max_chunks_per_transaction == 0 {
            return Err(ConfigError::ZeroField("max_chunks_per_transaction"));
        }
        if self.max_gaps_per_nak == 0 {
            return Err(ConfigError::ZeroField("max_gaps_per_nak"));
        }
        Ok(())
    }
}

/// Returned by [EngineConfig::validate] for configurations the engine can
/// not run with.
#[cfg(feature = "alloc")]
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one channel must be configured")]
    NoChannels,
    #[error("configuration field {0} must not be zero")]
    ZeroField(&'static str),
}

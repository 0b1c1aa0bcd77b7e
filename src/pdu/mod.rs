//! Logical CFDP Packet Data Unit (PDU) model.
//!
//! The engine exchanges PDUs with its transport as structured records holding
//! exactly the fields the protocol logic consumes and produces. Encoding and
//! decoding the CCSDS 727.0-B-5 wire representation is the job of the
//! transport integration; keeping the codec outside the engine keeps the
//! state machines independent of entity ID widths, CRC flags and the other
//! purely representational header details.
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{EntityId, TransactionId, TransactionSeqNum};

pub mod ack;
pub mod eof;
pub mod file_data;
pub mod finished;
pub mod metadata;
pub mod nak;

use ack::AckPdu;
use eof::EofPdu;
use file_data::FileDataPdu;
use finished::FinishedPdu;
use metadata::MetadataPdu;
use nak::NakPdu;

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PduType {
    FileDirective = 0,
    FileData = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransmissionMode {
    Acknowledged = 0,
    Unacknowledged = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FileDirectiveType {
    EofPdu = 0x04,
    FinishedPdu = 0x05,
    AckPdu = 0x06,
    MetadataPdu = 0x07,
    NakPdu = 0x08,
    PromptPdu = 0x09,
    KeepAlivePdu = 0x0c,
}

/// Condition codes as specified in chapter 5.2.4 of the CFDP standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConditionCode {
    NoError = 0b0000,
    PositiveAckLimitReached = 0b0001,
    KeepAliveLimitReached = 0b0010,
    InvalidTransmissionMode = 0b0011,
    FilestoreRejection = 0b0100,
    FileChecksumFailure = 0b0101,
    FileSizeError = 0b0110,
    NakLimitReached = 0b0111,
    InactivityDetected = 0b1000,
    InvalidFileStructure = 0b1001,
    CheckLimitReached = 0b1010,
    UnsupportedChecksumType = 0b1011,
    SuspendRequestReceived = 0b1110,
    CancelRequestReceived = 0b1111,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeliveryCode {
    Complete = 0,
    Incomplete = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FileStatus {
    DiscardDeliberately = 0b00,
    DiscardedFilestoreRejection = 0b01,
    Retained = 0b10,
    Unreported = 0b11,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransactionStatus {
    Undefined = 0b00,
    Active = 0b01,
    Terminated = 0b10,
    Unrecognized = 0b11,
}

/// The entity a PDU has to be routed to, following the forwarding procedure
/// of section 4.5 of the CFDP standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketTarget {
    SourceEntity,
    DestEntity,
}

/// Header fields common to all PDUs which the engine consumes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PduHeader {
    pub source_id: EntityId,
    pub dest_id: EntityId,
    pub seq_num: TransactionSeqNum,
    pub mode: TransmissionMode,
}

impl PduHeader {
    pub const fn new(
        source_id: EntityId,
        dest_id: EntityId,
        seq_num: TransactionSeqNum,
        mode: TransmissionMode,
    ) -> Self {
        Self {
            source_id,
            dest_id,
            seq_num,
            mode,
        }
    }

    /// The transaction this PDU belongs to.
    #[inline]
    pub const fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.source_id, self.seq_num)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PduPayload {
    Metadata(MetadataPdu),
    FileData(FileDataPdu),
    Eof(EofPdu),
    Finished(FinishedPdu),
    Ack(AckPdu),
    Nak(NakPdu),
}

/// One logical PDU: header plus typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pdu {
    pub header: PduHeader,
    pub payload: PduPayload,
}

impl Pdu {
    pub const fn new(header: PduHeader, payload: PduPayload) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn pdu_type(&self) -> PduType {
        match self.payload {
            PduPayload::FileData(_) => PduType::FileData,
            _ => PduType::FileDirective,
        }
    }

    #[inline]
    pub fn directive_type(&self) -> Option<FileDirectiveType> {
        match self.payload {
            PduPayload::Metadata(_) => Some(FileDirectiveType::MetadataPdu),
            PduPayload::FileData(_) => None,
            PduPayload::Eof(_) => Some(FileDirectiveType::EofPdu),
            PduPayload::Finished(_) => Some(FileDirectiveType::FinishedPdu),
            PduPayload::Ack(_) => Some(FileDirectiveType::AckPdu),
            PduPayload::Nak(_) => Some(FileDirectiveType::NakPdu),
        }
    }

    /// Which entity of the transaction this PDU is directed at.
    ///
    /// File data, metadata and EOF travel towards the file receiver, NAK and
    /// Finished towards the file sender, and the recipient of an ACK depends
    /// on the directive being acknowledged.
    pub fn target(&self) -> PacketTarget {
        match &self.payload {
            PduPayload::Metadata(_) | PduPayload::FileData(_) | PduPayload::Eof(_) => {
                PacketTarget::DestEntity
            }
            PduPayload::Finished(_) | PduPayload::Nak(_) => PacketTarget::SourceEntity,
            PduPayload::Ack(ack) => {
                if ack.acked_directive == FileDirectiveType::EofPdu {
                    PacketTarget::SourceEntity
                } else {
                    PacketTarget::DestEntity
                }
            }
        }
    }
}

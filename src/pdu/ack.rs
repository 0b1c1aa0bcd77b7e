//! ACK PDU fields.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{ConditionCode, FileDirectiveType, TransactionStatus};

/// Logical content of an ACK PDU.
///
/// Only EOF and Finished PDUs are acknowledged in CFDP; constructing an ACK
/// for any other directive is a caller bug which the engine never does.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AckPdu {
    pub acked_directive: FileDirectiveType,
    pub condition_code: ConditionCode,
    pub transaction_status: TransactionStatus,
}

impl AckPdu {
    pub const fn new(
        acked_directive: FileDirectiveType,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Self {
        Self {
            acked_directive,
            condition_code,
            transaction_status,
        }
    }
}

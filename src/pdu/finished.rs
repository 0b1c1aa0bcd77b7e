//! Finished PDU fields.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{ConditionCode, DeliveryCode, FileStatus};

/// Logical content of a Finished PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FinishedPdu {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

impl FinishedPdu {
    pub const fn new(
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) -> Self {
        Self {
            condition_code,
            delivery_code,
            file_status,
        }
    }

    /// Finished PDU reporting complete delivery of a retained file.
    pub const fn new_success() -> Self {
        Self::new(
            ConditionCode::NoError,
            DeliveryCode::Complete,
            FileStatus::Retained,
        )
    }
}

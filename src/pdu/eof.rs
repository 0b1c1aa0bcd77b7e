//! EOF PDU fields.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::ConditionCode;

/// Logical content of an EOF PDU.
///
/// The checksum is the modular file checksum over the data actually sent,
/// see [crate::checksum].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EofPdu {
    pub condition_code: ConditionCode,
    pub checksum: u32,
    pub file_size: u64,
}

impl EofPdu {
    pub const fn new(condition_code: ConditionCode, checksum: u32, file_size: u64) -> Self {
        Self {
            condition_code,
            checksum,
            file_size,
        }
    }

    pub const fn new_no_error(checksum: u32, file_size: u64) -> Self {
        Self::new(ConditionCode::NoError, checksum, file_size)
    }
}

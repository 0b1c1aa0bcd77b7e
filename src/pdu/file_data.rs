//! File Data PDU fields.
use alloc::vec::Vec;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One segment of file content.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FileDataPdu {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl FileDataPdu {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        Self { offset, data }
    }

    /// First byte offset past this segment.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

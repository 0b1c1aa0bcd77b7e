//! Metadata PDU fields.
use alloc::string::String;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Logical content of a Metadata PDU.
///
/// Filestore requests, messages to user and the other metadata options are
/// not part of the engine's field set.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetadataPdu {
    pub file_size: u64,
    pub source_filename: String,
    pub dest_filename: String,
}

impl MetadataPdu {
    pub fn new(
        file_size: u64,
        source_filename: impl Into<String>,
        dest_filename: impl Into<String>,
    ) -> Self {
        Self {
            file_size,
            source_filename: source_filename.into(),
            dest_filename: dest_filename.into(),
        }
    }
}

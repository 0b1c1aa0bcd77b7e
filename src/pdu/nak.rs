//! NAK PDU fields.
use alloc::vec::Vec;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One segment request: the half open byte range `start..end` the receiver
/// asks to have retransmitted.
///
/// The all-zero request is the standard's sentinel asking for the Metadata
/// PDU to be re-sent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SegmentRequest {
    pub start: u64,
    pub end: u64,
}

impl SegmentRequest {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The `(0, 0)` metadata re-request sentinel.
    pub const fn metadata_request() -> Self {
        Self::new(0, 0)
    }

    #[inline]
    pub const fn is_metadata_request(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}

/// Logical content of a NAK PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NakPdu {
    pub scope_start: u64,
    pub scope_end: u64,
    pub segment_requests: Vec<SegmentRequest>,
}

impl NakPdu {
    pub const fn new(scope_start: u64, scope_end: u64) -> Self {
        Self {
            scope_start,
            scope_end,
            segment_requests: Vec::new(),
        }
    }

    pub fn with_segment_requests(
        scope_start: u64,
        scope_end: u64,
        segment_requests: Vec<SegmentRequest>,
    ) -> Self {
        Self {
            scope_start,
            scope_end,
            segment_requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_sentinel() {
        assert!(SegmentRequest::metadata_request().is_metadata_request());
        assert!(!SegmentRequest::new(0, 1).is_metadata_request());
        assert!(!SegmentRequest::new(1, 1).is_metadata_request());
    }

    #[test]
    fn segment_request_list() {
        let nak = NakPdu::with_segment_requests(
            0,
            2000,
            alloc::vec![
                SegmentRequest::metadata_request(),
                SegmentRequest::new(1000, 2000)
            ],
        );
        assert_eq!(nak.segment_requests.len(), 2);
        assert!(nak.segment_requests[0].is_metadata_request());
    }
}

//! PDU transport abstraction.
//!
//! The engine polls its transport cooperatively: [PduTransport::try_recv]
//! never blocks, and [PduTransport::try_send] fails with
//! [TransportError::Backpressure] when the underlying layer has no output
//! buffer left for this cycle. The engine then simply leaves its send-pending
//! state in place and retries on the next cycle; this polling retry is the
//! only backpressure mechanism in the system.
use crate::pdu::Pdu;

/// Errors of [PduTransport::try_send].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// No output buffer is available this cycle; retry on the next one.
    #[error("no transport output buffer available")]
    Backpressure,
    /// The peer side of the transport is gone.
    #[error("transport disconnected")]
    Disconnected,
}

/// Bidirectional, channel-indexed PDU transport.
pub trait PduTransport {
    /// Fetch the next pending inbound PDU of a channel, if any.
    fn try_recv(&mut self, channel: u8) -> Option<Pdu>;

    /// Attempt to hand one PDU to the transport for transmission.
    fn try_send(&mut self, channel: u8, pdu: Pdu) -> Result<(), TransportError>;
}

#[cfg(feature = "std")]
pub use std_mod::*;

#[cfg(feature = "std")]
pub mod std_mod {
    use super::*;
    use std::sync::mpsc;
    use std::vec::Vec;

    /// [PduTransport] over bounded standard library channels, mainly useful
    /// for tests and intra-process deployments.
    #[derive(Debug)]
    pub struct MpscTransport {
        links: Vec<(mpsc::SyncSender<Pdu>, mpsc::Receiver<Pdu>)>,
    }

    impl MpscTransport {
        /// Create two cross-wired transports with `num_channels` channels
        /// each: everything sent by one side becomes receivable on the same
        /// channel of the other side. `depth` bounds the in-flight PDUs per
        /// direction and channel; a full queue shows up as
        /// [TransportError::Backpressure].
        pub fn pair(num_channels: usize, depth: usize) -> (Self, Self) {
            let mut left = Vec::with_capacity(num_channels);
            let mut right = Vec::with_capacity(num_channels);
            for _ in 0..num_channels {
                let (left_tx, right_rx) = mpsc::sync_channel(depth);
                let (right_tx, left_rx) = mpsc::sync_channel(depth);
                left.push((left_tx, left_rx));
                right.push((right_tx, right_rx));
            }
            (Self { links: left }, Self { links: right })
        }
    }

    impl PduTransport for MpscTransport {
        fn try_recv(&mut self, channel: u8) -> Option<Pdu> {
            let (_, rx) = self.links.get(channel as usize)?;
            rx.try_recv().ok()
        }

        fn try_send(&mut self, channel: u8, pdu: Pdu) -> Result<(), TransportError> {
            let (tx, _) = self
                .links
                .get(channel as usize)
                .ok_or(TransportError::Disconnected)?;
            tx.try_send(pdu).map_err(|err| match err {
                mpsc::TrySendError::Full(_) => TransportError::Backpressure,
                mpsc::TrySendError::Disconnected(_) => TransportError::Disconnected,
            })
        }
    }
}

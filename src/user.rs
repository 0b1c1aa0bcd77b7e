//! User indications.
//!
//! The engine reports transaction progress through this trait instead of a
//! logging backend; integrations forward the callbacks to their event or
//! telemetry service. All methods default to no-ops so an implementation
//! only picks up the indications it cares about.
use crate::pdu::ConditionCode;
use crate::transaction::History;
use crate::TransactionId;

/// Indication sink for transaction life cycle events.
pub trait TransferUser {
    /// A transaction was admitted (sending role) or detected (receiving
    /// role).
    fn transaction_started(&mut self, _id: &TransactionId) {}

    fn eof_sent(&mut self, _id: &TransactionId) {}

    fn eof_received(&mut self, _id: &TransactionId) {}

    /// The transaction left the engine; `summary` is the history record that
    /// remains queued for ground visibility.
    fn transaction_finished(&mut self, _summary: &History) {}

    /// A fault was declared against the transaction.
    fn fault(&mut self, _id: &TransactionId, _cond: ConditionCode, _progress: u64) {}
}

/// No-op indication sink.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct NullUser;

impl TransferUser for NullUser {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityId;

    #[test]
    fn null_user_accepts_all_indications() {
        let mut user = NullUser;
        let id = TransactionId::new(EntityId(1), 2);
        user.transaction_started(&id);
        user.eof_sent(&id);
        user.eof_received(&id);
        user.fault(&id, ConditionCode::NoError, 0);
    }
}

//! The transaction-validation collaborator.
//!
//! Kernel signature checks, commitment balance, and shielded-element rules
//! live outside the node core. With `verification_threads = 0` validation
//! runs inline on the reactor; otherwise the shell routes it through the
//! worker pool and posts the result back.

use mist_types::{Height, Transaction};

/// Result of full transaction validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxValidation {
    /// Valid; `fee_reserve` is the fee headroom beyond the minimum,
    /// available to fund dummy outputs.
    Valid { fee_reserve: u64 },
    Invalid,
    /// Non-standard construction the node refuses to relay.
    Obscured,
    /// Shielded elements demand a larger fee reserve than the fee carries.
    InsufficientFeeReserve,
}

pub trait TxValidator: Send {
    fn validate(&self, tx: &Transaction, tip: Height) -> TxValidation;
}

/// Accepts everything; the whole fee above the minimum becomes reserve.
/// Used by tests and step-by-step modes.
pub struct AcceptAllValidator;

impl TxValidator for AcceptAllValidator {
    fn validate(&self, tx: &Transaction, _tip: Height) -> TxValidation {
        let min = mist_pool::min_fee(tx.weight());
        TxValidation::Valid {
            fee_reserve: tx.fee().saturating_sub(min),
        }
    }
}

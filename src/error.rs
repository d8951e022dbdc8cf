//! Error taxonomy.
//!
//! Four classes, kept distinct on purpose:
//! - input rejections ([`RejectReason`]) - returned synchronously, no state
//!   change;
//! - store failures ([`StoreError`]) - infrastructure, bubbled with `?`;
//! - settlement pipeline failures ([`SettlementError`]) - infrastructure
//!   around the worker/supervisor; domain failures never appear here, they
//!   are written to the match record instead;
//! - matcher surface errors ([`MatcherError`]) - rejection or store.

use thiserror::Error;

use crate::core_types::{MatchId, OrderId};
use crate::models::OrderStatus;

/// Synchronous input rejection - malformed, expired, or duplicate order.
/// Never causes a state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("quantity must be positive")]
    ZeroQuantity,

    #[error("order is already expired")]
    AlreadyExpired,

    #[error("duplicate order id: {0}")]
    DuplicateOrder(OrderId),

    #[error("base and quote asset must differ")]
    InvalidPair,

    #[error("commitment hash does not bind the submitted terms")]
    CommitmentMismatch,

    #[error("unknown order: {0}")]
    UnknownOrder(OrderId),

    #[error("order is not owned by the requester")]
    NotOwner,

    #[error("order is already terminal: {0}")]
    AlreadyTerminal(OrderStatus),
}

/// Order/match store failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("match not found: {0}")]
    MatchNotFound(MatchId),

    #[error("duplicate order id: {0}")]
    DuplicateOrder(OrderId),

    #[error("duplicate match id: {0}")]
    DuplicateMatch(MatchId),
}

/// Infrastructure failure inside the settlement pipeline.
///
/// Domain outcomes (proof exhaustion, chain rejection, channel exhaustion)
/// are not errors here - they are recorded on the match and reported as
/// [`crate::settlement::SettlementOutcome`].
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Matcher surface error: a synchronous rejection or a store failure
#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("order rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for MatcherError {
    fn from(err: StoreError) -> Self {
        // A duplicate id surfacing from the store is an input rejection,
        // not an infrastructure fault.
        match err {
            StoreError::DuplicateOrder(id) => {
                MatcherError::Rejected(RejectReason::DuplicateOrder(id))
            }
            other => MatcherError::Store(other),
        }
    }
}

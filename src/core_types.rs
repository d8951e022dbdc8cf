//! Core identifier and scalar types used throughout the system.
//!
//! These are fundamental types used by all modules. They provide
//! semantic meaning and enable future type evolution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// User ID - globally unique party identifier, immutable after assignment
pub type UserId = u64;

/// Quantity in scaled integer units of the base asset
pub type Qty = u64;

/// Price in scaled integer quote units per base unit
pub type Price = u64;

/// Insertion sequence number, assigned by the order book.
///
/// Two orders with identical price and timestamp resolve by `SeqNum`,
/// never arbitrarily.
pub type SeqNum = u64;

/// Unix timestamp in milliseconds
pub type TimestampMs = i64;

/// Price band width in basis points around the limit price
pub type Bps = u32;

/// Current wall-clock time in milliseconds
#[inline]
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// Order ID - opaque, globally unique, supplied by the submitting client.
///
/// ULID-backed: monotonic, sortable, 128-bit, no coordination needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(ulid::Ulid);

impl OrderId {
    /// Generate a fresh OrderId (client side / tests)
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Match ID - unique identifier for a single pairing event,
/// generated by the order book at the instant of the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(ulid::Ulid);

impl MatchId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for MatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MatchId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_id_roundtrip() {
        let id = OrderId::generate();
        let parsed: OrderId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn match_ids_are_unique() {
        let a = MatchId::new();
        let b = MatchId::new();
        assert_ne!(a, b);
    }
}

//! Commitment hashes - one-way bindings of an order's private terms.
//!
//! Clients submit the hash alongside the (privately transported) terms so
//! that matching can later be verified without revealing terms upfront.
//! The settlement pipeline re-derives the hash to check that the terms it
//! was handed are the ones the client committed to.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::models::OrderTerms;

/// SHA-256 commitment over an order's private terms
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitmentHash([u8; 32]);

impl CommitmentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitmentHash({})", hex::encode(self.0))
    }
}

impl Serialize for CommitmentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for CommitmentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("commitment hash must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

/// Compute the commitment hash for a set of order terms.
///
/// Canonical encoding: fixed-order big-endian fields with domain
/// separation, so the binding is stable across versions.
pub fn commit(terms: &OrderTerms) -> CommitmentHash {
    let mut hasher = Sha256::new();
    hasher.update(b"darkmatch.order.v1");
    hasher.update(terms.user_id.to_be_bytes());
    hasher.update(terms.pair.base.as_str().as_bytes());
    hasher.update([b'/']);
    hasher.update(terms.pair.quote.as_str().as_bytes());
    hasher.update([terms.side.as_byte()]);
    hasher.update(terms.qty.to_be_bytes());
    hasher.update(terms.limit_price.to_be_bytes());
    hasher.update(terms.price_band_bps.to_be_bytes());
    hasher.update(terms.expires_at.to_be_bytes());
    CommitmentHash(hasher.finalize().into())
}

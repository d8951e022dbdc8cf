//! External collaborator interfaces consumed by the settlement pipeline.
//!
//! The worker only forwards opaque proofs and treats each collaborator's
//! verdicts as authoritative; none of these traits leak transport details.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commitment::CommitmentHash;
use crate::core_types::{MatchId, OrderId, Qty, TimestampMs, UserId};
use crate::models::{Asset, OrderTerms};

/// Private inputs handed to the proof generator: both orders' full terms,
/// the fills, the commitments they must bind, the fresh cumulative-settled
/// amounts, and the match reference the circuit binds as a uniqueness nonce.
#[derive(Debug, Clone)]
pub struct SettlementWitness {
    pub match_id: MatchId,
    pub buy_terms: OrderTerms,
    pub sell_terms: OrderTerms,
    pub buy_fill: Qty,
    pub sell_fill: Qty,
    pub buy_commitment: CommitmentHash,
    pub sell_commitment: CommitmentHash,
    /// Read fresh from the chain immediately before proving
    pub buy_cumulative_settled: Qty,
    pub sell_cumulative_settled: Qty,
    pub now: TimestampMs,
}

/// The exact public-input vector a proof was generated against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicInputs {
    pub match_id: MatchId,
    pub buy_commitment: CommitmentHash,
    pub sell_commitment: CommitmentHash,
    pub buy_cumulative_settled: Qty,
    pub sell_cumulative_settled: Qty,
    pub buy_fill: Qty,
    pub sell_fill: Qty,
    pub timestamp: TimestampMs,
}

/// Opaque proof plus the public inputs it commits to
#[derive(Debug, Clone)]
pub struct ProofBundle {
    pub proof: Vec<u8>,
    pub public_inputs: PublicInputs,
}

#[derive(Debug, Clone, Error)]
pub enum ProofError {
    #[error("malformed witness: {0}")]
    MalformedWitness(String),

    #[error("proving backend failure: {0}")]
    Backend(String),
}

/// Zero-knowledge proof generator - witness in, proof out
#[async_trait]
pub trait ProofGenerator: Send + Sync {
    async fn prove(&self, witness: &SettlementWitness) -> Result<ProofBundle, ProofError>;
}

/// Commitment state as the chain sees it
#[derive(Debug, Clone)]
pub struct CommitmentState {
    pub commitment: CommitmentHash,
    /// Running total already settled against the order; prevents overfill
    /// across multiple partial settlements
    pub cumulative_settled: Qty,
    pub finalized: bool,
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("no commitment registered for order {0}")]
    UnknownCommitment(OrderId),

    #[error("chain node unavailable: {0}")]
    Unavailable(String),
}

/// Verdict of the on-chain settle operation.
///
/// `Duplicate` means this exact settlement was already applied - callers
/// must treat it as success, never as failure, or a supervisor requeue
/// race would double-fail a settled match.
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    Accepted { reference: String },
    Duplicate,
    /// Authoritative logic rejection (expired, overfill, bad commitment,
    /// bad slippage) - terminal, retrying cannot change it
    Rejected { reason: String },
    /// Transient: node/network. Retried via supervisor requeue
    Unavailable,
}

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Finalized,
    /// Idempotent repeat - success
    AlreadyFinalized,
    Rejected { reason: String },
    Unavailable,
}

/// Smart-contract verifier and custody ledger.
///
/// The chain re-derives the public inputs it trusts (stored commitment,
/// cumulative settled amount) instead of accepting them from the caller;
/// its rejections are truth, not transient noise.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn read_commitment(&self, order_id: OrderId) -> Result<CommitmentState, ChainError>;

    async fn settle(&self, proof: &ProofBundle, fills: (Qty, Qty)) -> SettleOutcome;

    async fn finalize(&self, order_id: OrderId) -> FinalizeOutcome;
}

/// One party's leg of a channel session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationLeg {
    pub party: UserId,
    pub asset: Asset,
    pub amount: Qty,
}

/// A two-party channel allocation.
///
/// `reference` carries the match id so the channel service can deduplicate
/// a re-run pipeline (supervisor requeue after a crash between open and
/// close).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub reference: String,
    pub a: AllocationLeg,
    pub b: AllocationLeg,
}

impl Allocation {
    /// The swapped allocation: each party receives the other's leg
    pub fn swapped(&self) -> Self {
        Self {
            reference: self.reference.clone(),
            a: AllocationLeg {
                party: self.a.party,
                asset: self.b.asset,
                amount: self.b.amount,
            },
            b: AllocationLeg {
                party: self.b.party,
                asset: self.a.asset,
                amount: self.a.amount,
            },
        }
    }
}

pub type SessionId = String;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel service failure: {0}")]
    Service(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// Payment-channel/clearing network: open a session with the agreed
/// allocation, close it with the allocations swapped. The open/close pair
/// is the atomic-swap primitive.
#[async_trait]
pub trait ChannelService: Send + Sync {
    async fn open_session(&self, allocation: &Allocation) -> Result<SessionId, ChannelError>;

    async fn close_session(
        &self,
        session: &SessionId,
        allocation: &Allocation,
    ) -> Result<(), ChannelError>;
}

//! In-process collaborator mocks for development and tests.
//!
//! Behavior mirrors the real collaborators' contracts: the chain re-derives
//! trusted state and rejects duplicates as no-ops, the channel service
//! deduplicates by allocation reference so a re-run pipeline cannot
//! double-swap.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::collaborators::{
    Allocation, ChainClient, ChainError, ChannelError, ChannelService, CommitmentState,
    FinalizeOutcome, ProofBundle, ProofError, ProofGenerator, PublicInputs, SessionId,
    SettleOutcome, SettlementWitness,
};
use crate::commitment::{self, CommitmentHash};
use crate::core_types::{MatchId, OrderId, Qty};
use crate::models::Order;

/// Mock proof generator: checks the witness actually binds its commitments,
/// then emits a digest of the public inputs as the "proof".
#[derive(Default)]
pub struct MockProofGenerator {
    fail_remaining: AtomicU32,
    calls: AtomicU32,
}

impl MockProofGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` prove calls fail with a backend error
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProofGenerator for MockProofGenerator {
    async fn prove(&self, witness: &SettlementWitness) -> Result<ProofBundle, ProofError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(ProofError::Backend("injected prover outage".to_string()));
        }

        if commitment::commit(&witness.buy_terms) != witness.buy_commitment {
            return Err(ProofError::MalformedWitness(
                "buy terms do not bind the buy commitment".to_string(),
            ));
        }
        if commitment::commit(&witness.sell_terms) != witness.sell_commitment {
            return Err(ProofError::MalformedWitness(
                "sell terms do not bind the sell commitment".to_string(),
            ));
        }
        if witness.buy_fill != witness.sell_fill {
            return Err(ProofError::MalformedWitness(
                "fill amounts must agree".to_string(),
            ));
        }
        // Overfill against cumulative state is the chain's check, not the
        // circuit's: a crash-recovery re-prove legitimately sees advanced
        // cumulative amounts and must still produce a proof

        let public_inputs = PublicInputs {
            match_id: witness.match_id,
            buy_commitment: witness.buy_commitment,
            sell_commitment: witness.sell_commitment,
            buy_cumulative_settled: witness.buy_cumulative_settled,
            sell_cumulative_settled: witness.sell_cumulative_settled,
            buy_fill: witness.buy_fill,
            sell_fill: witness.sell_fill,
            timestamp: witness.now,
        };

        let mut hasher = Sha256::new();
        hasher.update(
            serde_json::to_vec(&public_inputs)
                .map_err(|e| ProofError::Backend(e.to_string()))?,
        );
        Ok(ProofBundle {
            proof: hasher.finalize().to_vec(),
            public_inputs,
        })
    }
}

#[derive(Debug, Clone)]
struct ChainEntry {
    commitment: CommitmentHash,
    total_qty: Qty,
    cumulative_settled: Qty,
    finalized: bool,
}

#[derive(Default)]
struct ChainState {
    entries: HashMap<OrderId, ChainEntry>,
    applied: HashSet<MatchId>,
}

/// Mock chain client: custody ledger keyed by order id, settlement applied
/// against re-derived trusted state, duplicate settlements rejected as
/// no-ops.
#[derive(Default)]
pub struct MockChainClient {
    state: Mutex<ChainState>,
    unavailable: AtomicBool,
    settle_calls: AtomicU32,
    next_reference: AtomicU64,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an order's commitment in custody (done by the wallet flow
    /// in production)
    pub async fn register_order(&self, order: &Order) {
        self.state.lock().await.entries.insert(
            order.order_id,
            ChainEntry {
                commitment: order.commitment,
                total_qty: order.qty,
                cumulative_settled: 0,
                finalized: false,
            },
        );
    }

    /// Toggle transient unavailability (network/node outage)
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn settle_calls(&self) -> u32 {
        self.settle_calls.load(Ordering::SeqCst)
    }

    pub async fn cumulative_settled(&self, order_id: OrderId) -> Option<Qty> {
        self.state
            .lock()
            .await
            .entries
            .get(&order_id)
            .map(|e| e.cumulative_settled)
    }

    pub async fn is_finalized(&self, order_id: OrderId) -> bool {
        self.state
            .lock()
            .await
            .entries
            .get(&order_id)
            .map(|e| e.finalized)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn read_commitment(&self, order_id: OrderId) -> Result<CommitmentState, ChainError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ChainError::Unavailable("injected outage".to_string()));
        }
        let state = self.state.lock().await;
        let entry = state
            .entries
            .get(&order_id)
            .ok_or(ChainError::UnknownCommitment(order_id))?;
        Ok(CommitmentState {
            commitment: entry.commitment,
            cumulative_settled: entry.cumulative_settled,
            finalized: entry.finalized,
        })
    }

    async fn settle(&self, proof: &ProofBundle, fills: (Qty, Qty)) -> SettleOutcome {
        self.settle_calls.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return SettleOutcome::Unavailable;
        }

        let pi = &proof.public_inputs;
        let mut state = self.state.lock().await;

        // Duplicate settlement is a no-op, never double-applied
        if state.applied.contains(&pi.match_id) {
            return SettleOutcome::Duplicate;
        }

        if pi.buy_fill != fills.0 || pi.sell_fill != fills.1 {
            return SettleOutcome::Rejected {
                reason: "fill amounts disagree with proof".to_string(),
            };
        }

        let find = |state: &ChainState, commitment: &CommitmentHash| {
            state
                .entries
                .iter()
                .find(|(_, e)| e.commitment == *commitment)
                .map(|(id, e)| (*id, e.clone()))
        };

        let Some((buy_id, buy)) = find(&state, &pi.buy_commitment) else {
            return SettleOutcome::Rejected {
                reason: "unknown buy commitment".to_string(),
            };
        };
        let Some((sell_id, sell)) = find(&state, &pi.sell_commitment) else {
            return SettleOutcome::Rejected {
                reason: "unknown sell commitment".to_string(),
            };
        };

        // Trusted state is re-derived here, not taken from the caller
        if pi.buy_cumulative_settled != buy.cumulative_settled
            || pi.sell_cumulative_settled != sell.cumulative_settled
        {
            return SettleOutcome::Rejected {
                reason: "proof built against stale cumulative state".to_string(),
            };
        }
        if buy.finalized || sell.finalized {
            return SettleOutcome::Rejected {
                reason: "order already finalized".to_string(),
            };
        }
        if buy.cumulative_settled + pi.buy_fill > buy.total_qty
            || sell.cumulative_settled + pi.sell_fill > sell.total_qty
        {
            return SettleOutcome::Rejected {
                reason: "overfill".to_string(),
            };
        }

        if let Some(entry) = state.entries.get_mut(&buy_id) {
            entry.cumulative_settled += pi.buy_fill;
        }
        if let Some(entry) = state.entries.get_mut(&sell_id) {
            entry.cumulative_settled += pi.sell_fill;
        }
        state.applied.insert(pi.match_id);

        let seq = self.next_reference.fetch_add(1, Ordering::SeqCst);
        SettleOutcome::Accepted {
            reference: format!("settle-{seq:06}"),
        }
    }

    async fn finalize(&self, order_id: OrderId) -> FinalizeOutcome {
        if self.unavailable.load(Ordering::SeqCst) {
            return FinalizeOutcome::Unavailable;
        }
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(&order_id) else {
            return FinalizeOutcome::Rejected {
                reason: "unknown order".to_string(),
            };
        };
        if entry.finalized {
            return FinalizeOutcome::AlreadyFinalized;
        }
        if entry.cumulative_settled < entry.total_qty {
            return FinalizeOutcome::Rejected {
                reason: "order not fully settled".to_string(),
            };
        }
        entry.finalized = true;
        FinalizeOutcome::Finalized
    }
}

#[derive(Default)]
struct ChannelState {
    open: HashMap<SessionId, Allocation>,
    closed_refs: HashSet<String>,
}

/// Mock channel service. Sessions are keyed off the allocation reference,
/// so re-opening after a completed swap is idempotent.
#[derive(Default)]
pub struct MockChannelService {
    state: Mutex<ChannelState>,
    fail_open_remaining: AtomicU32,
    fail_close_remaining: AtomicU32,
    open_calls: AtomicU32,
    close_calls: AtomicU32,
    swaps_completed: AtomicU32,
}

impl MockChannelService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.fail_open_remaining.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_closes(&self, n: u32) {
        self.fail_close_remaining.store(n, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn swaps_completed(&self) -> u32 {
        self.swaps_completed.load(Ordering::SeqCst)
    }

    /// Sessions opened but never closed (should be empty after a clean run)
    pub async fn dangling_sessions(&self) -> usize {
        self.state.lock().await.open.len()
    }
}

#[async_trait]
impl ChannelService for MockChannelService {
    async fn open_session(&self, allocation: &Allocation) -> Result<SessionId, ChannelError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_open_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_open_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(ChannelError::Service("injected open failure".to_string()));
        }

        let mut state = self.state.lock().await;
        let session_id = format!("sess-{}", allocation.reference);
        if state.closed_refs.contains(&allocation.reference) {
            // Swap already completed for this reference; hand back the same
            // session so the caller's close becomes a no-op
            return Ok(session_id);
        }
        state.open.insert(session_id.clone(), allocation.clone());
        Ok(session_id)
    }

    async fn close_session(
        &self,
        session: &SessionId,
        allocation: &Allocation,
    ) -> Result<(), ChannelError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_close_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_close_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(ChannelError::Service("injected close failure".to_string()));
        }

        let mut state = self.state.lock().await;
        if state.closed_refs.contains(&allocation.reference) {
            return Ok(());
        }
        let Some(opened) = state.open.remove(session) else {
            return Err(ChannelError::UnknownSession(session.clone()));
        };
        if opened.swapped() != *allocation {
            return Err(ChannelError::Service(
                "close allocation is not the swap of the opened allocation".to_string(),
            ));
        }
        state.closed_refs.insert(allocation.reference.clone());
        self.swaps_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

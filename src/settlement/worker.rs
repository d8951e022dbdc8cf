//! Settlement worker - drives one match through the settlement pipeline.
//!
//! Pipeline: claim -> prove -> chain settle -> channel swap -> finalize ->
//! complete. Transient infrastructure faults retry with capped backoff and
//! never mark the match `Failed`; only authoritative domain rejections and
//! retry exhaustion do. A worker crash at any step leaves the match in
//! `Settling` for the supervisor's stale scan, and every downstream effect
//! is idempotent keyed on the match id, so a re-run converges instead of
//! double-applying.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::collaborators::{
    Allocation, AllocationLeg, ChainClient, ChainError, ChannelError, ChannelService,
    CommitmentState, FinalizeOutcome, ProofBundle, ProofError, ProofGenerator, SessionId,
    SettleOutcome, SettlementWitness,
};
use crate::core_types::{now_ms, MatchId, OrderId};
use crate::error::{SettlementError, StoreError};
use crate::models::{Match, Order};
use crate::store::OrderStore;

/// Retry budgets, backoff shape and per-call timeout for collaborator calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub proof_attempts: u32,
    pub channel_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Every collaborator call is bounded; a timeout counts as transient
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            proof_attempts: 3,
            channel_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Capped exponential delay for the given zero-based attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map(|d| d.min(self.backoff_cap))
            .unwrap_or(self.backoff_cap)
    }
}

/// Terminal failure classification recorded on the match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    ProofGeneration,
    SettlementRejected,
    ChannelFailed,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailReason::ProofGeneration => "proof_generation_failed",
            FailReason::SettlementRejected => "settlement_rejected",
            FailReason::ChannelFailed => "channel_failed",
        }
    }
}

/// What one settlement attempt did to the match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Pipeline ran to completion; match is `Settled`
    Settled,
    /// Another worker holds the claim; nothing done
    ClaimLost,
    /// Chain unreachable; match left in `Settling` for the supervisor
    ChainUnavailable,
    /// Authoritative rejection or retry exhaustion; match is `Failed`
    Failed(FailReason),
}

enum Step<T> {
    Done(T),
    Abort(SettlementOutcome),
}

pub struct SettlementWorker {
    store: Arc<dyn OrderStore>,
    prover: Arc<dyn ProofGenerator>,
    chain: Arc<dyn ChainClient>,
    channel: Arc<dyn ChannelService>,
    policy: RetryPolicy,
}

impl SettlementWorker {
    pub fn new(
        store: Arc<dyn OrderStore>,
        prover: Arc<dyn ProofGenerator>,
        chain: Arc<dyn ChainClient>,
        channel: Arc<dyn ChannelService>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            prover,
            chain,
            channel,
            policy,
        }
    }

    /// Attempt to settle one match end to end.
    ///
    /// Errors are store/plumbing faults only; every collaborator verdict is
    /// folded into the returned outcome.
    pub async fn settle(&self, match_id: MatchId) -> Result<SettlementOutcome, SettlementError> {
        if !self.store.claim_match(match_id).await? {
            debug!(match_id = %match_id, "claim lost, match taken or terminal");
            return Ok(SettlementOutcome::ClaimLost);
        }

        let m = self
            .store
            .get_match(match_id)
            .await?
            .ok_or(StoreError::MatchNotFound(match_id))?;
        let buy = self.load_order(m.buy_order_id).await?;
        let sell = self.load_order(m.sell_order_id).await?;

        let bundle = match self.prove_with_retries(&m, &buy, &sell).await? {
            Step::Done(bundle) => bundle,
            Step::Abort(outcome) => return Ok(outcome),
        };

        let reference = match self.settle_bounded(&bundle, (m.qty, m.qty)).await {
            SettleOutcome::Accepted { reference } => reference,
            SettleOutcome::Duplicate => {
                // Already applied by a previous run of this pipeline
                info!(match_id = %match_id, "settlement already applied on chain");
                format!("duplicate:{match_id}")
            }
            SettleOutcome::Rejected { reason } => {
                warn!(match_id = %match_id, reason = %reason, "chain rejected settlement");
                self.record_failure(match_id, FailReason::SettlementRejected, &reason)
                    .await?;
                return Ok(SettlementOutcome::Failed(FailReason::SettlementRejected));
            }
            SettleOutcome::Unavailable => {
                warn!(match_id = %match_id, "chain unavailable during settle, leaving claim for requeue");
                return Ok(SettlementOutcome::ChainUnavailable);
            }
        };

        if let Step::Abort(outcome) = self.swap_via_channel(&m).await? {
            return Ok(outcome);
        }

        if let Step::Abort(outcome) = self.finalize_filled_orders(&m).await? {
            return Ok(outcome);
        }

        self.store.complete_match(match_id, &reference).await?;
        info!(
            match_id = %match_id,
            pair = %m.pair,
            qty = m.qty,
            price = m.price,
            reference = %reference,
            "match settled"
        );
        Ok(SettlementOutcome::Settled)
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Order, SettlementError> {
        Ok(self
            .store
            .get_order(order_id)
            .await?
            .ok_or(StoreError::OrderNotFound(order_id))?)
    }

    // Bounded collaborator calls. A timeout is transient infrastructure, so
    // each wrapper folds it into the call's own transient shape.

    async fn read_commitment_bounded(
        &self,
        order_id: OrderId,
    ) -> Result<CommitmentState, ChainError> {
        match tokio::time::timeout(
            self.policy.call_timeout,
            self.chain.read_commitment(order_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChainError::Unavailable("call timed out".to_string())),
        }
    }

    async fn prove_bounded(&self, witness: &SettlementWitness) -> Result<ProofBundle, ProofError> {
        match tokio::time::timeout(self.policy.call_timeout, self.prover.prove(witness)).await {
            Ok(result) => result,
            Err(_) => Err(ProofError::Backend("call timed out".to_string())),
        }
    }

    async fn settle_bounded(&self, bundle: &ProofBundle, fills: (u64, u64)) -> SettleOutcome {
        match tokio::time::timeout(self.policy.call_timeout, self.chain.settle(bundle, fills))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => SettleOutcome::Unavailable,
        }
    }

    async fn finalize_bounded(&self, order_id: OrderId) -> FinalizeOutcome {
        match tokio::time::timeout(self.policy.call_timeout, self.chain.finalize(order_id)).await
        {
            Ok(outcome) => outcome,
            Err(_) => FinalizeOutcome::Unavailable,
        }
    }

    async fn open_bounded(&self, allocation: &Allocation) -> Result<SessionId, ChannelError> {
        match tokio::time::timeout(self.policy.call_timeout, self.channel.open_session(allocation))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Service("call timed out".to_string())),
        }
    }

    async fn close_bounded(
        &self,
        session: &SessionId,
        allocation: &Allocation,
    ) -> Result<(), ChannelError> {
        match tokio::time::timeout(
            self.policy.call_timeout,
            self.channel.close_session(session, allocation),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Service("call timed out".to_string())),
        }
    }

    /// Generate the settlement proof, re-reading chain state before each
    /// attempt so the proof always binds fresh cumulative amounts.
    async fn prove_with_retries(
        &self,
        m: &Match,
        buy: &Order,
        sell: &Order,
    ) -> Result<Step<ProofBundle>, SettlementError> {
        let mut last_err = String::new();

        for attempt in 0..self.policy.proof_attempts {
            let buy_state = match self.read_commitment_bounded(buy.order_id).await {
                Ok(state) => state,
                Err(e) => return self.commitment_read_failed(m.match_id, e).await,
            };
            let sell_state = match self.read_commitment_bounded(sell.order_id).await {
                Ok(state) => state,
                Err(e) => return self.commitment_read_failed(m.match_id, e).await,
            };

            let witness = SettlementWitness {
                match_id: m.match_id,
                buy_terms: buy.terms(),
                sell_terms: sell.terms(),
                buy_fill: m.qty,
                sell_fill: m.qty,
                buy_commitment: buy.commitment,
                sell_commitment: sell.commitment,
                buy_cumulative_settled: buy_state.cumulative_settled,
                sell_cumulative_settled: sell_state.cumulative_settled,
                now: now_ms(),
            };

            match self.prove_bounded(&witness).await {
                Ok(bundle) => return Ok(Step::Done(bundle)),
                Err(e) => {
                    warn!(
                        match_id = %m.match_id,
                        attempt,
                        error = %e,
                        "proof generation attempt failed"
                    );
                    last_err = e.to_string();
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
            }
        }

        self.record_failure(m.match_id, FailReason::ProofGeneration, &last_err)
            .await?;
        Ok(Step::Abort(SettlementOutcome::Failed(
            FailReason::ProofGeneration,
        )))
    }

    async fn commitment_read_failed(
        &self,
        match_id: MatchId,
        e: ChainError,
    ) -> Result<Step<ProofBundle>, SettlementError> {
        match e {
            ChainError::Unavailable(_) => {
                warn!(match_id = %match_id, error = %e, "chain unavailable reading commitments");
                Ok(Step::Abort(SettlementOutcome::ChainUnavailable))
            }
            ChainError::UnknownCommitment(_) => {
                self.record_failure(match_id, FailReason::SettlementRejected, &e.to_string())
                    .await?;
                Ok(Step::Abort(SettlementOutcome::Failed(
                    FailReason::SettlementRejected,
                )))
            }
        }
    }

    /// Execute the asset swap: open a channel session with the agreed
    /// allocation, close it with the allocations swapped.
    async fn swap_via_channel(&self, m: &Match) -> Result<Step<()>, SettlementError> {
        let quote_amount = match m.quote_notional() {
            Ok(amount) => amount,
            Err(e) => {
                self.record_failure(m.match_id, FailReason::SettlementRejected, &e.to_string())
                    .await?;
                return Ok(Step::Abort(SettlementOutcome::Failed(
                    FailReason::SettlementRejected,
                )));
            }
        };

        // The buyer brings quote, the seller brings base; closing with the
        // swapped allocation hands each side the other's leg
        let allocation = Allocation {
            reference: m.match_id.to_string(),
            a: AllocationLeg {
                party: m.buyer,
                asset: m.pair.quote,
                amount: quote_amount,
            },
            b: AllocationLeg {
                party: m.seller,
                asset: m.pair.base,
                amount: m.qty,
            },
        };

        let session = match self.open_with_retries(m.match_id, &allocation).await? {
            Step::Done(session) => session,
            Step::Abort(outcome) => return Ok(Step::Abort(outcome)),
        };

        let swapped = allocation.swapped();
        let mut last_err = String::new();
        for attempt in 0..self.policy.channel_attempts {
            match self.close_bounded(&session, &swapped).await {
                Ok(()) => {
                    debug!(match_id = %m.match_id, session = %session, "channel swap closed");
                    return Ok(Step::Done(()));
                }
                Err(e) => {
                    warn!(
                        match_id = %m.match_id,
                        session = %session,
                        attempt,
                        error = %e,
                        "channel close attempt failed"
                    );
                    last_err = e.to_string();
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
            }
        }

        let detail = format!("close of session {session} failed: {last_err}");
        self.record_failure(m.match_id, FailReason::ChannelFailed, &detail)
            .await?;
        Ok(Step::Abort(SettlementOutcome::Failed(
            FailReason::ChannelFailed,
        )))
    }

    async fn open_with_retries(
        &self,
        match_id: MatchId,
        allocation: &Allocation,
    ) -> Result<Step<SessionId>, SettlementError> {
        let mut last_err = String::new();
        for attempt in 0..self.policy.channel_attempts {
            match self.open_bounded(allocation).await {
                Ok(session) => return Ok(Step::Done(session)),
                Err(e) => {
                    warn!(
                        match_id = %match_id,
                        attempt,
                        error = %e,
                        "channel open attempt failed"
                    );
                    last_err = e.to_string();
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
            }
        }

        let detail = format!("session open failed: {last_err}");
        self.record_failure(match_id, FailReason::ChannelFailed, &detail)
            .await?;
        Ok(Step::Abort(SettlementOutcome::Failed(
            FailReason::ChannelFailed,
        )))
    }

    /// Finalize any order this match fully filled, releasing residual
    /// custody on chain. Already-finalized is success; a logic rejection
    /// here does not fail the match since the swap itself completed.
    async fn finalize_filled_orders(&self, m: &Match) -> Result<Step<()>, SettlementError> {
        for order_id in [m.buy_order_id, m.sell_order_id] {
            let order = self.load_order(order_id).await?;
            if !order.is_filled() || order.finalized {
                continue;
            }
            match self.finalize_bounded(order_id).await {
                FinalizeOutcome::Finalized | FinalizeOutcome::AlreadyFinalized => {
                    self.store.mark_order_finalized(order_id).await?;
                    debug!(order_id = %order_id, "order finalized on chain");
                }
                FinalizeOutcome::Rejected { reason } => {
                    // Chain disagrees the order is complete; the swap stands,
                    // so log and move on
                    warn!(order_id = %order_id, reason = %reason, "chain refused finalize");
                }
                FinalizeOutcome::Unavailable => {
                    warn!(order_id = %order_id, "chain unavailable during finalize, leaving claim for requeue");
                    return Ok(Step::Abort(SettlementOutcome::ChainUnavailable));
                }
            }
        }
        Ok(Step::Done(()))
    }

    async fn record_failure(
        &self,
        match_id: MatchId,
        reason: FailReason,
        detail: &str,
    ) -> Result<(), SettlementError> {
        let recorded = if detail.is_empty() {
            reason.as_str().to_string()
        } else {
            format!("{}: {}", reason.as_str(), detail)
        };
        self.store.fail_match(match_id, &recorded).await?;
        Ok(())
    }
}

//! Order/Match store - the source of truth and crash-recovery point.
//!
//! Two logical tables: orders keyed by `OrderId`, matches keyed by
//! `MatchId` (foreign-keyed to two order ids). Every settlement state
//! transition is a single atomic CAS-style write, so a worker crash leaves
//! a match in `Settling`, recoverable by the supervisor's stale scan.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core_types::{now_ms, MatchId, OrderId, TimestampMs};
use crate::error::StoreError;
use crate::models::{Match, MatchStatus, Order};

/// Durable record of orders and matches.
///
/// The in-memory implementation below backs tests and the demo binary;
/// deployments plug a database-backed implementation behind the same trait.
/// The CAS methods return `false` when the expected current state did not
/// hold - losing such a race is not an error.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order; fails on duplicate id
    async fn insert_order(&self, order: &Order) -> Result<(), StoreError>;

    /// Upsert an order's mutable state (fills, status, finalized)
    async fn put_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError>;

    /// Insert a newly created match in `Pending`; fails on duplicate id
    async fn insert_match(&self, m: &Match) -> Result<(), StoreError>;

    async fn get_match(&self, match_id: MatchId) -> Result<Option<Match>, StoreError>;

    /// All matches referencing an order (either side), in creation order
    async fn matches_for(&self, order_id: OrderId) -> Result<Vec<Match>, StoreError>;

    /// Atomic claim: `Pending -> Settling` iff currently `Pending`.
    /// Exactly one of any number of racing claimants succeeds.
    async fn claim_match(&self, match_id: MatchId) -> Result<bool, StoreError>;

    /// `Settling -> Settled`, recording the settlement reference
    async fn complete_match(&self, match_id: MatchId, reference: &str)
        -> Result<bool, StoreError>;

    /// `Settling -> Failed`, recording the terminal reason
    async fn fail_match(&self, match_id: MatchId, reason: &str) -> Result<bool, StoreError>;

    /// `Settling -> Pending` - the supervisor's stale-claim recovery, the
    /// only sanctioned path back out of `Settling`
    async fn requeue_match(&self, match_id: MatchId) -> Result<bool, StoreError>;

    /// Record that a fully filled order was finalized on-chain
    async fn mark_order_finalized(&self, order_id: OrderId) -> Result<(), StoreError>;

    /// Matches stuck in `Settling` since before `cutoff` (crashed worker)
    async fn stale_settling(&self, cutoff: TimestampMs) -> Result<Vec<MatchId>, StoreError>;

    /// Matches still `Pending` since before `cutoff` (lost stream delivery)
    async fn stale_pending(&self, cutoff: TimestampMs) -> Result<Vec<MatchId>, StoreError>;
}

/// In-memory store. State transitions take the write lock for the whole
/// read-check-write, which is what makes `claim_match` exclusive.
#[derive(Default)]
pub struct MemoryStore {
    orders: RwLock<HashMap<OrderId, Order>>,
    matches: RwLock<HashMap<MatchId, Match>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// CAS helper: apply `update` iff the match exists and is in `expect`
    async fn update_match_if<F>(
        &self,
        match_id: MatchId,
        expect: MatchStatus,
        update: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Match),
    {
        let mut matches = self.matches.write().await;
        let Some(m) = matches.get_mut(&match_id) else {
            return Err(StoreError::MatchNotFound(match_id));
        };
        if m.status != expect {
            return Ok(false);
        }
        update(m);
        m.updated_at = now_ms();
        Ok(true)
    }

    async fn stale_matches(
        &self,
        status: MatchStatus,
        cutoff: TimestampMs,
    ) -> Vec<MatchId> {
        let matches = self.matches.read().await;
        let mut stale: Vec<&Match> = matches
            .values()
            .filter(|m| m.status == status && m.updated_at <= cutoff)
            .collect();
        // Deterministic order: oldest first, id as tie-breaker
        stale.sort_by_key(|m| (m.updated_at, m.match_id));
        stale.iter().map(|m| m.match_id).collect()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.order_id) {
            return Err(StoreError::DuplicateOrder(order.order_id));
        }
        orders.insert(order.order_id, order.clone());
        Ok(())
    }

    async fn put_order(&self, order: &Order) -> Result<(), StoreError> {
        self.orders
            .write()
            .await
            .insert(order.order_id, order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().await.get(&order_id).cloned())
    }

    async fn insert_match(&self, m: &Match) -> Result<(), StoreError> {
        let mut matches = self.matches.write().await;
        if matches.contains_key(&m.match_id) {
            return Err(StoreError::DuplicateMatch(m.match_id));
        }
        matches.insert(m.match_id, m.clone());
        Ok(())
    }

    async fn get_match(&self, match_id: MatchId) -> Result<Option<Match>, StoreError> {
        Ok(self.matches.read().await.get(&match_id).cloned())
    }

    async fn matches_for(&self, order_id: OrderId) -> Result<Vec<Match>, StoreError> {
        let matches = self.matches.read().await;
        let mut found: Vec<Match> = matches
            .values()
            .filter(|m| m.buy_order_id == order_id || m.sell_order_id == order_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.created_at, m.match_id));
        Ok(found)
    }

    async fn claim_match(&self, match_id: MatchId) -> Result<bool, StoreError> {
        self.update_match_if(match_id, MatchStatus::Pending, |m| {
            m.status = MatchStatus::Settling;
        })
        .await
    }

    async fn complete_match(
        &self,
        match_id: MatchId,
        reference: &str,
    ) -> Result<bool, StoreError> {
        self.update_match_if(match_id, MatchStatus::Settling, |m| {
            m.status = MatchStatus::Settled;
            m.settle_reference = Some(reference.to_string());
            m.settlement_error = None;
        })
        .await
    }

    async fn fail_match(&self, match_id: MatchId, reason: &str) -> Result<bool, StoreError> {
        self.update_match_if(match_id, MatchStatus::Settling, |m| {
            m.status = MatchStatus::Failed;
            m.settlement_error = Some(reason.to_string());
        })
        .await
    }

    async fn requeue_match(&self, match_id: MatchId) -> Result<bool, StoreError> {
        self.update_match_if(match_id, MatchStatus::Settling, |m| {
            m.status = MatchStatus::Pending;
            m.requeues += 1;
        })
        .await
    }

    async fn mark_order_finalized(&self, order_id: OrderId) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        let Some(order) = orders.get_mut(&order_id) else {
            return Err(StoreError::OrderNotFound(order_id));
        };
        order.finalized = true;
        Ok(())
    }

    async fn stale_settling(&self, cutoff: TimestampMs) -> Result<Vec<MatchId>, StoreError> {
        Ok(self.stale_matches(MatchStatus::Settling, cutoff).await)
    }

    async fn stale_pending(&self, cutoff: TimestampMs) -> Result<Vec<MatchId>, StoreError> {
        Ok(self.stale_matches(MatchStatus::Pending, cutoff).await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::commitment;
    use crate::models::{Asset, OrderTerms, Side, TradingPair};

    fn make_order(user_id: u64) -> Order {
        let terms = OrderTerms {
            user_id,
            pair: TradingPair::new(Asset::Eth, Asset::Usdt),
            side: Side::Buy,
            qty: 100,
            limit_price: 2000,
            price_band_bps: 200,
            expires_at: now_ms() + 60_000,
        };
        let commitment = commitment::commit(&terms);
        Order::new(OrderId::generate(), terms, commitment, now_ms())
    }

    fn make_match(buy: &Order, sell: &Order) -> Match {
        Match::new(
            buy.pair,
            buy.order_id,
            sell.order_id,
            buy.user_id,
            sell.user_id,
            100,
            2010,
            now_ms(),
        )
    }

    #[tokio::test]
    async fn insert_order_rejects_duplicate() {
        let store = MemoryStore::new();
        let order = make_order(1);
        store.insert_order(&order).await.unwrap();
        let err = store.insert_order(&order).await.unwrap_err();
        assert_eq!(err, StoreError::DuplicateOrder(order.order_id));
    }

    #[tokio::test]
    async fn claim_is_exclusive_under_concurrency() {
        let store = Arc::new(MemoryStore::new());
        let buy = make_order(1);
        let sell = make_order(2);
        let m = make_match(&buy, &sell);
        store.insert_match(&m).await.unwrap();

        let mut claims = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = m.match_id;
            claims.push(tokio::spawn(async move { store.claim_match(id).await }));
        }

        let mut won = 0;
        for claim in claims {
            if claim.await.unwrap().unwrap() {
                won += 1;
            }
        }
        assert_eq!(won, 1);

        let stored = store.get_match(m.match_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Settling);
    }

    #[tokio::test]
    async fn settling_transitions() {
        let store = MemoryStore::new();
        let m = make_match(&make_order(1), &make_order(2));
        store.insert_match(&m).await.unwrap();

        // Cannot complete or fail before claiming
        assert!(!store.complete_match(m.match_id, "ref").await.unwrap());
        assert!(!store.fail_match(m.match_id, "nope").await.unwrap());

        assert!(store.claim_match(m.match_id).await.unwrap());
        assert!(store.complete_match(m.match_id, "0xabc").await.unwrap());

        let stored = store.get_match(m.match_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Settled);
        assert_eq!(stored.settle_reference.as_deref(), Some("0xabc"));

        // Terminal: no further transitions
        assert!(!store.claim_match(m.match_id).await.unwrap());
        assert!(!store.requeue_match(m.match_id).await.unwrap());
        assert!(!store.fail_match(m.match_id, "late").await.unwrap());
    }

    #[tokio::test]
    async fn requeue_only_from_settling() {
        let store = MemoryStore::new();
        let m = make_match(&make_order(1), &make_order(2));
        store.insert_match(&m).await.unwrap();

        assert!(!store.requeue_match(m.match_id).await.unwrap());
        assert!(store.claim_match(m.match_id).await.unwrap());
        assert!(store.requeue_match(m.match_id).await.unwrap());

        let stored = store.get_match(m.match_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Pending);
        assert_eq!(stored.requeues, 1);
    }

    #[tokio::test]
    async fn stale_scans_filter_by_status_and_age() {
        let store = MemoryStore::new();
        let m1 = make_match(&make_order(1), &make_order(2));
        let m2 = make_match(&make_order(3), &make_order(4));
        store.insert_match(&m1).await.unwrap();
        store.insert_match(&m2).await.unwrap();
        store.claim_match(m2.match_id).await.unwrap();

        let future = now_ms() + 1_000;
        assert_eq!(store.stale_pending(future).await.unwrap(), vec![m1.match_id]);
        assert_eq!(
            store.stale_settling(future).await.unwrap(),
            vec![m2.match_id]
        );

        // Nothing is stale against a cutoff in the past
        let past = now_ms() - 60_000;
        assert!(store.stale_pending(past).await.unwrap().is_empty());
        assert!(store.stale_settling(past).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn matches_for_returns_both_sides() {
        let store = MemoryStore::new();
        let buy = make_order(1);
        let sell = make_order(2);
        let m = make_match(&buy, &sell);
        store.insert_match(&m).await.unwrap();

        assert_eq!(store.matches_for(buy.order_id).await.unwrap().len(), 1);
        assert_eq!(store.matches_for(sell.order_id).await.unwrap().len(), 1);
        assert!(store
            .matches_for(OrderId::generate())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn mark_finalized() {
        let store = MemoryStore::new();
        let order = make_order(1);
        store.insert_order(&order).await.unwrap();
        store.mark_order_finalized(order.order_id).await.unwrap();
        assert!(store.get_order(order.order_id).await.unwrap().unwrap().finalized);

        let err = store
            .mark_order_finalized(OrderId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OrderNotFound(_)));
    }
}

//! Matcher - the order submission surface.
//!
//! One logical writer per trading pair: each pair's book sits behind its
//! own async mutex, held across validate-match-persist so that price-time
//! priority and the no-overfill invariant hold under concurrent
//! submission. Different pairs are processed fully in parallel.
//!
//! Newly created matches are persisted first, then pushed onto the match
//! stream. Delivery is at-least-once: if the push is lost, the supervisor's
//! pending scan re-dispatches the match; the store's atomic claim makes
//! duplicate delivery harmless.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::commitment::CommitmentHash;
use crate::core_types::{now_ms, MatchId, OrderId, UserId};
use crate::engine::MatchingEngine;
use crate::error::{MatcherError, RejectReason};
use crate::models::{Match, Order, OrderStatus, OrderTerms};
use crate::orderbook::OrderBook;
use crate::store::OrderStore;

/// A client order submission: terms plus the client-computed commitment
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub order_id: OrderId,
    pub terms: OrderTerms,
    pub commitment: CommitmentHash,
}

impl SubmitRequest {
    pub fn new(order_id: OrderId, terms: OrderTerms, commitment: CommitmentHash) -> Self {
        Self {
            order_id,
            terms,
            commitment,
        }
    }
}

/// Acknowledgement returned to the submitter
#[derive(Debug)]
pub struct SubmitAck {
    /// The accepted order with its post-matching fill state
    pub order: Order,
    /// Matches produced synchronously by this submission
    pub matches: Vec<Match>,
}

pub struct Matcher {
    store: Arc<dyn OrderStore>,
    books: DashMap<crate::models::TradingPair, Arc<Mutex<OrderBook>>>,
    match_tx: mpsc::Sender<MatchId>,
}

impl Matcher {
    pub fn new(store: Arc<dyn OrderStore>, match_tx: mpsc::Sender<MatchId>) -> Self {
        Self {
            store,
            books: DashMap::new(),
            match_tx,
        }
    }

    fn book_for(&self, pair: crate::models::TradingPair) -> Arc<Mutex<OrderBook>> {
        self.books
            .entry(pair)
            .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new(pair))))
            .clone()
    }

    /// Submit an order: validate, match synchronously, persist, emit.
    ///
    /// All matches produced are persisted and emitted before this returns.
    pub async fn submit_order(&self, req: SubmitRequest) -> Result<SubmitAck, MatcherError> {
        if !req.terms.pair.is_valid() {
            return Err(RejectReason::InvalidPair.into());
        }

        let now = now_ms();
        let order = Order::new(req.order_id, req.terms, req.commitment, now);
        let book = self.book_for(order.pair);

        // Pair writer lock held across validate + match + persist
        let mut book = book.lock().await;

        MatchingEngine::validate(&book, &order, now)?;

        // Reserve the id before matching; a duplicate from a racing submit
        // on another pair surfaces here as a rejection
        self.store.insert_order(&order).await?;

        let result = MatchingEngine::process(&mut book, order, now);

        // Persist the incoming order's final state, every counterparty the
        // scan touched, and the new matches - then emit
        self.store.put_order(&result.order).await?;
        for touched in &result.touched {
            self.store.put_order(touched).await?;
        }
        for expired in &result.expired {
            self.store.put_order(expired).await?;
        }
        for m in &result.fills {
            self.store.insert_match(m).await?;
        }

        drop(book);

        for m in &result.fills {
            if let Err(e) = self.match_tx.send(m.match_id).await {
                // Match stays Pending; the supervisor's pending scan will
                // re-dispatch it
                warn!(match_id = %m.match_id, error = %e, "match stream push failed");
            }
        }

        info!(
            order_id = %result.order.order_id,
            pair = %result.order.pair,
            fills = result.fills.len(),
            status = %result.order.status,
            "order accepted"
        );

        Ok(SubmitAck {
            order: result.order,
            matches: result.fills,
        })
    }

    /// Cancel an order's unfilled remainder.
    ///
    /// Matches already produced - including any currently `Settling` - are
    /// not affected.
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
        requester: UserId,
    ) -> Result<Order, MatcherError> {
        let Some(stored) = self.store.get_order(order_id).await? else {
            return Err(RejectReason::UnknownOrder(order_id).into());
        };
        if stored.user_id != requester {
            return Err(RejectReason::NotOwner.into());
        }
        if stored.status.is_terminal() {
            return Err(RejectReason::AlreadyTerminal(stored.status).into());
        }

        let book = self.book_for(stored.pair);
        let mut book = book.lock().await;

        // Remove the remainder from the book if it rests there; fall back
        // to the stored copy when it does not (e.g. lazily expired)
        let mut order = book.remove_order_by_id(order_id).unwrap_or(stored);
        order.status = OrderStatus::Cancelled;
        self.store.put_order(&order).await?;

        info!(order_id = %order.order_id, filled_qty = order.filled_qty, "order cancelled");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment;
    use crate::error::StoreError;
    use crate::models::{Asset, MatchStatus, Side, TradingPair};
    use crate::store::MemoryStore;

    fn pair() -> TradingPair {
        TradingPair::new(Asset::Eth, Asset::Usdt)
    }

    fn request(user_id: u64, side: Side, qty: u64, limit: u64, band: u32) -> SubmitRequest {
        let terms = OrderTerms {
            user_id,
            pair: pair(),
            side,
            qty,
            limit_price: limit,
            price_band_bps: band,
            expires_at: now_ms() + 60_000,
        };
        SubmitRequest::new(OrderId::generate(), terms, commitment::commit(&terms))
    }

    fn setup() -> (Matcher, Arc<MemoryStore>, mpsc::Receiver<MatchId>) {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(64);
        (Matcher::new(store.clone(), tx), store, rx)
    }

    #[tokio::test]
    async fn submit_persists_and_emits_matches() {
        let (matcher, store, mut rx) = setup();

        let sell = request(1, Side::Sell, 100, 2010, 200);
        matcher.submit_order(sell.clone()).await.unwrap();

        let buy = request(2, Side::Buy, 100, 2000, 200);
        let ack = matcher.submit_order(buy).await.unwrap();

        assert_eq!(ack.matches.len(), 1);
        let m = &ack.matches[0];
        assert_eq!(m.qty, 100);
        assert_eq!(m.price, 2010);

        // Persisted in Pending, both orders Filled
        let stored = store.get_match(m.match_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Pending);
        let sell_order = store.get_order(sell.order_id).await.unwrap().unwrap();
        assert_eq!(sell_order.status, OrderStatus::Filled);
        assert_eq!(ack.order.status, OrderStatus::Filled);

        // Emitted on the stream before submit returned
        assert_eq!(rx.recv().await.unwrap(), m.match_id);
    }

    #[tokio::test]
    async fn duplicate_order_id_rejected_with_no_state_change() {
        let (matcher, store, _rx) = setup();

        let req = request(1, Side::Buy, 10, 100, 0);
        matcher.submit_order(req.clone()).await.unwrap();

        let err = matcher.submit_order(req.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            MatcherError::Rejected(RejectReason::DuplicateOrder(_))
        ));

        let stored = store.get_order(req.order_id).await.unwrap().unwrap();
        assert_eq!(stored.filled_qty, 0);
    }

    #[tokio::test]
    async fn zero_quantity_rejected_without_state() {
        let (matcher, store, _rx) = setup();

        let req = request(1, Side::Buy, 0, 100, 0);
        let id = req.order_id;
        let err = matcher.submit_order(req).await.unwrap_err();
        assert!(matches!(
            err,
            MatcherError::Rejected(RejectReason::ZeroQuantity)
        ));
        assert!(store.get_order(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_pair_rejected() {
        let (matcher, _store, _rx) = setup();

        let mut req = request(1, Side::Buy, 10, 100, 0);
        req.terms.pair = TradingPair::new(Asset::Btc, Asset::Btc);
        let err = matcher.submit_order(req).await.unwrap_err();
        assert!(matches!(
            err,
            MatcherError::Rejected(RejectReason::InvalidPair)
        ));
    }

    #[tokio::test]
    async fn cancel_after_partial_fill_keeps_fills() {
        let (matcher, store, _rx) = setup();

        let buy = request(1, Side::Buy, 100, 100, 0);
        matcher.submit_order(buy.clone()).await.unwrap();
        matcher
            .submit_order(request(2, Side::Sell, 60, 100, 0))
            .await
            .unwrap();

        let cancelled = matcher.cancel_order(buy.order_id, 1).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.filled_qty, 60);

        // The fill survives cancellation
        let matches = store.matches_for(buy.order_id).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].qty, 60);

        // Cancelling again is a terminal-state rejection
        let err = matcher.cancel_order(buy.order_id, 1).await.unwrap_err();
        assert!(matches!(
            err,
            MatcherError::Rejected(RejectReason::AlreadyTerminal(OrderStatus::Cancelled))
        ));
    }

    #[tokio::test]
    async fn cancel_rejects_wrong_owner_and_unknown() {
        let (matcher, _store, _rx) = setup();

        let req = request(1, Side::Buy, 10, 100, 0);
        matcher.submit_order(req.clone()).await.unwrap();

        let err = matcher.cancel_order(req.order_id, 2).await.unwrap_err();
        assert!(matches!(err, MatcherError::Rejected(RejectReason::NotOwner)));

        let err = matcher
            .cancel_order(OrderId::generate(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MatcherError::Rejected(RejectReason::UnknownOrder(_))
        ));
    }

    #[tokio::test]
    async fn store_duplicate_maps_to_rejection() {
        let err: MatcherError = StoreError::DuplicateOrder(OrderId::generate()).into();
        assert!(matches!(
            err,
            MatcherError::Rejected(RejectReason::DuplicateOrder(_))
        ));
    }
}

//! Matching Engine - order validation, band-aware matching, fills
//!
//! The engine handles:
//! 1. Validating incoming orders at the boundary
//! 2. Matching against the opposite side with price-time priority
//! 3. Producing `Match` records and updating fill state
//!
//! Price bands make compatibility non-monotonic in the limit price (a
//! worse-priced resting order can still be the only compatible one), so the
//! scan walks every level in priority order and skips incompatible
//! candidates instead of breaking early.

use tracing::debug;

use crate::core_types::{OrderId, Price, TimestampMs, UserId};
use crate::error::RejectReason;
use crate::models::{Match, Order, OrderStatus, Side};
use crate::orderbook::OrderBook;

/// Result of processing one incoming order
#[derive(Debug)]
pub struct SubmitResult {
    /// The incoming order with final fill state and status
    pub order: Order,
    /// Matches produced, in creation order
    pub fills: Vec<Match>,
    /// Resting counterparty orders whose fill state changed (final copies)
    pub touched: Vec<Order>,
    /// Resting orders discovered expired during the scan and removed
    pub expired: Vec<Order>,
}

/// Matching engine that processes orders against a single pair's book
pub struct MatchingEngine;

impl MatchingEngine {
    /// Boundary validation. Rejections are synchronous and cause no state
    /// change anywhere.
    pub fn validate(book: &OrderBook, order: &Order, now: TimestampMs) -> Result<(), RejectReason> {
        if !order.pair.is_valid() {
            return Err(RejectReason::InvalidPair);
        }
        if order.qty == 0 {
            return Err(RejectReason::ZeroQuantity);
        }
        if order.is_expired(now) {
            return Err(RejectReason::AlreadyExpired);
        }
        if book.contains(order.order_id) {
            return Err(RejectReason::DuplicateOrder(order.order_id));
        }
        if !order.commitment_binds_terms() {
            return Err(RejectReason::CommitmentMismatch);
        }
        Ok(())
    }

    /// Validate, then match. Matches are produced synchronously before this
    /// returns; any unfilled remainder rests in the book.
    pub fn submit(
        book: &mut OrderBook,
        order: Order,
        now: TimestampMs,
    ) -> Result<SubmitResult, RejectReason> {
        Self::validate(book, &order, now)?;
        Ok(Self::process(book, order, now))
    }

    /// Match a pre-validated order against the book.
    ///
    /// # Flow
    /// 1. Scan the opposite side in price-time priority order
    /// 2. Fill against each compatible candidate, `min(remaining, remaining)`
    /// 3. Rest any remainder; a fully filled order never rests
    pub fn process(book: &mut OrderBook, mut order: Order, now: TimestampMs) -> SubmitResult {
        order.seq = book.next_seq();

        let mut result = SubmitResult {
            fills: Vec::new(),
            touched: Vec::new(),
            expired: Vec::new(),
            // placeholder, replaced below once fill state is final
            order: order.clone(),
        };

        match order.side {
            Side::Buy => Self::match_buy(book, &mut order, now, &mut result),
            Side::Sell => Self::match_sell(book, &mut order, now, &mut result),
        }

        if order.is_filled() {
            order.status = OrderStatus::Filled;
        } else if order.filled_qty > 0 {
            order.status = OrderStatus::PartiallyFilled;
            book.rest_order(order.clone());
        } else {
            book.rest_order(order.clone());
        }

        debug!(
            order_id = %order.order_id,
            fills = result.fills.len(),
            filled_qty = order.filled_qty,
            status = %order.status,
            "order processed"
        );

        result.order = order;
        result
    }

    /// Match an incoming buy against asks (lowest limit price first)
    fn match_buy(book: &mut OrderBook, buy: &mut Order, now: TimestampMs, out: &mut SubmitResult) {
        let prices: Vec<Price> = book.asks().keys().copied().collect();

        for price in prices {
            if buy.is_filled() {
                break;
            }
            let mut removed_ids: Vec<OrderId> = Vec::new();
            let mut level_empty = false;

            if let Some(orders) = book.asks_mut().get_mut(&price) {
                let mut i = 0;
                while i < orders.len() {
                    if buy.is_filled() {
                        break;
                    }

                    let resting = &mut orders[i];

                    // Lazy expiry: sweep dead orders out of the way
                    if resting.is_expired(now) {
                        if let Some(mut gone) = orders.remove(i) {
                            gone.status = OrderStatus::Expired;
                            removed_ids.push(gone.order_id);
                            out.expired.push(gone);
                        }
                        continue;
                    }

                    // Self-matching is disallowed: skip to the next candidate
                    if resting.user_id == buy.user_id {
                        i += 1;
                        continue;
                    }

                    // Band overlap: buy.max >= sell.min, else never paired
                    if buy.max_price() < resting.min_price() {
                        i += 1;
                        continue;
                    }

                    let fill = buy.remaining_qty().min(resting.remaining_qty());
                    if fill == 0 {
                        break;
                    }

                    // Matched price is the resting order's limit price
                    let match_price = resting.limit_price;
                    buy.filled_qty += fill;
                    resting.filled_qty += fill;
                    resting.status = if resting.is_filled() {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::PartiallyFilled
                    };

                    out.fills.push(Match::new(
                        buy.pair,
                        buy.order_id,
                        resting.order_id,
                        buy.user_id,
                        resting.user_id,
                        fill,
                        match_price,
                        now,
                    ));

                    if resting.is_filled() {
                        if let Some(gone) = orders.remove(i) {
                            removed_ids.push(gone.order_id);
                            out.touched.push(gone);
                        }
                    } else {
                        out.touched.push(resting.clone());
                        i += 1;
                    }
                }
                level_empty = orders.is_empty();
            }

            if level_empty {
                book.asks_mut().remove(&price);
            }
            for id in removed_ids {
                book.remove_from_index(id);
            }
        }
    }

    /// Match an incoming sell against bids (highest limit price first)
    fn match_sell(
        book: &mut OrderBook,
        sell: &mut Order,
        now: TimestampMs,
        out: &mut SubmitResult,
    ) {
        let keys: Vec<Price> = book.bids().keys().copied().collect();

        for key in keys {
            if sell.is_filled() {
                break;
            }
            let mut removed_ids: Vec<OrderId> = Vec::new();
            let mut level_empty = false;

            if let Some(orders) = book.bids_mut().get_mut(&key) {
                let mut i = 0;
                while i < orders.len() {
                    if sell.is_filled() {
                        break;
                    }

                    let resting = &mut orders[i];

                    if resting.is_expired(now) {
                        if let Some(mut gone) = orders.remove(i) {
                            gone.status = OrderStatus::Expired;
                            removed_ids.push(gone.order_id);
                            out.expired.push(gone);
                        }
                        continue;
                    }

                    if resting.user_id == sell.user_id {
                        i += 1;
                        continue;
                    }

                    // Band overlap: buy.max >= sell.min (resting is the buy)
                    if resting.max_price() < sell.min_price() {
                        i += 1;
                        continue;
                    }

                    let fill = sell.remaining_qty().min(resting.remaining_qty());
                    if fill == 0 {
                        break;
                    }

                    let match_price = resting.limit_price;
                    sell.filled_qty += fill;
                    resting.filled_qty += fill;
                    resting.status = if resting.is_filled() {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::PartiallyFilled
                    };

                    out.fills.push(Match::new(
                        sell.pair,
                        resting.order_id,
                        sell.order_id,
                        resting.user_id,
                        sell.user_id,
                        fill,
                        match_price,
                        now,
                    ));

                    if resting.is_filled() {
                        if let Some(gone) = orders.remove(i) {
                            removed_ids.push(gone.order_id);
                            out.touched.push(gone);
                        }
                    } else {
                        out.touched.push(resting.clone());
                        i += 1;
                    }
                }
                level_empty = orders.is_empty();
            }

            if level_empty {
                book.bids_mut().remove(&key);
            }
            for id in removed_ids {
                book.remove_from_index(id);
            }
        }
    }

    /// Cancel a resting order. Affects only the unfilled remainder; matches
    /// already produced are untouched.
    pub fn cancel(
        book: &mut OrderBook,
        order_id: OrderId,
        requester: UserId,
    ) -> Result<Order, RejectReason> {
        let resting = book.get(order_id).ok_or(RejectReason::UnknownOrder(order_id))?;
        if resting.user_id != requester {
            return Err(RejectReason::NotOwner);
        }

        let mut order = book
            .remove_order_by_id(order_id)
            .ok_or(RejectReason::UnknownOrder(order_id))?;
        order.status = OrderStatus::Cancelled;
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment;
    use crate::core_types::{now_ms, OrderId, Qty};
    use crate::models::{Asset, MatchStatus, OrderTerms, TradingPair};

    fn pair() -> TradingPair {
        TradingPair::new(Asset::Eth, Asset::Usdt)
    }

    fn order_with_expiry(
        user_id: u64,
        side: Side,
        qty: Qty,
        limit: Price,
        band_bps: u32,
        expires_at: TimestampMs,
    ) -> Order {
        let terms = OrderTerms {
            user_id,
            pair: pair(),
            side,
            qty,
            limit_price: limit,
            price_band_bps: band_bps,
            expires_at,
        };
        let commitment = commitment::commit(&terms);
        Order::new(OrderId::generate(), terms, commitment, now_ms())
    }

    fn make_order(user_id: u64, side: Side, qty: Qty, limit: Price, band_bps: u32) -> Order {
        order_with_expiry(user_id, side, qty, limit, band_bps, now_ms() + 60_000)
    }

    #[test]
    fn resting_order_produces_no_fills() {
        let mut book = OrderBook::new(pair());
        let result =
            MatchingEngine::submit(&mut book, make_order(1, Side::Buy, 10, 100, 0), now_ms())
                .unwrap();

        assert!(result.fills.is_empty());
        assert_eq!(result.order.status, OrderStatus::Pending);
        assert_eq!(book.best_bid(), Some(100));
    }

    #[test]
    fn full_match_at_resting_price() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        MatchingEngine::submit(&mut book, make_order(1, Side::Sell, 10, 100, 0), now).unwrap();
        let result =
            MatchingEngine::submit(&mut book, make_order(2, Side::Buy, 10, 100, 0), now).unwrap();

        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].qty, 10);
        assert_eq!(result.fills[0].price, 100);
        assert_eq!(result.fills[0].status, MatchStatus::Pending);
        assert_eq!(result.order.status, OrderStatus::Filled);
        // Fully filled incoming never rests
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn price_improvement_accrues_to_incoming() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        // Resting sell at 100; incoming buy limit 105 pays 100
        MatchingEngine::submit(&mut book, make_order(1, Side::Sell, 10, 100, 0), now).unwrap();
        let result =
            MatchingEngine::submit(&mut book, make_order(2, Side::Buy, 10, 105, 0), now).unwrap();

        assert_eq!(result.fills[0].price, 100);
    }

    #[test]
    fn price_priority_lowest_ask_first() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        MatchingEngine::submit(&mut book, make_order(1, Side::Sell, 5, 102, 0), now).unwrap();
        MatchingEngine::submit(&mut book, make_order(2, Side::Sell, 5, 100, 0), now).unwrap();
        MatchingEngine::submit(&mut book, make_order(3, Side::Sell, 5, 101, 0), now).unwrap();

        let result =
            MatchingEngine::submit(&mut book, make_order(4, Side::Buy, 12, 102, 0), now).unwrap();

        assert_eq!(result.fills.len(), 3);
        assert_eq!(result.fills[0].price, 100);
        assert_eq!(result.fills[1].price, 101);
        assert_eq!(result.fills[2].price, 102);
    }

    #[test]
    fn fifo_at_same_price() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        let first = make_order(1, Side::Sell, 5, 100, 0);
        let first_id = first.order_id;
        MatchingEngine::submit(&mut book, first, now).unwrap();
        MatchingEngine::submit(&mut book, make_order(2, Side::Sell, 5, 100, 0), now).unwrap();

        let result =
            MatchingEngine::submit(&mut book, make_order(3, Side::Buy, 3, 100, 0), now).unwrap();

        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].sell_order_id, first_id);
    }

    #[test]
    fn band_boundary_never_matches() {
        // Buy max 99 vs sell min 100: no pairing, both rest
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        MatchingEngine::submit(&mut book, make_order(1, Side::Sell, 10, 100, 0), now).unwrap();
        let result =
            MatchingEngine::submit(&mut book, make_order(2, Side::Buy, 10, 99, 0), now).unwrap();

        assert!(result.fills.is_empty());
        assert_eq!(book.best_bid(), Some(99));
        assert_eq!(book.best_ask(), Some(100));
    }

    #[test]
    fn overlapping_bands_match() {
        // Banded pricing: buy 2000 +/-2% (max 2040) vs resting
        // sell 2010 +/-2% (min 1969) -> match 100 @ 2010
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        MatchingEngine::submit(&mut book, make_order(1, Side::Sell, 100, 2010, 200), now).unwrap();
        let result =
            MatchingEngine::submit(&mut book, make_order(2, Side::Buy, 100, 2000, 200), now)
                .unwrap();

        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].qty, 100);
        assert_eq!(result.fills[0].price, 2010);
        assert_eq!(result.order.status, OrderStatus::Filled);
        assert_eq!(result.touched.len(), 1);
        assert_eq!(result.touched[0].status, OrderStatus::Filled);
    }

    #[test]
    fn partial_fill_conservation() {
        // Buy 100; sells of 60 then 40 arrive -> matches of 60 and 40,
        // all three orders end Filled
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        let buy = make_order(1, Side::Buy, 100, 100, 0);
        let buy_id = buy.order_id;
        let r0 = MatchingEngine::submit(&mut book, buy, now).unwrap();
        assert!(r0.fills.is_empty());

        let r1 =
            MatchingEngine::submit(&mut book, make_order(2, Side::Sell, 60, 100, 0), now).unwrap();
        assert_eq!(r1.fills.len(), 1);
        assert_eq!(r1.fills[0].qty, 60);
        assert_eq!(r1.order.status, OrderStatus::Filled);
        assert_eq!(r1.touched[0].order_id, buy_id);
        assert_eq!(r1.touched[0].status, OrderStatus::PartiallyFilled);
        assert_eq!(r1.touched[0].remaining_qty(), 40);

        let r2 =
            MatchingEngine::submit(&mut book, make_order(3, Side::Sell, 40, 100, 0), now).unwrap();
        assert_eq!(r2.fills.len(), 1);
        assert_eq!(r2.fills[0].qty, 40);
        assert_eq!(r2.touched[0].order_id, buy_id);
        assert_eq!(r2.touched[0].status, OrderStatus::Filled);

        // Sum of matched qty equals the buy's filled qty
        let total: Qty = r1.fills[0].qty + r2.fills[0].qty;
        assert_eq!(total, 100);
        assert_eq!(r2.touched[0].filled_qty, 100);
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn incoming_sweeps_multiple_counterparties() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        MatchingEngine::submit(&mut book, make_order(1, Side::Sell, 30, 100, 0), now).unwrap();
        MatchingEngine::submit(&mut book, make_order(2, Side::Sell, 40, 100, 0), now).unwrap();
        MatchingEngine::submit(&mut book, make_order(3, Side::Sell, 50, 101, 0), now).unwrap();

        let result =
            MatchingEngine::submit(&mut book, make_order(4, Side::Buy, 100, 101, 0), now).unwrap();

        assert_eq!(result.fills.len(), 3);
        assert_eq!(
            result.fills.iter().map(|m| m.qty).collect::<Vec<_>>(),
            vec![30, 40, 30]
        );
        assert_eq!(result.order.status, OrderStatus::Filled);
        // Third sell keeps its remainder resting
        assert_eq!(book.best_ask(), Some(101));
    }

    #[test]
    fn skips_resting_order_from_same_user() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        // User 1 rests a sell, then crosses it with their own buy: skipped,
        // the next candidate (user 2) fills instead
        MatchingEngine::submit(&mut book, make_order(1, Side::Sell, 10, 100, 0), now).unwrap();
        MatchingEngine::submit(&mut book, make_order(2, Side::Sell, 10, 100, 0), now).unwrap();

        let result =
            MatchingEngine::submit(&mut book, make_order(1, Side::Buy, 10, 100, 0), now).unwrap();

        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].seller, 2);
        // User 1's own sell still rests
        assert_eq!(book.best_ask(), Some(100));
    }

    #[test]
    fn expired_resting_order_is_swept_not_matched() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();

        let dead = order_with_expiry(1, Side::Sell, 10, 100, 0, now + 10);
        let dead_id = dead.order_id;
        MatchingEngine::submit(&mut book, dead, now).unwrap();
        MatchingEngine::submit(&mut book, make_order(2, Side::Sell, 10, 100, 0), now).unwrap();

        // Advance past the first order's expiry
        let later = now + 20;
        let result =
            MatchingEngine::submit(&mut book, make_order(3, Side::Buy, 10, 100, 0), later).unwrap();

        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].seller, 2);
        assert_eq!(result.expired.len(), 1);
        assert_eq!(result.expired[0].order_id, dead_id);
        assert_eq!(result.expired[0].status, OrderStatus::Expired);
        assert!(!book.contains(dead_id));
    }

    #[test]
    fn rejects_zero_quantity() {
        let mut book = OrderBook::new(pair());
        let err = MatchingEngine::submit(&mut book, make_order(1, Side::Buy, 0, 100, 0), now_ms())
            .unwrap_err();
        assert_eq!(err, RejectReason::ZeroQuantity);
        assert_eq!(book.depth(), (0, 0));
    }

    #[test]
    fn rejects_expired_order() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();
        let order = order_with_expiry(1, Side::Buy, 10, 100, 0, now - 1);
        let err = MatchingEngine::submit(&mut book, order, now).unwrap_err();
        assert_eq!(err, RejectReason::AlreadyExpired);
    }

    #[test]
    fn rejects_duplicate_resting_id() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();
        let order = make_order(1, Side::Buy, 10, 100, 0);
        let dup = order.clone();
        MatchingEngine::submit(&mut book, order, now).unwrap();
        let err = MatchingEngine::submit(&mut book, dup, now).unwrap_err();
        assert!(matches!(err, RejectReason::DuplicateOrder(_)));
    }

    #[test]
    fn rejects_tampered_commitment() {
        let mut book = OrderBook::new(pair());
        let mut order = make_order(1, Side::Buy, 10, 100, 0);
        // Terms changed after the commitment was computed
        order.limit_price = 101;
        let err = MatchingEngine::submit(&mut book, order, now_ms()).unwrap_err();
        assert_eq!(err, RejectReason::CommitmentMismatch);
    }

    #[test]
    fn cancel_resting_order() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();
        let order = make_order(1, Side::Buy, 10, 100, 0);
        let id = order.order_id;
        MatchingEngine::submit(&mut book, order, now).unwrap();

        let cancelled = MatchingEngine::cancel(&mut book, id, 1).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn cancel_rejects_non_owner() {
        let mut book = OrderBook::new(pair());
        let now = now_ms();
        let order = make_order(1, Side::Buy, 10, 100, 0);
        let id = order.order_id;
        MatchingEngine::submit(&mut book, order, now).unwrap();

        let err = MatchingEngine::cancel(&mut book, id, 2).unwrap_err();
        assert_eq!(err, RejectReason::NotOwner);
        // Still resting
        assert_eq!(book.best_bid(), Some(100));
    }

    #[test]
    fn cancel_unknown_order() {
        let mut book = OrderBook::new(pair());
        let err = MatchingEngine::cancel(&mut book, OrderId::generate(), 1).unwrap_err();
        assert!(matches!(err, RejectReason::UnknownOrder(_)));
    }
}

//! OrderBook - BTreeMap-based price-time priority book for one trading pair
//!
//! This module contains only the book data structure.
//! The matching logic lives in the engine module.

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::FxHashMap;

use crate::core_types::{OrderId, Price, SeqNum};
use crate::models::{Order, Side, TradingPair};

/// Per-pair order book using BTreeMap for O(log n) operations
///
/// # Key design
/// - Asks are stored with normal keys (ascending, lowest price = best ask)
/// - Bids use negated keys `u64::MAX - price` (so highest price comes first)
/// - Orders at a level queue FIFO by insertion sequence
#[derive(Debug)]
pub struct OrderBook {
    pair: TradingPair,
    /// Sell orders: price -> orders (ascending, lowest = best)
    asks: BTreeMap<Price, VecDeque<Order>>,
    /// Buy orders: (MAX - price) -> orders (so highest price first)
    bids: BTreeMap<Price, VecDeque<Order>>,
    /// OrderId -> (limit price, side) for O(1) cancel lookup
    order_index: FxHashMap<OrderId, (Price, Side)>,
    /// Monotonic insertion sequence, the deterministic FIFO tie-breaker
    seq_counter: SeqNum,
}

impl OrderBook {
    pub fn new(pair: TradingPair) -> Self {
        Self {
            pair,
            asks: BTreeMap::new(),
            bids: BTreeMap::new(),
            order_index: FxHashMap::default(),
            seq_counter: 0,
        }
    }

    pub fn pair(&self) -> TradingPair {
        self.pair
    }

    /// Next insertion sequence number (increments counter)
    #[inline]
    pub fn next_seq(&mut self) -> SeqNum {
        self.seq_counter += 1;
        self.seq_counter
    }

    /// Best bid limit price (highest buy)
    #[inline]
    pub fn best_bid(&self) -> Option<Price> {
        self.bids.first_key_value().map(|(k, _)| u64::MAX - k)
    }

    /// Best ask limit price (lowest sell)
    #[inline]
    pub fn best_ask(&self) -> Option<Price> {
        self.asks.first_key_value().map(|(k, _)| *k)
    }

    /// Number of price levels on each side (bid_depth, ask_depth)
    #[inline]
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Whether an order is currently resting in this book
    #[inline]
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.order_index.contains_key(&order_id)
    }

    /// Mutable access to ask levels (for the matching engine)
    #[inline]
    pub fn asks_mut(&mut self) -> &mut BTreeMap<Price, VecDeque<Order>> {
        &mut self.asks
    }

    /// Mutable access to bid levels (for the matching engine)
    #[inline]
    pub fn bids_mut(&mut self) -> &mut BTreeMap<Price, VecDeque<Order>> {
        &mut self.bids
    }

    #[inline]
    pub fn asks(&self) -> &BTreeMap<Price, VecDeque<Order>> {
        &self.asks
    }

    #[inline]
    pub fn bids(&self) -> &BTreeMap<Price, VecDeque<Order>> {
        &self.bids
    }

    /// Remove an order from the index (call when the engine pops a filled
    /// or expired order out of a level queue directly)
    #[inline]
    pub fn remove_from_index(&mut self, order_id: OrderId) {
        self.order_index.remove(&order_id);
    }

    /// Rest an unfilled/partially filled order in the book.
    ///
    /// The order status and seq must already be set by the caller; this
    /// method just stores the order.
    pub fn rest_order(&mut self, order: Order) {
        self.order_index
            .insert(order.order_id, (order.limit_price, order.side));

        match order.side {
            Side::Buy => {
                let key = u64::MAX - order.limit_price;
                self.bids.entry(key).or_default().push_back(order);
            }
            Side::Sell => {
                self.asks.entry(order.limit_price).or_default().push_back(order);
            }
        }
    }

    /// Look up a resting order by id (clone)
    pub fn get(&self, order_id: OrderId) -> Option<Order> {
        let (price, side) = self.order_index.get(&order_id)?;
        let (book, key) = match side {
            Side::Buy => (&self.bids, u64::MAX - price),
            Side::Sell => (&self.asks, *price),
        };
        book.get(&key)?
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
    }

    /// Remove a resting order by id only (uses the index for fast lookup).
    ///
    /// Returns the removed order if found. O(1) index lookup + O(log n)
    /// tree access + O(k) queue scan at the level.
    pub fn remove_order_by_id(&mut self, order_id: OrderId) -> Option<Order> {
        let (price, side) = self.order_index.remove(&order_id)?;

        let (book, key) = match side {
            Side::Buy => (&mut self.bids, u64::MAX - price),
            Side::Sell => (&mut self.asks, price),
        };

        let orders = book.get_mut(&key)?;
        let pos = orders.iter().position(|o| o.order_id == order_id)?;
        let order = orders.remove(pos)?;

        // Clean up empty price level
        if orders.is_empty() {
            book.remove(&key);
        }

        Some(order)
    }

    /// All resting orders: bids first (highest price, FIFO within price),
    /// then asks (lowest price, FIFO within price)
    pub fn all_orders(&self) -> Vec<&Order> {
        self.bids
            .values()
            .flat_map(|level| level.iter())
            .chain(self.asks.values().flat_map(|level| level.iter()))
            .collect()
    }
}

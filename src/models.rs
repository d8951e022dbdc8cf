// models.rs - Order and Match records, status state machines

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::commitment::{self, CommitmentHash};
use crate::core_types::{Bps, MatchId, OrderId, Price, Qty, SeqNum, TimestampMs, UserId};

/// Order side: Buy or Sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Single-byte encoding used by the commitment scheme
    pub fn as_byte(&self) -> u8 {
        match self {
            Side::Buy => b'B',
            Side::Sell => b'S',
        }
    }
}

/// Supported assets - a closed enumeration, validated at the boundary.
///
/// Stringly-typed asset identifiers are not accepted anywhere inside the
/// core; unknown symbols fail to parse at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    Btc,
    Eth,
    Usdt,
    Usdc,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Usdt => "USDT",
            Asset::Usdc => "USDC",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            "USDT" => Ok(Asset::Usdt),
            "USDC" => Ok(Asset::Usdc),
            other => Err(format!("unsupported asset: {other}")),
        }
    }
}

/// Trading pair - base traded against quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: Asset,
    pub quote: Asset,
}

impl TradingPair {
    pub fn new(base: Asset, quote: Asset) -> Self {
        Self { base, quote }
    }

    /// A pair is tradable only when base and quote differ
    pub fn is_valid(&self) -> bool {
        self.base != self.quote
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Order lifecycle status.
///
/// Strict state machine:
/// `Pending -> PartiallyFilled -> Filled`, or
/// `Pending|PartiallyFilled -> Cancelled|Expired`.
/// No transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Accepted, no quantity filled yet
    Pending,
    /// Some quantity filled, remainder resting in the book
    PartiallyFilled,
    /// Fully filled (terminal)
    Filled,
    /// Cancelled by the owner (terminal)
    Cancelled,
    /// Expired past `expires_at` (terminal)
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Match settlement status.
///
/// Strict state machine: `Pending -> Settling -> Settled | Failed`.
/// `Settling -> Pending` happens only through the Supervisor's stale-claim
/// recovery, never through a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    /// Created, waiting for a settlement worker to claim it
    Pending,
    /// Claimed by exactly one worker, pipeline in flight
    Settling,
    /// Funds moved, settlement reference recorded (terminal)
    Settled,
    /// Terminal domain failure, reason recorded (terminal)
    Failed,
}

impl MatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Settled | MatchStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Pending => "PENDING",
            MatchStatus::Settling => "SETTLING",
            MatchStatus::Settled => "SETTLED",
            MatchStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The private terms a commitment hash binds.
///
/// The matching engine only needs these plus the hash; settlement feeds
/// them into the proof witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTerms {
    pub user_id: UserId,
    pub pair: TradingPair,
    pub side: Side,
    pub qty: Qty,
    pub limit_price: Price,
    pub price_band_bps: Bps,
    pub expires_at: TimestampMs,
}

/// An order - a party's intent to trade.
///
/// Created on submission, mutated only by the order book (fills) or by an
/// explicit cancel, never destroyed - retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub pair: TradingPair,
    pub side: Side,
    /// Total quantity (immutable)
    pub qty: Qty,
    pub limit_price: Price,
    /// Allowed variance around `limit_price`, in basis points
    pub price_band_bps: Bps,
    pub expires_at: TimestampMs,
    /// One-way binding of all terms plus `user_id`
    pub commitment: CommitmentHash,
    pub filled_qty: Qty,
    pub status: OrderStatus,
    /// Book insertion sequence, the deterministic FIFO tie-breaker
    pub seq: SeqNum,
    /// Set once the order is fully filled and finalized on-chain
    pub finalized: bool,
    pub created_at: TimestampMs,
}

impl Order {
    /// Build an order from client-submitted terms and commitment
    pub fn new(
        order_id: OrderId,
        terms: OrderTerms,
        commitment: CommitmentHash,
        created_at: TimestampMs,
    ) -> Self {
        Self {
            order_id,
            user_id: terms.user_id,
            pair: terms.pair,
            side: terms.side,
            qty: terms.qty,
            limit_price: terms.limit_price,
            price_band_bps: terms.price_band_bps,
            expires_at: terms.expires_at,
            commitment,
            filled_qty: 0,
            status: OrderStatus::Pending,
            seq: 0,
            finalized: false,
            created_at,
        }
    }

    /// The private terms this order's commitment binds
    pub fn terms(&self) -> OrderTerms {
        OrderTerms {
            user_id: self.user_id,
            pair: self.pair,
            side: self.side,
            qty: self.qty,
            limit_price: self.limit_price,
            price_band_bps: self.price_band_bps,
            expires_at: self.expires_at,
        }
    }

    /// Remaining quantity to fill.
    ///
    /// Invariant: `filled_qty + remaining_qty() == qty` at all times.
    #[inline]
    pub fn remaining_qty(&self) -> Qty {
        self.qty - self.filled_qty
    }

    #[inline]
    pub fn is_filled(&self) -> bool {
        self.filled_qty >= self.qty
    }

    #[inline]
    pub fn is_expired(&self, now: TimestampMs) -> bool {
        self.expires_at <= now
    }

    /// Lowest price the owner accepts: `limit * (10000 - band) / 10000`
    pub fn min_price(&self) -> Price {
        let band = (self.price_band_bps as u128).min(10_000);
        ((self.limit_price as u128) * (10_000 - band) / 10_000) as Price
    }

    /// Highest price the owner accepts: `limit * (10000 + band) / 10000`
    pub fn max_price(&self) -> Price {
        let raw = (self.limit_price as u128) * (10_000 + self.price_band_bps as u128) / 10_000;
        raw.min(u64::MAX as u128) as Price
    }

    /// Verify the carried commitment binds these exact terms
    pub fn commitment_binds_terms(&self) -> bool {
        commitment::commit(&self.terms()) == self.commitment
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Order[{}] {:?} {} {}@{} filled={} status={}",
            self.order_id, self.side, self.pair, self.qty, self.limit_price, self.filled_qty,
            self.status
        )
    }
}

/// Cost calculation error - explicit error type for financial-grade code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotionalError {
    /// `price * qty` exceeds the u64 range
    Overflow { price: Price, qty: Qty },
}

impl fmt::Display for NotionalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotionalError::Overflow { price, qty } => {
                write!(
                    f,
                    "notional overflow: price={price} * qty={qty} exceeds u64::MAX"
                )
            }
        }
    }
}

impl std::error::Error for NotionalError {}

/// Quote-side notional for a fill, computed in u128 to surface overflow
/// instead of wrapping.
pub fn quote_notional(price: Price, qty: Qty) -> Result<Qty, NotionalError> {
    let raw = (price as u128) * (qty as u128);
    if raw > u64::MAX as u128 {
        Err(NotionalError::Overflow { price, qty })
    } else {
        Ok(raw as Qty)
    }
}

/// A match - a single pairing event between one buy and one sell order.
///
/// References orders by id, never by ownership: an order may appear in many
/// matches via partial fills. Created by the order book, mutated only by
/// the settlement worker, never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub match_id: MatchId,
    pub pair: TradingPair,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub buyer: UserId,
    pub seller: UserId,
    pub qty: Qty,
    /// The resting order's limit price - price improvement accrues to the
    /// incoming order
    pub price: Price,
    pub status: MatchStatus,
    /// Populated only on `Failed`
    pub settlement_error: Option<String>,
    /// External proof/transaction reference, populated on `Settled`
    pub settle_reference: Option<String>,
    /// Supervisor stale-claim requeues, for observability
    pub requeues: u32,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl Match {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: TradingPair,
        buy_order_id: OrderId,
        sell_order_id: OrderId,
        buyer: UserId,
        seller: UserId,
        qty: Qty,
        price: Price,
        created_at: TimestampMs,
    ) -> Self {
        Self {
            match_id: MatchId::new(),
            pair,
            buy_order_id,
            sell_order_id,
            buyer,
            seller,
            qty,
            price,
            status: MatchStatus::Pending,
            settlement_error: None,
            settle_reference: None,
            requeues: 0,
            created_at,
            updated_at: created_at,
        }
    }

    /// Quote amount the buyer pays for this fill
    pub fn quote_notional(&self) -> Result<Qty, NotionalError> {
        quote_notional(self.price, self.qty)
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Match[{}] {} {}@{} buy={} sell={} status={}",
            self.match_id,
            self.pair,
            self.qty,
            self.price,
            self.buy_order_id,
            self.sell_order_id,
            self.status
        )
    }
}

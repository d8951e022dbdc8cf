//! DarkMatch - private order matching with proof-gated settlement.
//!
//! Orders carry a cryptographic commitment to their terms; the matcher
//! crosses them under price-time priority inside per-pair price bands, and
//! every match is driven through an asynchronous settlement pipeline
//! (proof generation, on-chain verification, channel-based asset swap).
//!
//! # Modules
//!
//! - [`core_types`] - Core type definitions (OrderId, MatchId, etc.)
//! - [`models`] - Order, Match and trading-pair types
//! - [`commitment`] - Order-terms commitment hashing
//! - [`orderbook`] - BTreeMap-based per-pair order book
//! - [`engine`] - Matching engine logic
//! - [`matcher`] - Submission surface, one logical writer per pair
//! - [`store`] - Order/match store and settlement state machine
//! - [`settlement`] - Proof/chain/channel pipeline, worker and supervisor
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup

// Core types - must be first!
pub mod core_types;

pub mod commitment;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod models;
pub mod orderbook;
pub mod settlement;
pub mod store;

// Convenient re-exports at crate root
pub use commitment::CommitmentHash;
pub use core_types::{MatchId, OrderId, Price, Qty, SeqNum, UserId};
pub use engine::MatchingEngine;
pub use error::{MatcherError, RejectReason, SettlementError, StoreError};
pub use matcher::{Matcher, SubmitAck, SubmitRequest};
pub use models::{Asset, Match, MatchStatus, Order, OrderStatus, OrderTerms, Side, TradingPair};
pub use orderbook::OrderBook;
pub use settlement::{
    SettlementOutcome, SettlementSupervisor, SettlementWorker, SupervisorConfig,
};
pub use store::{MemoryStore, OrderStore};

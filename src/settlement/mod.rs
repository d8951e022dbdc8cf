//! Settlement orchestration: collaborator interfaces, the per-match
//! pipeline worker, and the supervisor that provides at-least-once
//! processing on top of the store's atomic claim.

pub mod collaborators;
#[cfg(any(test, feature = "mock-collaborators"))]
pub mod mocks;
pub mod supervisor;
pub mod worker;

pub use collaborators::{ChainClient, ChannelService, ProofGenerator};
pub use supervisor::{SettlementSupervisor, SupervisorConfig};
pub use worker::{FailReason, RetryPolicy, SettlementOutcome, SettlementWorker};

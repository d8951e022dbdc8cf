//! Settlement supervisor - worker pool plus the stale-match scan.
//!
//! Workers share one match stream receiver; each takes the next match id
//! and runs the settlement pipeline. The scan is the at-least-once repair
//! loop: claims stuck in `Settling` past the staleness window (crashed or
//! partitioned worker) are requeued to `Pending` and re-dispatched, and
//! `Pending` matches past the redispatch window (lost stream delivery) are
//! re-dispatched as-is. The store's atomic claim makes every duplicate
//! dispatch harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::worker::SettlementWorker;
use crate::core_types::{now_ms, MatchId};
use crate::error::SettlementError;
use crate::store::OrderStore;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Concurrent settlement workers
    pub workers: usize,
    /// How long a `Settling` claim may go untouched before requeue
    pub staleness_window: Duration,
    /// How long a `Pending` match may sit undelivered before re-dispatch
    pub redispatch_window: Duration,
    pub scan_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            staleness_window: Duration::from_secs(30),
            redispatch_window: Duration::from_secs(10),
            scan_interval: Duration::from_secs(5),
        }
    }
}

pub struct SettlementSupervisor {
    store: Arc<dyn OrderStore>,
    worker: Arc<SettlementWorker>,
    match_rx: Arc<Mutex<mpsc::Receiver<MatchId>>>,
    match_tx: mpsc::Sender<MatchId>,
    config: SupervisorConfig,
}

impl SettlementSupervisor {
    pub fn new(
        store: Arc<dyn OrderStore>,
        worker: SettlementWorker,
        match_rx: mpsc::Receiver<MatchId>,
        match_tx: mpsc::Sender<MatchId>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            worker: Arc::new(worker),
            match_rx: Arc::new(Mutex::new(match_rx)),
            match_tx,
            config,
        }
    }

    /// Spawn the worker pool and the scan loop. Workers exit when the match
    /// stream closes; the scan loop runs until its task is aborted.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers + 1);
        for idx in 0..self.config.workers {
            let sup = self.clone();
            handles.push(tokio::spawn(async move { sup.worker_loop(idx).await }));
        }
        let sup = self.clone();
        handles.push(tokio::spawn(async move { sup.scan_loop().await }));
        info!(workers = self.config.workers, "settlement supervisor started");
        handles
    }

    async fn worker_loop(&self, worker_idx: usize) {
        loop {
            // Receiver lock is released before the pipeline runs, so other
            // workers keep draining the stream
            let next = { self.match_rx.lock().await.recv().await };
            let Some(match_id) = next else {
                debug!(worker = worker_idx, "match stream closed, worker exiting");
                return;
            };

            match self.worker.settle(match_id).await {
                Ok(outcome) => {
                    debug!(
                        worker = worker_idx,
                        match_id = %match_id,
                        outcome = ?outcome,
                        "settlement attempt finished"
                    );
                }
                Err(e) => {
                    error!(
                        worker = worker_idx,
                        match_id = %match_id,
                        error = %e,
                        "settlement attempt errored"
                    );
                }
            }
        }
    }

    async fn scan_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.scan_once().await {
                Ok(0) => {}
                Ok(n) => debug!(redispatched = n, "stale scan redispatched matches"),
                Err(e) => error!(error = %e, "stale scan failed"),
            }
        }
    }

    /// One pass of the repair scan; returns how many matches were put back
    /// on the stream.
    pub async fn scan_once(&self) -> Result<usize, SettlementError> {
        let now = now_ms();
        let mut dispatched = 0;

        let settling_cutoff = now - self.config.staleness_window.as_millis() as i64;
        for match_id in self.store.stale_settling(settling_cutoff).await? {
            if !self.store.requeue_match(match_id).await? {
                // Lost the race to the claim holder completing it
                continue;
            }
            warn!(match_id = %match_id, "stale settling claim requeued");
            if self.match_tx.try_send(match_id).is_ok() {
                dispatched += 1;
            } else {
                // Stream full; the pending scan picks it up next pass
                warn!(match_id = %match_id, "match stream full, deferring redispatch");
            }
        }

        let pending_cutoff = now - self.config.redispatch_window.as_millis() as i64;
        for match_id in self.store.stale_pending(pending_cutoff).await? {
            match self.match_tx.try_send(match_id) {
                Ok(()) => dispatched += 1,
                Err(_) => break,
            }
        }

        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment;
    use crate::core_types::OrderId;
    use crate::models::{Asset, Match, MatchStatus, Order, OrderStatus, OrderTerms, Side, TradingPair};
    use crate::settlement::mocks::{MockChainClient, MockChannelService, MockProofGenerator};
    use crate::settlement::worker::RetryPolicy;
    use crate::store::MemoryStore;

    async fn seed(store: &MemoryStore, chain: &MockChainClient) -> Match {
        let make = |user_id, side| {
            let terms = OrderTerms {
                user_id,
                pair: TradingPair::new(Asset::Eth, Asset::Usdt),
                side,
                qty: 100,
                limit_price: 2000,
                price_band_bps: 200,
                expires_at: now_ms() + 60_000,
            };
            let c = commitment::commit(&terms);
            Order::new(OrderId::generate(), terms, c, now_ms())
        };
        let mut buy = make(1, Side::Buy);
        let mut sell = make(2, Side::Sell);
        chain.register_order(&buy).await;
        chain.register_order(&sell).await;
        buy.filled_qty = 100;
        buy.status = OrderStatus::Filled;
        sell.filled_qty = 100;
        sell.status = OrderStatus::Filled;
        store.put_order(&buy).await.unwrap();
        store.put_order(&sell).await.unwrap();

        let m = Match::new(
            buy.pair,
            buy.order_id,
            sell.order_id,
            buy.user_id,
            sell.user_id,
            100,
            2000,
            now_ms(),
        );
        store.insert_match(&m).await.unwrap();
        m
    }

    fn supervisor(
        store: Arc<MemoryStore>,
        chain: Arc<MockChainClient>,
        config: SupervisorConfig,
    ) -> (Arc<SettlementSupervisor>, mpsc::Sender<MatchId>) {
        let (tx, rx) = mpsc::channel(16);
        let worker = SettlementWorker::new(
            store.clone(),
            Arc::new(MockProofGenerator::new()),
            chain,
            Arc::new(MockChannelService::new()),
            RetryPolicy {
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(2),
                ..RetryPolicy::default()
            },
        );
        let sup = Arc::new(SettlementSupervisor::new(
            store,
            worker,
            rx,
            tx.clone(),
            config,
        ));
        (sup, tx)
    }

    #[tokio::test]
    async fn scan_requeues_stale_settling_claim() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChainClient::new());
        let m = seed(&store, &chain).await;

        // A claim with no worker behind it (crash)
        assert!(store.claim_match(m.match_id).await.unwrap());

        let config = SupervisorConfig {
            staleness_window: Duration::ZERO,
            redispatch_window: Duration::ZERO,
            ..SupervisorConfig::default()
        };
        let (sup, _tx) = supervisor(store.clone(), chain, config);

        assert!(sup.scan_once().await.unwrap() >= 1);
        let stored = store.get_match(m.match_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Pending);
        assert_eq!(stored.requeues, 1);
    }

    #[tokio::test]
    async fn scan_redispatches_undelivered_pending() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChainClient::new());
        let m = seed(&store, &chain).await;

        let config = SupervisorConfig {
            staleness_window: Duration::ZERO,
            redispatch_window: Duration::ZERO,
            ..SupervisorConfig::default()
        };
        let (sup, _tx) = supervisor(store.clone(), chain, config);

        // Pending, never delivered: one redispatch per scan until a worker
        // picks it up
        assert_eq!(sup.scan_once().await.unwrap(), 1);
        let stored = store.get_match(m.match_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Pending);
        assert_eq!(stored.requeues, 0);
    }

    #[tokio::test]
    async fn scan_leaves_fresh_claims_alone() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChainClient::new());
        let m = seed(&store, &chain).await;
        assert!(store.claim_match(m.match_id).await.unwrap());

        // Generous windows: nothing qualifies as stale
        let (sup, _tx) = supervisor(store.clone(), chain, SupervisorConfig::default());
        assert_eq!(sup.scan_once().await.unwrap(), 0);
        let stored = store.get_match(m.match_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Settling);
    }

    #[tokio::test]
    async fn workers_drain_stream_to_settled() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChainClient::new());
        let m = seed(&store, &chain).await;

        let config = SupervisorConfig {
            workers: 2,
            ..SupervisorConfig::default()
        };
        let (sup, tx) = supervisor(store.clone(), chain, config);
        let handles = sup.spawn();

        tx.send(m.match_id).await.unwrap();

        // Poll until the pipeline completes
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stored = store.get_match(m.match_id).await.unwrap().unwrap();
            if stored.status == MatchStatus::Settled {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "settlement did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for handle in handles {
            handle.abort();
        }
    }
}

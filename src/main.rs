//! DarkMatch demo binary.
//!
//! Wires the matcher and settlement supervisor against the in-process mock
//! collaborators and runs one full flow: two committed orders cross inside
//! their price bands, the match settles through proof, chain and channel,
//! and both orders finalize.

use std::path::Path;

use darkmatch::config::AppConfig;
use darkmatch::logging::init_logging;

fn get_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "config.yaml".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = get_config_path();
    let config = if Path::new(&config_path).exists() {
        AppConfig::load(&config_path)?
    } else {
        AppConfig::default()
    };
    let _log_guard = init_logging(&config);

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        config = %config_path,
        "starting darkmatch"
    );

    run_demo(&config).await
}

#[cfg(feature = "mock-collaborators")]
async fn run_demo(config: &AppConfig) -> anyhow::Result<()> {
    use std::sync::Arc;
    use std::time::Duration;

    use darkmatch::commitment;
    use darkmatch::core_types::{now_ms, MatchId, OrderId};
    use darkmatch::models::{Asset, MatchStatus, OrderTerms, Side, TradingPair};
    use darkmatch::settlement::mocks::{
        MockChainClient, MockChannelService, MockProofGenerator,
    };
    use darkmatch::settlement::{SettlementSupervisor, SettlementWorker};
    use darkmatch::store::{MemoryStore, OrderStore};
    use darkmatch::{Matcher, SubmitRequest};
    use tokio::sync::mpsc;

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let prover = Arc::new(MockProofGenerator::new());
    let chain = Arc::new(MockChainClient::new());
    let channel = Arc::new(MockChannelService::new());

    let (match_tx, match_rx) = mpsc::channel::<MatchId>(config.matching.stream_capacity);
    let matcher = Matcher::new(store.clone(), match_tx.clone());

    let worker = SettlementWorker::new(
        store.clone(),
        prover,
        chain.clone(),
        channel.clone(),
        config.settlement.retry_policy(),
    );
    let supervisor = Arc::new(SettlementSupervisor::new(
        store.clone(),
        worker,
        match_rx,
        match_tx,
        config.settlement.supervisor_config(),
    ));
    let handles = supervisor.spawn();

    let pair = TradingPair::new(Asset::Eth, Asset::Usdt);
    let make_request = |user_id, side, limit_price| {
        let terms = OrderTerms {
            user_id,
            pair,
            side,
            qty: 100,
            limit_price,
            price_band_bps: 200,
            expires_at: now_ms() + 60_000,
        };
        SubmitRequest::new(OrderId::generate(), terms, commitment::commit(&terms))
    };

    // Buyer at 2000 and seller at 2010, both with 2% bands: compatible
    let buy = make_request(1, Side::Buy, 2000);
    let sell = make_request(2, Side::Sell, 2010);

    // The wallet flow would register the custody commitments on chain
    for req in [&buy, &sell] {
        let order = darkmatch::Order::new(req.order_id, req.terms, req.commitment, now_ms());
        chain.register_order(&order).await;
    }

    let sell_ack = matcher.submit_order(sell).await?;
    tracing::info!(order_id = %sell_ack.order.order_id, "sell resting");

    let buy_ack = matcher.submit_order(buy).await?;
    let m = buy_ack
        .matches
        .first()
        .ok_or_else(|| anyhow::anyhow!("orders did not cross"))?;
    tracing::info!(match_id = %m.match_id, qty = m.qty, price = m.price, "matched");

    // Wait for the pipeline to settle the match
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let settled = loop {
        let Some(stored) = store.get_match(m.match_id).await? else {
            anyhow::bail!("match disappeared from store");
        };
        if stored.status != MatchStatus::Pending && stored.status != MatchStatus::Settling {
            break stored;
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("settlement did not complete in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    println!("{}", serde_json::to_string_pretty(&settled)?);
    tracing::info!(
        match_id = %settled.match_id,
        status = ?settled.status,
        reference = ?settled.settle_reference,
        swaps = channel.swaps_completed(),
        "demo complete"
    );

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

#[cfg(not(feature = "mock-collaborators"))]
async fn run_demo(_config: &AppConfig) -> anyhow::Result<()> {
    anyhow::bail!("demo binary requires the mock-collaborators feature")
}

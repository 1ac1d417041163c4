// =============================================================================
// RiskGuard — Main Entry Point
// =============================================================================
//
// Risk enforcement daemon for a single broker-hosted futures account. The
// composition root constructs and wires every component; nothing is
// module-global. One long-lived task per loop: broker feed ingress, router
// queue, engine processor, timer ticker, reset scheduler, status publisher.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod adapter;
mod app_state;
mod broker;
mod config;
mod domain;
mod engine;
mod enforcement;
mod errors;
mod lockout;
mod persistence;
mod pnl;
mod reset;
mod router;
mod rules;
mod ticks;
mod timers;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapter::SdkAdapter;
use crate::app_state::AppState;
use crate::broker::client::RestBrokerClient;
use crate::config::RiskConfig;
use crate::enforcement::EnforcementExecutor;
use crate::engine::{EngineMsg, RiskEngine};
use crate::lockout::LockoutManager;
use crate::persistence::Store;
use crate::pnl::PnlTracker;
use crate::reset::{ResetScheduler, TradingCalendar};
use crate::router::EventRouter;
use crate::rules::{build_rules, RuleDeps};
use crate::ticks::TickRegistry;
use crate::timers::TimerManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           RiskGuard — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("RISKGUARD_CONFIG").unwrap_or_else(|_| "riskguard.json".into());
    let db_path = std::env::var("RISKGUARD_DB").unwrap_or_else(|_| "riskguard.db".into());
    let account_id =
        std::env::var("RISKGUARD_ACCOUNT").unwrap_or_else(|_| "default".into());

    // ── 2. Configuration (fail loud, never run invalid) ──────────────────
    let config = Arc::new(RiskConfig::load(&config_path)?);
    let registry = Arc::new(TickRegistry::new(config.tick_table())?);
    let calendar = TradingCalendar::new(&config.daily_reset)?;

    // ── 3. Durable state & shared managers ───────────────────────────────
    let store = Arc::new(Store::open(&db_path)?);
    let timers = Arc::new(TimerManager::new());
    let ticker_task = timers.spawn_ticker();

    let pnl = Arc::new(PnlTracker::new(store.clone(), calendar));
    let lockouts = Arc::new(LockoutManager::new(store.clone(), timers.clone()));
    lockouts.rehydrate();
    info!(
        account = %account_id,
        daily_pnl = %pnl.get_daily_pnl(&account_id),
        locked = lockouts.is_locked(&account_id),
        "state recovered from store"
    );

    let state = Arc::new(AppState::new(
        config.clone(),
        account_id.clone(),
        registry.clone(),
        store.clone(),
        pnl.clone(),
        lockouts.clone(),
        timers.clone(),
    ));

    // ── 4. Broker port ───────────────────────────────────────────────────
    let api_key = std::env::var("BROKER_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BROKER_API_SECRET").unwrap_or_default();
    let api_url = std::env::var("BROKER_API_URL")
        .unwrap_or_else(|_| "https://gateway.broker.example".into());
    let feed_url = std::env::var("BROKER_FEED_URL")
        .unwrap_or_else(|_| "wss://gateway.broker.example/feed".into());

    let broker_client = Arc::new(
        RestBrokerClient::new(api_key, api_secret, api_url)
            .map_err(|e| anyhow::anyhow!("broker client: {e}"))?,
    );
    let executor = Arc::new(EnforcementExecutor::new(
        broker_client,
        store.clone(),
        lockouts.clone(),
    ));

    // ── 5. Engine + rules ────────────────────────────────────────────────
    let (engine_tx, engine_rx) = tokio::sync::mpsc::unbounded_channel::<EngineMsg>();
    let deps = RuleDeps { timers: timers.clone(), engine_tx: engine_tx.clone(), calendar };
    let rules = build_rules(&config, &deps)?;

    let engine = RiskEngine::new(
        config.clone(),
        registry.clone(),
        state.books.clone(),
        store.clone(),
        pnl.clone(),
        lockouts.clone(),
        executor,
        rules,
    );
    let engine_task = tokio::spawn(engine.run(engine_rx));

    // ── 6. Event router + broker feed ────────────────────────────────────
    let (raw_tx, raw_rx) = tokio::sync::mpsc::unbounded_channel();
    let router = EventRouter::new(
        account_id.clone(),
        SdkAdapter::new(registry.clone()),
        state.books.clone(),
        store.clone(),
        engine_tx.clone(),
    );
    let router_task = tokio::spawn(router.run(raw_rx));
    let feed_task = tokio::spawn(broker::stream::run_feed_forever(feed_url, raw_tx));

    // ── 7. Reset scheduler ───────────────────────────────────────────────
    let scheduler =
        ResetScheduler::new(calendar, pnl.clone(), lockouts.clone(), engine_tx.clone());
    let reset_task = tokio::spawn(scheduler.run());

    // ── 8. Status publisher (0.5 Hz) ─────────────────────────────────────
    let status_state = state.clone();
    let status_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            interval.tick().await;
            let books = &status_state.books;
            info!(
                account = %status_state.account_id,
                open_positions = books.positions.read().len(),
                total_unrealized = %books.total_unrealized(),
                daily_realized = %status_state.pnl.get_daily_pnl(&status_state.account_id),
                locked = status_state.lockouts.is_locked(&status_state.account_id),
                uptime_secs = status_state.start_time.elapsed().as_secs(),
                "account status"
            );
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // Stop accepting new SDK events, then let the router drain its queue.
    feed_task.abort();
    reset_task.abort();
    status_task.abort();
    if tokio::time::timeout(Duration::from_secs(5), router_task).await.is_err() {
        warn!("router did not drain within the shutdown deadline");
    }

    // The engine stops once everything queued ahead of the sentinel is done.
    let _ = engine_tx.send(EngineMsg::Shutdown);
    if tokio::time::timeout(Duration::from_secs(5), engine_task).await.is_err() {
        warn!("engine did not drain within the shutdown deadline");
    }
    ticker_task.abort();

    info!("RiskGuard shut down complete.");
    Ok(())
}

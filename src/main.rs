use strangle_engine::config::AppConfig;
use strangle_engine::engine::{driver, StrategyEngine};
use strangle_engine::errors::EngineError;
use strangle_engine::execution::PaperVenue;
use strangle_engine::signal::session::SessionClock;
use strangle_engine::state::*;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};

#[tokio::main]
async fn main() {
    // Structured logging (stderr)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("strangle engine starting");

    // Load config
    let cfg = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        target_delta = cfg.strategy.target_delta,
        move_decay = cfg.strategy.move_decay_threshold,
        profit_target = cfg.strategy.profit_target_pct,
        decay_basis = ?cfg.strategy.decay_basis,
        auto_trade = cfg.strategy.auto_trade,
        auto_move = cfg.strategy.auto_move,
        auto_exit = cfg.strategy.auto_exit,
        "strategy configured"
    );

    let engine = match StrategyEngine::new(cfg.strategy.clone(), cfg.session.clone()) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("engine init error: {e}");
            std::process::exit(1);
        }
    };

    // Create bounded channels
    let (engine_tx, engine_rx) = mpsc::channel::<EngineEvent>(cfg.event_channel_capacity);
    let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot(None, WindowState::default()));

    // ── Spawn tasks ──

    // 1. Event feed: newline-delimited JSON on stdin
    let feed_tx = engine_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = read_events(feed_tx).await {
            tracing::error!(error = %e, "event feed stopped");
        }
    });

    // 2. Wall-clock ticks, when enabled
    if cfg.tick_interval_secs > 0 {
        let tick_tx = engine_tx.clone();
        let period = tokio::time::Duration::from_secs(cfg.tick_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let now = chrono::Utc::now();
                if tick_tx.send(EngineEvent::Tick { now }).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(engine_tx);

    // 3. Snapshot logger
    tokio::spawn(log_snapshots(snapshot_rx));

    // 4. Engine task (single evaluation loop)
    let venue = PaperVenue::new(cfg.strategy.slippage_pct);
    let clock = SessionClock::new(cfg.session.clone());
    let engine_task = tokio::spawn(driver::run_engine(engine, clock, venue, engine_rx, snapshot_tx));

    match engine_task.await {
        Ok(stats) => tracing::info!(?stats, "engine stopped"),
        Err(e) => tracing::error!("engine task panicked: {e}"),
    }
}

/// Decode one `EngineEvent` per line. Malformed lines are logged and skipped.
/// End of input shuts the engine down.
async fn read_events(tx: mpsc::Sender<EngineEvent>) -> Result<(), EngineError> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut line_no: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<EngineEvent>(line).map_err(EngineError::from) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "skipping malformed event");
                continue;
            }
        };

        tx.send(event)
            .await
            .map_err(|_| EngineError::ChannelClosed("engine event channel".into()))?;
    }

    tracing::info!(lines = line_no, "event feed exhausted");
    tx.send(EngineEvent::Shutdown)
        .await
        .map_err(|_| EngineError::ChannelClosed("engine event channel".into()))
}

async fn log_snapshots(mut rx: watch::Receiver<EngineSnapshot>) {
    while rx.changed().await.is_ok() {
        let snap = rx.borrow_and_update().clone();
        tracing::info!(
            as_of = ?snap.as_of,
            signal = %snap.signal.status,
            groups = snap.groups.len(),
            realized = snap.total_realized,
            unrealized = snap.total_unrealized,
            free_parts = snap.capital.available_parts,
            "snapshot"
        );
    }
}

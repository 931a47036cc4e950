use crate::engine::StrategyEngine;
use crate::errors::EngineResult;
use crate::execution::venue::{ExecutionVenue, FillResult};
use crate::signal::session::SessionClock;
use crate::state::*;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio::sync::{mpsc, watch};

/// Loop counters, reported when the engine task stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub events: u64,
    pub cycles: u64,
    pub intents: u64,
    pub fills: u64,
    pub rejections: u64,
    pub errors: u64,
}

/// Engine task state that lives outside the strategy core: the clock, the
/// venue and the manual trigger latch.
struct Driver<V> {
    engine: StrategyEngine,
    clock: SessionClock,
    venue: V,
    now: Option<DateTime<Utc>>,
    manual_pending: bool,
    /// Intents already surfaced for confirmation, so each is logged once.
    surfaced: HashSet<String>,
    stats: DriverStats,
}

/// Core engine loop. Receives events, updates state, evaluates, executes.
/// Events are handled one at a time, so a cycle always completes before the
/// next input lands. Snapshots go out on `snapshot_tx` after every tick.
pub async fn run_engine<V: ExecutionVenue>(
    engine: StrategyEngine,
    clock: SessionClock,
    venue: V,
    mut rx: mpsc::Receiver<EngineEvent>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
) -> DriverStats {
    tracing::info!(venue = venue.name(), "engine task started");

    let mut driver = Driver {
        engine,
        clock,
        venue,
        now: None,
        manual_pending: false,
        surfaced: HashSet::new(),
        stats: DriverStats::default(),
    };

    while let Some(event) = rx.recv().await {
        driver.stats.events += 1;
        if matches!(event, EngineEvent::Shutdown) {
            tracing::info!("shutdown requested");
            break;
        }

        if let Err(e) = driver.process_event(event, &snapshot_tx) {
            driver.stats.errors += 1;
            tracing::error!(error = %e, "engine cycle failed");
        }
    }

    tracing::info!(stats = ?driver.stats, "engine task shutting down");
    driver.stats
}

impl<V: ExecutionVenue> Driver<V> {
    fn process_event(&mut self, event: EngineEvent, snapshot_tx: &watch::Sender<EngineSnapshot>) -> EngineResult<()> {
        match event {
            EngineEvent::Sample(sample) => {
                self.advance(sample.timestamp);
                self.engine.ingest_sample(&sample)?;
            }

            EngineEvent::Quotes { spot, quotes } => {
                // Replayed feeds carry their own clock; never judge them against wall time.
                let latest = quotes.iter().map(|q| q.quoted_at).max();
                let now = match (self.now, latest) {
                    (Some(a), Some(b)) => a.max(b),
                    (a, b) => a.or(b).unwrap_or_else(Utc::now),
                };
                self.advance(now);
                let report = self.engine.ingest_quotes(spot, &quotes, now);
                tracing::debug!(quotes = quotes.len(), applied = report.applied, stale = report.stale.len(), "quotes ingested");
            }

            EngineEvent::Tick { now } => {
                if self.now.map_or(false, |prev| now < prev) {
                    tracing::debug!(%now, "tick behind engine clock, skipped");
                    return Ok(());
                }
                self.advance(now);
                self.cycle(now)?;
                let window = self.clock.window_state(now);
                let _ = snapshot_tx.send(self.engine.snapshot(Some(now), window));
            }

            EngineEvent::ManualEntry => {
                tracing::info!("manual entry trigger armed for next cycle");
                self.manual_pending = true;
            }

            EngineEvent::Shutdown => {}
        }
        Ok(())
    }

    /// Move the clock forward and start a new session on a day change.
    fn advance(&mut self, now: DateTime<Utc>) {
        if self.now.map_or(false, |prev| now < prev) {
            return;
        }
        self.now = Some(now);
        if self.clock.roll(now) {
            self.engine.begin_session(self.clock.trading_day(now));
        }
    }

    fn cycle(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.stats.cycles += 1;
        let window = self.clock.window_state(now);
        let manual = std::mem::take(&mut self.manual_pending);
        let intents = self.engine.evaluate(now, window, manual);
        self.stats.intents += intents.len() as u64;

        let mut surfaced_now: HashSet<String> = HashSet::new();
        for intent in intents {
            if intent.requires_confirmation {
                let key = intent_key(&intent);
                if !self.surfaced.contains(&key) {
                    tracing::info!(
                        kind = %intent.kind,
                        expiry = %intent.expiry,
                        rationale = %intent.rationale,
                        "awaiting manual confirmation"
                    );
                }
                surfaced_now.insert(key);
                continue;
            }
            self.execute(&intent, now)?;
        }
        self.surfaced = surfaced_now;
        Ok(())
    }

    fn execute(&mut self, intent: &TradeIntent, now: DateTime<Utc>) -> EngineResult<()> {
        self.engine.mark_submitted(intent)?;
        tracing::info!(kind = %intent.kind, expiry = %intent.expiry, rationale = %intent.rationale, "intent submitted");

        match self.venue.place(intent, now) {
            FillResult::Filled { prices, filled_at } => {
                if let Err(e) = self.engine.apply_fill(intent, &prices, filled_at) {
                    self.engine.mark_rejected(intent);
                    return Err(e);
                }
                self.stats.fills += 1;
                if intent.kind == IntentKind::Enter {
                    self.clock.record_entry(now);
                }
            }
            FillResult::Rejected { reason } => {
                self.engine.mark_rejected(intent);
                self.stats.rejections += 1;
                tracing::warn!(kind = %intent.kind, expiry = %intent.expiry, %reason, "intent rejected by venue");
            }
        }
        Ok(())
    }
}

fn intent_key(intent: &TradeIntent) -> String {
    let legs: Vec<String> = intent
        .legs
        .iter()
        .map(|l| format!("{}{}{}", l.leg_id.map(|id| id.to_string()).unwrap_or_default(), l.option_type, l.strike))
        .collect();
    format!("{}:{}:{}", intent.kind, intent.expiry, legs.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, StrategyConfig};
    use crate::execution::venue::PaperVenue;
    use crate::models::{black_scholes, years_to_expiry};
    use chrono::{Duration, NaiveDate, TimeZone};

    // 2026-01-05 10:00 IST
    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 4, 30, 0).unwrap()
    }

    fn quotes(at: DateTime<Utc>) -> Vec<OptionQuote> {
        let expiry = NaiveDate::from_ymd_opt(2026, 1, 19).unwrap();
        let tte = years_to_expiry(at, expiry, &SessionConfig::default());
        let mut out = Vec::new();
        for k in (21_000..=27_000).step_by(50) {
            for option_type in [OptionType::Call, OptionType::Put] {
                let (premium, delta) = black_scholes::price(24_000.0, k as f64, tte, 0.14, 0.0, option_type);
                out.push(OptionQuote {
                    strike: k as f64,
                    option_type,
                    premium,
                    implied_vol: 0.14,
                    delta,
                    expiry,
                    quoted_at: at,
                });
            }
        }
        out
    }

    fn engine(auto_trade: bool) -> StrategyEngine {
        let cfg = StrategyConfig {
            auto_trade,
            ..StrategyConfig::default()
        };
        StrategyEngine::new(cfg, SessionConfig::default()).unwrap()
    }

    async fn run(auto_trade: bool, events: Vec<EngineEvent>) -> (DriverStats, EngineSnapshot) {
        let (tx, rx) = mpsc::channel(64);
        let eng = engine(auto_trade);
        let (snap_tx, snap_rx) = watch::channel(eng.snapshot(None, WindowState::default()));
        let task = tokio::spawn(run_engine(
            eng,
            SessionClock::new(SessionConfig::default()),
            PaperVenue::new(0.0005),
            rx,
            snap_tx,
        ));
        for e in events {
            tx.send(e).await.unwrap();
        }
        tx.send(EngineEvent::Shutdown).await.unwrap();
        let stats = task.await.unwrap();
        let snapshot = snap_rx.borrow().clone();
        (stats, snapshot)
    }

    fn entry_feed() -> Vec<EngineEvent> {
        let sample = |secs: i64| {
            EngineEvent::Sample(StraddleSample {
                timestamp: t0() - Duration::seconds(secs),
                straddle_price: 210.0,
                vwap: 200.0,
            })
        };
        vec![
            sample(300),
            sample(0),
            EngineEvent::Quotes {
                spot: 24_000.0,
                quotes: quotes(t0()),
            },
            EngineEvent::Tick { now: t0() },
            EngineEvent::Tick {
                now: t0() + Duration::seconds(1),
            },
        ]
    }

    #[tokio::test]
    async fn test_auto_entry_fills_once_per_window() {
        let (stats, snap) = run(true, entry_feed()).await;
        assert_eq!(stats.fills, 1);
        assert_eq!(stats.cycles, 2);
        assert_eq!(snap.groups.len(), 1);
        assert_eq!(snap.groups[0].legs.len(), 2);
        assert_eq!(snap.signal.status, SignalStatus::Consumed);
        assert!(snap.window.entry_quota_used);
        assert_eq!(snap.capital.entries_today, 1);
    }

    #[tokio::test]
    async fn test_entry_waits_for_manual_trigger() {
        let (stats, snap) = run(false, entry_feed()).await;
        assert_eq!(stats.fills, 0);
        assert!(snap.groups.is_empty());
        assert_eq!(snap.signal.status, SignalStatus::Ready);

        let mut feed = entry_feed();
        feed.insert(3, EngineEvent::ManualEntry);
        let (stats, snap) = run(false, feed).await;
        assert_eq!(stats.fills, 1);
        assert_eq!(snap.groups.len(), 1);
    }

    #[tokio::test]
    async fn test_late_tick_does_not_cycle() {
        let mut feed = entry_feed();
        feed.push(EngineEvent::Tick {
            now: t0() - Duration::seconds(10),
        });
        let (stats, snap) = run(true, feed).await;
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.fills, 1);
        assert_eq!(snap.as_of, Some(t0() + Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_bad_sample_does_not_stop_loop() {
        let mut feed = entry_feed();
        feed.insert(
            2,
            EngineEvent::Sample(StraddleSample {
                timestamp: t0() - Duration::seconds(600),
                straddle_price: 100.0,
                vwap: 200.0,
            }),
        );
        let (stats, snap) = run(true, feed).await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.fills, 1);
        assert_eq!(snap.groups.len(), 1);
    }
}

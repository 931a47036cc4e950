pub mod driver;

use crate::config::{SessionConfig, StrategyConfig};
use crate::errors::{EngineError, EngineResult};
use crate::execution::orchestrator::{self, AutomationFlags, DecisionInputs, EntryProposal, MoveCandidate};
use crate::models::black_scholes::BlackScholes;
use crate::models::implied_vol::{implied_vol, IvInputs};
use crate::models::strike_selector::{
    chain_points, find_strike_for_delta, select_strangle, underlying_from_quotes, ChainContext, StrikeSelection,
};
use crate::models::{years_to_expiry, ModelParams, OptionPricer};
use crate::positions::{CapitalManager, LegFill, MoveOutcome, NewLeg, PositionManager, QuoteReport};
use crate::signal::tracker::SignalTracker;
use crate::state::*;
use chrono::{DateTime, NaiveDate, Utc};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// One strategy session: signal, positions, capital and the latest chain per
/// expiry, behind a single owner. Configuration is injected at construction.
///
/// `evaluate` takes `&self` and is pure. Everything that changes state is a
/// separate call made by whoever executes the intents.
#[derive(Debug, Clone)]
pub struct StrategyEngine {
    config: StrategyConfig,
    session: SessionConfig,
    model: BlackScholes,
    tracker: SignalTracker,
    positions: PositionManager,
    capital: CapitalManager,
    spot: f64,
    chains: BTreeMap<NaiveDate, Vec<OptionQuote>>,
}

impl StrategyEngine {
    pub fn new(config: StrategyConfig, session: SessionConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            tracker: SignalTracker::new(config.signal_duration_secs),
            positions: PositionManager::new(config.decay_basis, config.quote_max_age_secs),
            capital: CapitalManager::new(config.total_capital, config.capital_parts, config.max_entries_per_day),
            model: BlackScholes::new(),
            spot: 0.0,
            chains: BTreeMap::new(),
            config,
            session,
        })
    }

    #[inline]
    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    #[inline]
    pub fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.session.utc_offset).date_naive()
    }

    /// Fresh session: the signal rebuilds from scratch and the daily entry
    /// counter resets. Open legs carry over.
    pub fn begin_session(&mut self, today: NaiveDate) {
        self.tracker.reset();
        self.capital.roll_day(today);
        tracing::info!(day = %today, live_legs = self.positions.open_legs(None).len(), "session started");
    }

    // ── Inputs ──

    pub fn ingest_sample(&mut self, sample: &StraddleSample) -> EngineResult<SignalState> {
        self.tracker.observe(sample).inspect_err(|e| {
            tracing::warn!(error = %e, "sample rejected");
        })
    }

    /// Replace the chain of every expiry present in `quotes` and re-mark open
    /// legs. Stale quotes are dropped from both.
    pub fn ingest_quotes(&mut self, spot: f64, quotes: &[OptionQuote], now: DateTime<Utc>) -> QuoteReport {
        if spot > 0.0 {
            self.spot = spot;
        }

        let mut by_expiry: BTreeMap<NaiveDate, Vec<OptionQuote>> = BTreeMap::new();
        for q in quotes {
            by_expiry.entry(q.expiry).or_default().push(q.clone());
        }

        let mut marked: Vec<OptionQuote> = Vec::with_capacity(quotes.len());
        for (expiry, mut chain) in by_expiry {
            self.fill_missing_deltas(expiry, &mut chain, now);
            marked.extend(chain.iter().cloned());
            chain.retain(|q| self.is_fresh(q, now));
            self.chains.insert(expiry, chain);
        }

        let report = self.positions.update_quotes(&marked, now);
        for e in &report.stale {
            tracing::warn!(error = %e, "stale quote ignored");
        }
        report
    }

    fn is_fresh(&self, q: &OptionQuote, now: DateTime<Utc>) -> bool {
        (now - q.quoted_at).num_seconds() <= self.config.quote_max_age_secs
    }

    /// Feeds that omit delta get one from the model, backing out a vol from
    /// the premium when the quote carries none.
    fn fill_missing_deltas(&self, expiry: NaiveDate, chain: &mut [OptionQuote], now: DateTime<Utc>) {
        let ctx = ChainContext {
            underlying: underlying_from_quotes(self.spot, chain),
            tte_years: years_to_expiry(now, expiry, &self.session),
            rate: self.config.risk_free_rate,
            dividend: self.config.dividend_yield,
        };

        for q in chain.iter_mut().filter(|q| q.delta == 0.0 && q.premium > 0.0) {
            let vol = if q.implied_vol > 0.0 {
                Some(q.implied_vol)
            } else {
                implied_vol(
                    &self.model,
                    &IvInputs {
                        market_price: q.premium,
                        spot: ctx.underlying,
                        strike: q.strike,
                        tte_years: ctx.tte_years,
                        rate: ctx.rate,
                        dividend: ctx.dividend,
                        option_type: q.option_type,
                    },
                )
                .ok()
            };

            if let Some(vol) = vol {
                let params = ModelParams::new(ctx.underlying, q.strike, ctx.tte_years, vol, ctx.rate, ctx.dividend);
                q.implied_vol = vol;
                q.delta = self.model.price(&params, q.option_type).delta;
            }
        }
    }

    // ── Decision cycle (read-only) ──

    /// Intents for this cycle. Calling it again with nothing changed returns
    /// the same intents and changes nothing.
    pub fn evaluate(&self, now: DateTime<Utc>, window: WindowState, manual_entry: bool) -> SmallVec<[TradeIntent; 8]> {
        let today = self.trading_day(now);
        let signal = self.tracker.state();
        let pct = self.config.profit_target_pct;

        let entry = if signal.status == SignalStatus::Ready && window.entry_permitted() {
            self.entry_proposal(now)
        } else {
            None
        };

        let moves: Vec<MoveCandidate> = self
            .positions
            .evaluate_move_candidates(self.config.move_decay_threshold, now)
            .into_iter()
            .filter_map(|leg| {
                let decay = leg.decay(self.positions.decay_basis())?;
                let replacement = self.replacement_for(&leg, now)?;
                Some(MoveCandidate { leg, replacement, decay })
            })
            .collect();

        let exits = self.positions.evaluate_exit_candidates(pct, now);

        let dte_exits: Vec<ExpiryGroup> = self
            .positions
            .expiry_groups(pct)
            .into_iter()
            .filter(|g| g.days_to_expiry(today) <= self.config.exit_dte)
            .filter(|g| self.positions.group_is_settled(g, now))
            .collect();

        orchestrator::decide(&DecisionInputs {
            signal,
            window,
            flags: AutomationFlags {
                auto_trade: self.config.auto_trade,
                auto_move: self.config.auto_move,
                auto_exit: self.config.auto_exit,
            },
            manual_entry,
            capital_available: self.capital.can_enter(today),
            entry: entry.as_ref(),
            moves: &moves,
            exits: &exits,
            dte_exits: &dte_exits,
        })
    }

    /// Expiry whose days-to-expiry is nearest the configured entry DTE,
    /// if one is quoted within the tolerance.
    fn entry_expiry(&self, today: NaiveDate) -> Option<NaiveDate> {
        let distance = |e: &NaiveDate| ((*e - today).num_days() - self.config.entry_dte).abs();
        self.chains
            .keys()
            .copied()
            .filter(|e| *e >= today)
            .filter(|e| distance(e) <= self.config.entry_dte_tolerance)
            .min_by_key(|e| distance(e))
    }

    fn chain_context(&self, expiry: NaiveDate, now: DateTime<Utc>) -> Option<(ChainContext, Vec<OptionQuote>)> {
        let quotes: Vec<OptionQuote> = self
            .chains
            .get(&expiry)?
            .iter()
            .filter(|q| self.is_fresh(q, now))
            .cloned()
            .collect();
        let tte_years = years_to_expiry(now, expiry, &self.session);
        if quotes.is_empty() || tte_years <= 0.0 {
            return None;
        }

        let ctx = ChainContext {
            underlying: underlying_from_quotes(self.spot, &quotes),
            tte_years,
            rate: self.config.risk_free_rate,
            dividend: self.config.dividend_yield,
        };
        Some((ctx, quotes))
    }

    fn entry_proposal(&self, now: DateTime<Utc>) -> Option<EntryProposal> {
        let expiry = self.entry_expiry(self.trading_day(now))?;
        let (ctx, quotes) = self.chain_context(expiry, now)?;
        let calls = chain_points(&self.model, &ctx, &quotes, OptionType::Call);
        let puts = chain_points(&self.model, &ctx, &quotes, OptionType::Put);

        let band = (self.config.target_delta_lower, self.config.target_delta_upper);
        match select_strangle(&self.model, &ctx, &calls, &puts, self.config.target_delta, band) {
            Ok(selection) => Some(EntryProposal {
                expiry,
                selection,
                quantity: self.config.entry_quantity(),
            }),
            Err(e) => {
                tracing::warn!(expiry = %expiry, error = %e, "no strangle this cycle");
                None
            }
        }
    }

    /// Strike on the same side and expiry at the target delta, unless that is
    /// the leg's own strike or already held.
    fn replacement_for(&self, leg: &Leg, now: DateTime<Utc>) -> Option<StrikeSelection> {
        let (ctx, quotes) = self.chain_context(leg.expiry, now)?;
        let otm: Vec<_> = chain_points(&self.model, &ctx, &quotes, leg.option_type)
            .into_iter()
            .filter(|p| match leg.option_type {
                OptionType::Call => p.strike > ctx.underlying,
                OptionType::Put => p.strike < ctx.underlying,
            })
            .collect();

        let selection = match find_strike_for_delta(&self.model, &ctx, &otm, self.config.target_delta, leg.option_type) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(leg = %leg.id, error = %e, "no replacement strike this cycle");
                return None;
            }
        };

        let key = LegKey::new(leg.expiry, selection.strike, leg.option_type);
        if key == leg.key() {
            return None;
        }
        if self.positions.open_legs(Some(leg.expiry)).iter().any(|l| l.key() == key) {
            tracing::debug!(leg = %leg.id, strike = selection.strike, "replacement strike already held");
            return None;
        }
        Some(selection)
    }

    // ── Execution feedback ──

    /// An intent went to the venue: park its legs so they are not re-proposed.
    pub fn mark_submitted(&mut self, intent: &TradeIntent) -> EngineResult<()> {
        let ids: Vec<LegId> = intent.closing_leg_ids().collect();
        match intent.kind {
            IntentKind::Enter => Ok(()),
            IntentKind::Move => self.positions.set_pending(&ids, LegStatus::PendingMove),
            IntentKind::Exit => self.positions.set_pending(&ids, LegStatus::PendingExit),
        }
    }

    /// The venue refused the intent; its legs are Open again.
    pub fn mark_rejected(&mut self, intent: &TradeIntent) {
        let ids: Vec<LegId> = intent.closing_leg_ids().collect();
        self.positions.release_pending(&ids);
    }

    /// Book a confirmed fill. `prices` line up with `intent.legs`.
    pub fn apply_fill(&mut self, intent: &TradeIntent, prices: &[f64], at: DateTime<Utc>) -> EngineResult<()> {
        if prices.len() != intent.legs.len() {
            return Err(EngineError::InvalidTransition(format!(
                "{} intent has {} legs but {} fill prices",
                intent.kind,
                intent.legs.len(),
                prices.len()
            )));
        }

        match intent.kind {
            IntentKind::Enter => {
                let news: Vec<NewLeg> = intent
                    .legs
                    .iter()
                    .zip(prices)
                    .map(|(l, p)| new_leg(l, *p, at))
                    .collect();
                self.positions.open_legs_atomic(&news)?;
                if self.capital.allocate(intent.expiry, self.trading_day(at)).is_none() {
                    tracing::warn!(expiry = %intent.expiry, "entry filled without a free capital part");
                }
                if let Err(e) = self.tracker.consume() {
                    tracing::warn!(error = %e, "entry filled after the signal lapsed");
                }
                Ok(())
            }
            IntentKind::Exit => {
                let fills: Vec<LegFill> = intent
                    .legs
                    .iter()
                    .zip(prices)
                    .filter_map(|(l, p)| l.leg_id.map(|leg_id| LegFill { leg_id, exit_premium: *p }))
                    .collect();
                self.confirm_close(&fills, at).map(|_| ())
            }
            IntentKind::Move => {
                let (Some(close), Some(open)) = (
                    intent.legs.iter().position(|l| l.leg_id.is_some()),
                    intent.legs.iter().position(|l| l.leg_id.is_none()),
                ) else {
                    return Err(EngineError::InvalidTransition("move intent needs one closing and one opening leg".into()));
                };
                let old = LegFill {
                    leg_id: intent.legs[close].leg_id.ok_or(EngineError::InvalidTransition("missing leg id".into()))?,
                    exit_premium: prices[close],
                };
                self.confirm_move(old, new_leg(&intent.legs[open], prices[open], at), at)
                    .map(|_| ())
            }
        }
    }

    pub fn open_leg(&mut self, new: NewLeg) -> EngineResult<LegId> {
        self.positions.open_leg(new)
    }

    pub fn confirm_close(&mut self, fills: &[LegFill], at: DateTime<Utc>) -> EngineResult<Vec<Leg>> {
        let closed = self.positions.confirm_close(fills, at)?;
        let mut expiries: Vec<NaiveDate> = closed.iter().map(|l| l.expiry).collect();
        expiries.dedup();
        for expiry in expiries {
            self.release_if_flat(expiry);
        }
        Ok(closed)
    }

    pub fn confirm_move(&mut self, old: LegFill, new: NewLeg, at: DateTime<Utc>) -> EngineResult<MoveOutcome> {
        self.positions.confirm_move(old, new, at)
    }

    /// Manual signal consumption, for entries placed outside the engine.
    pub fn consume_signal(&mut self) -> EngineResult<()> {
        self.tracker.consume()
    }

    fn release_if_flat(&mut self, expiry: NaiveDate) {
        if self.positions.open_legs(Some(expiry)).is_empty() {
            self.capital.release(expiry);
        }
    }

    // ── Queries (owned snapshots) ──

    #[inline]
    pub fn signal_state(&self) -> SignalState {
        self.tracker.state()
    }

    pub fn open_legs(&self, expiry: Option<NaiveDate>) -> Vec<Leg> {
        self.positions.open_legs(expiry)
    }

    pub fn closed_legs(&self) -> Vec<Leg> {
        self.positions.closed_legs().to_vec()
    }

    pub fn expiry_summary(&self, expiry: NaiveDate) -> Option<ExpiryGroup> {
        self.positions.expiry_group(expiry, self.config.profit_target_pct)
    }

    pub fn snapshot(&self, as_of: Option<DateTime<Utc>>, window: WindowState) -> EngineSnapshot {
        EngineSnapshot {
            as_of,
            signal: self.tracker.state(),
            window,
            groups: self.positions.expiry_groups(self.config.profit_target_pct),
            total_realized: self.positions.total_realized(),
            total_unrealized: self.positions.total_unrealized(),
            capital: self.capital.status(),
        }
    }
}

fn new_leg(l: &IntentLeg, price: f64, at: DateTime<Utc>) -> NewLeg {
    NewLeg {
        expiry: l.expiry,
        strike: l.strike,
        option_type: l.option_type,
        quantity: l.quantity,
        entry_premium: price,
        entry_delta: l.reference_delta,
        opened_at: at,
    }
}

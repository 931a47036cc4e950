use crate::errors::{EngineError, EngineResult};
use crate::state::{DecayBasis, ExpiryGroup, Leg, LegId, LegKey, LegStatus, OptionQuote, OptionType, Side};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Decay and profit comparisons tolerate float noise at the threshold.
const THRESHOLD_EPS: f64 = 1e-9;

/// Parameters of a leg about to be recorded as filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewLeg {
    pub expiry: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
    pub quantity: u32,
    pub entry_premium: f64,
    pub entry_delta: f64,
    pub opened_at: DateTime<Utc>,
}

impl NewLeg {
    #[inline]
    fn key(&self) -> LegKey {
        LegKey::new(self.expiry, self.strike, self.option_type)
    }
}

/// Broker-confirmed exit price for a leg.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegFill {
    pub leg_id: LegId,
    pub exit_premium: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub closed: Leg,
    pub opened: Leg,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteReport {
    /// Quotes that refreshed a live leg
    pub applied: usize,
    /// Quotes matched to a live leg but too old to trust
    pub stale: Vec<EngineError>,
}

/// Owns every leg. Live legs are mutated only through this API; closed legs
/// move to an append-only archive, which is what realized profit is summed from.
///
/// Evaluations only report candidates. Nothing changes until the execution
/// layer confirms a fill, so this state never runs ahead of the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionManager {
    live: BTreeMap<LegId, Leg>,
    archive: Vec<Leg>,
    next_id: u64,
    decay_basis: DecayBasis,
    quote_max_age_secs: i64,
}

impl PositionManager {
    pub fn new(decay_basis: DecayBasis, quote_max_age_secs: i64) -> Self {
        Self {
            live: BTreeMap::new(),
            archive: Vec::new(),
            next_id: 1,
            decay_basis,
            quote_max_age_secs,
        }
    }

    #[inline]
    pub fn decay_basis(&self) -> DecayBasis {
        self.decay_basis
    }

    // ── Queries (snapshots, never live references) ──

    pub fn leg(&self, id: LegId) -> Option<Leg> {
        self.live
            .get(&id)
            .cloned()
            .or_else(|| self.archive.iter().find(|l| l.id == id).cloned())
    }

    pub fn open_legs(&self, expiry: Option<NaiveDate>) -> Vec<Leg> {
        self.live
            .values()
            .filter(|l| expiry.map_or(true, |e| l.expiry == e))
            .cloned()
            .collect()
    }

    #[inline]
    pub fn closed_legs(&self) -> &[Leg] {
        &self.archive
    }

    pub fn realized_for(&self, expiry: NaiveDate) -> f64 {
        self.archive
            .iter()
            .filter(|l| l.expiry == expiry)
            .filter_map(Leg::realized)
            .sum()
    }

    pub fn total_realized(&self) -> f64 {
        self.archive.iter().filter_map(Leg::realized).sum()
    }

    pub fn total_unrealized(&self) -> f64 {
        self.live.values().map(Leg::unrealized).sum()
    }

    pub fn live_expiries(&self) -> BTreeSet<NaiveDate> {
        self.live.values().map(|l| l.expiry).collect()
    }

    /// Derived per-expiry view. None when nothing is live for `expiry`.
    pub fn expiry_group(&self, expiry: NaiveDate, target_profit_pct: f64) -> Option<ExpiryGroup> {
        let legs = self.open_legs(Some(expiry));
        if legs.is_empty() {
            return None;
        }

        let realized_profit = self.realized_for(expiry);
        let unrealized_profit = legs.iter().map(Leg::unrealized).sum();
        let max_profit = legs.iter().map(Leg::max_profit).sum();

        Some(ExpiryGroup {
            expiry,
            legs,
            max_profit,
            realized_profit,
            unrealized_profit,
            target_profit_pct,
        })
    }

    pub fn expiry_groups(&self, target_profit_pct: f64) -> Vec<ExpiryGroup> {
        self.live_expiries()
            .into_iter()
            .filter_map(|e| self.expiry_group(e, target_profit_pct))
            .collect()
    }

    // ── Evaluations (read-only) ──

    /// Open legs with a fresh mark whose decay has reached `decay_threshold`.
    pub fn evaluate_move_candidates(&self, decay_threshold: f64, now: DateTime<Utc>) -> Vec<Leg> {
        self.live
            .values()
            .filter(|l| l.status == LegStatus::Open)
            .filter(|l| l.mark_is_fresh(now, self.quote_max_age_secs))
            .filter(|l| {
                l.decay(self.decay_basis)
                    .map_or(false, |d| d + THRESHOLD_EPS >= decay_threshold)
            })
            .cloned()
            .collect()
    }

    /// Expiry groups whose realized plus open profit has reached the target.
    /// Groups with a working order or a stale mark are skipped.
    pub fn evaluate_exit_candidates(&self, profit_target_pct: f64, now: DateTime<Utc>) -> Vec<ExpiryGroup> {
        self.expiry_groups(profit_target_pct)
            .into_iter()
            .filter(|g| self.group_is_settled(g, now))
            .filter(ExpiryGroup::target_reached)
            .collect()
    }

    /// Every live leg is Open and freshly marked.
    pub fn group_is_settled(&self, group: &ExpiryGroup, now: DateTime<Utc>) -> bool {
        group
            .legs
            .iter()
            .all(|l| l.status == LegStatus::Open && l.mark_is_fresh(now, self.quote_max_age_secs))
    }

    // ── Mutations ──

    pub fn open_leg(&mut self, new: NewLeg) -> EngineResult<LegId> {
        self.open_legs_atomic(&[new])?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::InvalidTransition("leg was not opened".into()))
    }

    /// Open several legs or none of them.
    pub fn open_legs_atomic(&mut self, news: &[NewLeg]) -> EngineResult<Vec<LegId>> {
        let mut seen: HashSet<LegKey> = HashSet::new();
        for new in news {
            validate_new(new)?;
            if !seen.insert(new.key()) || self.find_live(new.key()).is_some() {
                return Err(duplicate(new));
            }
        }

        Ok(news.iter().map(|new| self.insert(new)).collect())
    }

    /// Refresh marks from a market snapshot. Applying the same snapshot twice
    /// leaves the same state as applying it once.
    pub fn update_quotes(&mut self, quotes: &[OptionQuote], now: DateTime<Utc>) -> QuoteReport {
        let mut report = QuoteReport::default();

        for q in quotes {
            let key = LegKey::new(q.expiry, q.strike, q.option_type);
            let Some(id) = self.find_live(key) else {
                continue;
            };

            let age_secs = (now - q.quoted_at).num_seconds();
            if age_secs > self.quote_max_age_secs {
                report.stale.push(EngineError::StaleQuote {
                    strike: q.strike,
                    option_type: q.option_type,
                    age_secs,
                    max_age_secs: self.quote_max_age_secs,
                });
                continue;
            }

            if let Some(leg) = self.live.get_mut(&id) {
                if q.quoted_at < leg.marked_at {
                    continue;
                }
                leg.current_premium = q.premium;
                leg.current_delta = q.delta;
                leg.marked_at = q.quoted_at;
                report.applied += 1;
            }
        }

        report
    }

    /// Move Open legs to a pending state while an order works. All or nothing.
    pub fn set_pending(&mut self, ids: &[LegId], status: LegStatus) -> EngineResult<()> {
        if !matches!(status, LegStatus::PendingMove | LegStatus::PendingExit) {
            return Err(EngineError::InvalidTransition(format!("{status:?} is not a pending state")));
        }
        for id in ids {
            let leg = self.live.get(id).ok_or(EngineError::UnknownLeg(*id))?;
            if leg.status != LegStatus::Open {
                return Err(EngineError::InvalidTransition(format!(
                    "{id} is {:?}, expected Open",
                    leg.status
                )));
            }
        }
        for id in ids {
            if let Some(leg) = self.live.get_mut(id) {
                leg.status = status;
            }
        }
        Ok(())
    }

    /// The order for these legs was rejected or cancelled; they are plain Open again.
    pub fn release_pending(&mut self, ids: &[LegId]) {
        for id in ids {
            if let Some(leg) = self.live.get_mut(id) {
                if matches!(leg.status, LegStatus::PendingMove | LegStatus::PendingExit) {
                    leg.status = LegStatus::Open;
                }
            }
        }
    }

    /// Book confirmed exits. Validates every fill before touching any leg.
    pub fn confirm_close(&mut self, fills: &[LegFill], at: DateTime<Utc>) -> EngineResult<Vec<Leg>> {
        let mut seen: HashSet<LegId> = HashSet::new();
        for f in fills {
            if !self.live.contains_key(&f.leg_id) || !seen.insert(f.leg_id) {
                return Err(EngineError::UnknownLeg(f.leg_id));
            }
            validate_premium(f.exit_premium)?;
        }

        Ok(fills.iter().filter_map(|f| self.close(*f, at)).collect())
    }

    /// Book a confirmed roll: the old leg closes at its exit premium and the
    /// replacement opens at its own fresh entry premium and delta.
    pub fn confirm_move(&mut self, old: LegFill, new: NewLeg, at: DateTime<Utc>) -> EngineResult<MoveOutcome> {
        if !self.live.contains_key(&old.leg_id) {
            return Err(EngineError::UnknownLeg(old.leg_id));
        }
        validate_premium(old.exit_premium)?;
        validate_new(&new)?;
        if let Some(existing) = self.find_live(new.key()) {
            if existing != old.leg_id {
                return Err(duplicate(&new));
            }
        }

        let closed = self.close(old, at).ok_or(EngineError::UnknownLeg(old.leg_id))?;
        let id = self.insert(&new);
        let opened = self.live.get(&id).cloned().ok_or(EngineError::UnknownLeg(id))?;

        tracing::info!(
            from = closed.strike,
            to = opened.strike,
            option_type = %opened.option_type,
            booked = closed.realized().unwrap_or(0.0),
            "leg moved"
        );

        Ok(MoveOutcome { closed, opened })
    }

    fn find_live(&self, key: LegKey) -> Option<LegId> {
        self.live.values().find(|l| l.key() == key).map(|l| l.id)
    }

    fn insert(&mut self, new: &NewLeg) -> LegId {
        let id = LegId(self.next_id);
        self.next_id += 1;

        let leg = Leg {
            id,
            expiry: new.expiry,
            strike: new.strike,
            option_type: new.option_type,
            side: Side::Sell,
            entry_premium: new.entry_premium,
            entry_delta: new.entry_delta,
            quantity: new.quantity,
            current_premium: new.entry_premium,
            current_delta: new.entry_delta,
            opened_at: new.opened_at,
            status: LegStatus::Open,
            marked_at: new.opened_at,
            exit_premium: None,
            closed_at: None,
        };

        tracing::info!(
            %id,
            expiry = %leg.expiry,
            strike = leg.strike,
            option_type = %leg.option_type,
            premium = leg.entry_premium,
            delta = leg.entry_delta,
            quantity = leg.quantity,
            "leg opened"
        );

        self.live.insert(id, leg);
        id
    }

    fn close(&mut self, fill: LegFill, at: DateTime<Utc>) -> Option<Leg> {
        let mut leg = self.live.remove(&fill.leg_id)?;
        leg.status = LegStatus::Closed;
        leg.exit_premium = Some(fill.exit_premium);
        leg.current_premium = fill.exit_premium;
        leg.closed_at = Some(at);

        tracing::info!(
            id = %leg.id,
            strike = leg.strike,
            option_type = %leg.option_type,
            entry = leg.entry_premium,
            exit = fill.exit_premium,
            pnl = leg.realized().unwrap_or(0.0),
            "leg closed"
        );

        self.archive.push(leg.clone());
        Some(leg)
    }
}

fn validate_new(new: &NewLeg) -> EngineResult<()> {
    validate_premium(new.entry_premium)?;
    if new.quantity == 0 {
        return Err(EngineError::InvalidTransition("leg quantity must be non-zero".into()));
    }
    if !new.strike.is_finite() || new.strike <= 0.0 || !new.entry_delta.is_finite() {
        return Err(EngineError::InvalidTransition(format!(
            "bad leg terms: strike {} delta {}",
            new.strike, new.entry_delta
        )));
    }
    Ok(())
}

fn validate_premium(p: f64) -> EngineResult<()> {
    if p.is_finite() && p >= 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition(format!("bad premium {p}")))
    }
}

fn duplicate(new: &NewLeg) -> EngineError {
    EngineError::DuplicateLeg {
        expiry: new.expiry,
        strike: new.strike,
        option_type: new.option_type,
    }
}

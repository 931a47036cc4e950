use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Strike prices are compared on a 0.01 grid so float noise never splits a key.
const STRIKE_TICKS_PER_POINT: f64 = 100.0;

// ── Option primitives ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// +1 for calls, -1 for puts. Matches the sign convention of delta.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Self::Call => 1.0,
            Self::Put => -1.0,
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "CE"),
            Self::Put => write!(f, "PE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Sell,
    Buy,
}

/// Immutable market snapshot for one contract. Replaced wholesale on each refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionQuote {
    pub strike: f64,
    pub option_type: OptionType,
    pub premium: f64,
    /// Annualised, decimal. Zero or negative means the feed had none.
    #[serde(default)]
    pub implied_vol: f64,
    #[serde(default)]
    pub delta: f64,
    pub expiry: NaiveDate,
    pub quoted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StraddleSample {
    pub timestamp: DateTime<Utc>,
    pub straddle_price: f64,
    pub vwap: f64,
}

impl StraddleSample {
    #[inline]
    pub fn premium_elevated(&self) -> bool {
        self.straddle_price > self.vwap
    }
}

// ── Signal State Machine ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Idle,
    Confirming,
    Ready,
    Consumed,
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Confirming => write!(f, "confirming"),
            Self::Ready => write!(f, "ready"),
            Self::Consumed => write!(f, "consumed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalState {
    pub status: SignalStatus,
    pub confirming_since: Option<DateTime<Utc>>,
}

impl Default for SignalState {
    fn default() -> Self {
        Self {
            status: SignalStatus::Idle,
            confirming_since: None,
        }
    }
}

impl SignalState {
    /// Seconds the condition has held as of `now`, zero when not confirming.
    pub fn held_for_secs(&self, now: DateTime<Utc>) -> i64 {
        self.confirming_since
            .map(|since| (now - since).num_seconds().max(0))
            .unwrap_or(0)
    }
}

// ── Legs ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LegId(pub u64);

impl std::fmt::Display for LegId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "leg-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Open,
    PendingMove,
    PendingExit,
    Closed,
}

/// Identity of a contract position: at most one live leg per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LegKey {
    pub expiry: NaiveDate,
    pub strike_ticks: i64,
    pub option_type: OptionType,
}

impl LegKey {
    pub fn new(expiry: NaiveDate, strike: f64, option_type: OptionType) -> Self {
        Self {
            expiry,
            strike_ticks: (strike * STRIKE_TICKS_PER_POINT).round() as i64,
            option_type,
        }
    }
}

/// How decay is measured against entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayBasis {
    /// 1 - |current delta| / |entry delta|
    Delta,
    /// 1 - current premium / entry premium
    Premium,
}

impl std::str::FromStr for DecayBasis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delta" => Ok(Self::Delta),
            "premium" => Ok(Self::Premium),
            other => Err(format!("unknown decay basis '{other}'")),
        }
    }
}

/// A short option position. Owned by the position manager; callers only ever see clones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Leg {
    pub id: LegId,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
    pub side: Side,
    pub entry_premium: f64,
    pub entry_delta: f64,
    pub quantity: u32,
    pub current_premium: f64,
    pub current_delta: f64,
    pub opened_at: DateTime<Utc>,
    pub status: LegStatus,
    /// Timestamp of the quote behind current_premium/current_delta
    pub marked_at: DateTime<Utc>,
    pub exit_premium: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Leg {
    #[inline]
    pub fn key(&self) -> LegKey {
        LegKey::new(self.expiry, self.strike, self.option_type)
    }

    /// Open or working an order. Pending legs are still held at the broker.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.status != LegStatus::Closed
    }

    /// Fractional decay since entry. None once closed or when entry is zero.
    pub fn decay(&self, basis: DecayBasis) -> Option<f64> {
        if !self.is_live() {
            return None;
        }
        let (entry, current) = match basis {
            DecayBasis::Delta => (self.entry_delta.abs(), self.current_delta.abs()),
            DecayBasis::Premium => (self.entry_premium, self.current_premium),
        };
        if entry <= 0.0 {
            return None;
        }
        Some(1.0 - current / entry)
    }

    /// Mark-to-market P&L of the short position.
    #[inline]
    pub fn unrealized(&self) -> f64 {
        if !self.is_live() {
            return 0.0;
        }
        (self.entry_premium - self.current_premium) * self.quantity as f64
    }

    #[inline]
    pub fn realized(&self) -> Option<f64> {
        self.exit_premium
            .map(|exit| (self.entry_premium - exit) * self.quantity as f64)
    }

    #[inline]
    pub fn max_profit(&self) -> f64 {
        self.entry_premium * self.quantity as f64
    }

    #[inline]
    pub fn mark_is_fresh(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        (now - self.marked_at).num_seconds() <= max_age_secs
    }
}

// ── Expiry Groups (derived view) ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpiryGroup {
    pub expiry: NaiveDate,
    /// Live legs only; closed legs contribute through realized_profit.
    pub legs: Vec<Leg>,
    pub max_profit: f64,
    pub realized_profit: f64,
    pub unrealized_profit: f64,
    pub target_profit_pct: f64,
}

impl ExpiryGroup {
    #[inline]
    pub fn total_profit(&self) -> f64 {
        self.realized_profit + self.unrealized_profit
    }

    #[inline]
    pub fn profit_fraction(&self) -> f64 {
        if self.max_profit <= 0.0 {
            return 0.0;
        }
        self.total_profit() / self.max_profit
    }

    #[inline]
    pub fn target_reached(&self) -> bool {
        self.max_profit > 0.0
            && self.total_profit() + 1e-9 >= self.target_profit_pct * self.max_profit
    }

    pub fn days_to_expiry(&self, today: NaiveDate) -> i64 {
        (self.expiry - today).num_days()
    }
}

// ── Trade Intents ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Enter,
    Move,
    Exit,
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enter => write!(f, "enter"),
            Self::Move => write!(f, "move"),
            Self::Exit => write!(f, "exit"),
        }
    }
}

/// One order-level instruction inside an intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentLeg {
    /// Existing leg being closed; None for a leg to be opened.
    pub leg_id: Option<LegId>,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
    pub side: Side,
    pub quantity: u32,
    pub reference_premium: f64,
    pub reference_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeIntent {
    pub kind: IntentKind,
    pub expiry: NaiveDate,
    pub legs: SmallVec<[IntentLeg; 2]>,
    pub rationale: String,
    /// Surfaced for a human to confirm rather than for automatic execution.
    pub requires_confirmation: bool,
}

impl TradeIntent {
    pub fn closing_leg_ids(&self) -> impl Iterator<Item = LegId> + '_ {
        self.legs.iter().filter_map(|l| l.leg_id)
    }
}

// ── Window Gating (environmental, supplied per cycle) ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingWindow {
    Morning,
    Afternoon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowState {
    pub inside_entry_window: bool,
    pub entry_quota_used: bool,
    pub inside_exit_window: bool,
    #[serde(default)]
    pub active_window: Option<TradingWindow>,
}

impl WindowState {
    #[inline]
    pub fn entry_permitted(&self) -> bool {
        self.inside_entry_window && !self.entry_quota_used
    }
}

// ── Messages INTO the engine task ──

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Sample(StraddleSample),
    Quotes {
        spot: f64,
        quotes: Vec<OptionQuote>,
    },
    Tick {
        now: DateTime<Utc>,
    },
    ManualEntry,
    Shutdown,
}

// ── Engine snapshot for dashboard (sent via watch channel) ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapitalStatus {
    pub total_capital: f64,
    pub capital_per_part: f64,
    pub total_parts: usize,
    pub available_parts: usize,
    pub entries_today: u32,
    pub max_entries_per_day: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub as_of: Option<DateTime<Utc>>,
    pub signal: SignalState,
    pub window: WindowState,
    pub groups: Vec<ExpiryGroup>,
    pub total_realized: f64,
    pub total_unrealized: f64,
    pub capital: CapitalStatus,
}

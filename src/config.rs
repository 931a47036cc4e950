use crate::errors::{EngineError, EngineResult};
use crate::state::DecayBasis;
use chrono::{FixedOffset, NaiveTime, Offset, Utc};

/// Strategy parameters injected into the engine at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub target_delta: f64,
    pub target_delta_lower: f64,
    pub target_delta_upper: f64,
    pub move_decay_threshold: f64,
    pub profit_target_pct: f64,
    pub signal_duration_secs: i64,
    pub decay_basis: DecayBasis,
    pub quote_max_age_secs: i64,
    pub auto_trade: bool,
    pub auto_move: bool,
    pub auto_exit: bool,
    pub risk_free_rate: f64,
    pub dividend_yield: f64,
    pub lots_per_trade: u32,
    pub lot_size: u32,
    pub entry_dte: i64,
    /// Largest accepted distance in days between an expiry's DTE and `entry_dte`
    pub entry_dte_tolerance: i64,
    pub exit_dte: i64,
    pub total_capital: f64,
    pub capital_parts: usize,
    pub max_entries_per_day: u32,
    pub slippage_pct: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            target_delta: 0.07,
            target_delta_lower: 0.06,
            target_delta_upper: 0.08,
            move_decay_threshold: 0.60,
            profit_target_pct: 0.50,
            signal_duration_secs: 300,
            decay_basis: DecayBasis::Delta,
            quote_max_age_secs: 120,
            auto_trade: false,
            auto_move: false,
            auto_exit: false,
            // Futures mode: carry is already in the synthetic underlying
            risk_free_rate: 0.0,
            dividend_yield: 0.0,
            lots_per_trade: 1,
            lot_size: 65,
            entry_dte: 14,
            entry_dte_tolerance: 2,
            exit_dte: 7,
            total_capital: 100_000.0,
            capital_parts: 6,
            max_entries_per_day: 2,
            slippage_pct: 0.0005,
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> EngineResult<()> {
        fn unit(name: &str, v: f64) -> EngineResult<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(EngineError::Config(format!("{name} must be within [0, 1], got {v}")))
            }
        }

        unit("TARGET_DELTA", self.target_delta)?;
        unit("MOVE_DECAY_THRESHOLD", self.move_decay_threshold)?;
        unit("PROFIT_TARGET_PCT", self.profit_target_pct)?;
        unit("SLIPPAGE_PCT", self.slippage_pct)?;

        if self.target_delta <= 0.0 {
            return Err(EngineError::Config("TARGET_DELTA must be positive".into()));
        }
        if !(self.target_delta_lower <= self.target_delta && self.target_delta <= self.target_delta_upper) {
            return Err(EngineError::Config(format!(
                "delta band {}..{} must contain target {}",
                self.target_delta_lower, self.target_delta_upper, self.target_delta
            )));
        }
        if self.signal_duration_secs < 0 {
            return Err(EngineError::Config("SIGNAL_DURATION_SECS must be >= 0".into()));
        }
        if self.quote_max_age_secs <= 0 {
            return Err(EngineError::Config("QUOTE_MAX_AGE_SECS must be > 0".into()));
        }
        if self.lots_per_trade == 0 || self.lot_size == 0 {
            return Err(EngineError::Config("lot quantities must be non-zero".into()));
        }
        if self.lots_per_trade.checked_mul(self.lot_size).is_none() {
            return Err(EngineError::Config(format!(
                "LOT_QUANTITY {} x LOT_SIZE {} overflows",
                self.lots_per_trade, self.lot_size
            )));
        }
        if self.entry_dte_tolerance < 0 {
            return Err(EngineError::Config("ENTRY_DTE_TOLERANCE must be >= 0".into()));
        }
        if self.capital_parts == 0 {
            return Err(EngineError::Config("CAPITAL_PARTS must be non-zero".into()));
        }
        if self.exit_dte > self.entry_dte {
            return Err(EngineError::Config(format!(
                "EXIT_DTE {} exceeds ENTRY_DTE {}",
                self.exit_dte, self.entry_dte
            )));
        }
        Ok(())
    }

    /// Units per entry leg: lots times lot size.
    #[inline]
    pub fn entry_quantity(&self) -> u32 {
        self.lots_per_trade.saturating_mul(self.lot_size)
    }
}

/// A half-open wall-clock interval [start, end) in exchange local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpan {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WindowSpan {
    #[inline]
    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

impl std::str::FromStr for WindowSpan {
    type Err = EngineError;

    /// Parses `HH:MM-HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once('-')
            .ok_or_else(|| EngineError::Config(format!("window '{s}' must look like HH:MM-HH:MM")))?;
        let start = parse_hhmm(a)?;
        let end = parse_hhmm(b)?;
        if start >= end {
            return Err(EngineError::Config(format!("window '{s}' ends before it starts")));
        }
        Ok(Self { start, end })
    }
}

/// Exchange session layout. Times are local to `utc_offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub utc_offset: FixedOffset,
    pub market: WindowSpan,
    pub morning: WindowSpan,
    pub afternoon: WindowSpan,
    pub max_trades_per_window: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            utc_offset: ist(),
            market: span(9, 15, 15, 30),
            morning: span(9, 30, 13, 15),
            afternoon: span(13, 15, 15, 15),
            max_trades_per_window: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub strategy: StrategyConfig,
    pub session: SessionConfig,
    pub event_channel_capacity: usize,
    /// Wall-clock tick cadence; 0 leaves ticks to the event feed.
    pub tick_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let d = StrategyConfig::default();
        let strategy = StrategyConfig {
            target_delta: parse_env("TARGET_DELTA", d.target_delta)?,
            target_delta_lower: parse_env("TARGET_DELTA_LOWER", d.target_delta_lower)?,
            target_delta_upper: parse_env("TARGET_DELTA_UPPER", d.target_delta_upper)?,
            move_decay_threshold: parse_env("MOVE_DECAY_THRESHOLD", d.move_decay_threshold)?,
            profit_target_pct: parse_env("PROFIT_TARGET_PCT", d.profit_target_pct)?,
            signal_duration_secs: parse_env("SIGNAL_DURATION_SECS", d.signal_duration_secs)?,
            decay_basis: env_var_or("DECAY_BASIS", "delta")
                .parse::<DecayBasis>()
                .map_err(|e| EngineError::Config(format!("DECAY_BASIS: {e}")))?,
            quote_max_age_secs: parse_env("QUOTE_MAX_AGE_SECS", d.quote_max_age_secs)?,
            auto_trade: parse_env("AUTO_TRADE", d.auto_trade)?,
            auto_move: parse_env("AUTO_MOVE", d.auto_move)?,
            auto_exit: parse_env("AUTO_EXIT", d.auto_exit)?,
            risk_free_rate: parse_env("RISK_FREE_RATE", d.risk_free_rate)?,
            dividend_yield: parse_env("DIVIDEND_YIELD", d.dividend_yield)?,
            lots_per_trade: parse_env("LOT_QUANTITY", d.lots_per_trade)?,
            lot_size: parse_env("LOT_SIZE", d.lot_size)?,
            entry_dte: parse_env("ENTRY_DTE", d.entry_dte)?,
            entry_dte_tolerance: parse_env("ENTRY_DTE_TOLERANCE", d.entry_dte_tolerance)?,
            exit_dte: parse_env("EXIT_DTE", d.exit_dte)?,
            total_capital: parse_env("TOTAL_CAPITAL", d.total_capital)?,
            capital_parts: parse_env("CAPITAL_PARTS", d.capital_parts)?,
            max_entries_per_day: parse_env("MAX_ENTRIES_PER_DAY", d.max_entries_per_day)?,
            slippage_pct: parse_env("SLIPPAGE_PCT", d.slippage_pct)?,
        };
        strategy.validate()?;

        let offset_minutes: i32 = parse_env("UTC_OFFSET_MINUTES", 330)?;
        let session = SessionConfig {
            utc_offset: FixedOffset::east_opt(offset_minutes * 60)
                .ok_or_else(|| EngineError::Config(format!("UTC_OFFSET_MINUTES out of range: {offset_minutes}")))?,
            market: env_var_or("MARKET_HOURS", "09:15-15:30").parse()?,
            morning: env_var_or("MORNING_WINDOW", "09:30-13:15").parse()?,
            afternoon: env_var_or("AFTERNOON_WINDOW", "13:15-15:15").parse()?,
            max_trades_per_window: parse_env("MAX_TRADES_PER_WINDOW", 1)?,
        };

        Ok(Self {
            strategy,
            session,
            event_channel_capacity: parse_env("EVENT_CHANNEL_CAPACITY", 512)?,
            tick_interval_secs: parse_env("TICK_INTERVAL_SECS", 0)?,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> EngineResult<T>
where
    T: std::str::FromStr + ToString,
    T::Err: std::fmt::Display,
{
    env_var_or(key, &default.to_string())
        .trim()
        .parse::<T>()
        .map_err(|e| EngineError::Config(format!("{key}: {e}")))
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_hhmm(s: &str) -> EngineResult<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| EngineError::Config(format!("bad time '{s}': {e}")))
}

fn ist() -> FixedOffset {
    FixedOffset::east_opt(19_800).unwrap_or_else(|| Utc.fix())
}

fn span(h1: u32, m1: u32, h2: u32, m2: u32) -> WindowSpan {
    WindowSpan {
        start: NaiveTime::from_hms_opt(h1, m1, 0).unwrap_or(NaiveTime::MIN),
        end: NaiveTime::from_hms_opt(h2, m2, 0).unwrap_or(NaiveTime::MIN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(StrategyConfig::default().validate().is_ok());
        assert_eq!(StrategyConfig::default().entry_quantity(), 65);
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let cfg = StrategyConfig {
            move_decay_threshold: 1.5,
            ..StrategyConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_band_must_contain_target() {
        let cfg = StrategyConfig {
            target_delta: 0.10,
            ..StrategyConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_entry_quantity_overflow_rejected() {
        let cfg = StrategyConfig {
            lots_per_trade: u32::MAX,
            lot_size: 65,
            ..StrategyConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));

        let cfg = StrategyConfig {
            entry_dte_tolerance: -1,
            ..StrategyConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_window_span_parse() {
        let w: WindowSpan = "09:30-13:15".parse().unwrap();
        assert!(w.contains(NaiveTime::from_hms_opt(9, 30, 0).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(13, 15, 0).unwrap()));
        assert!("13:15-09:30".parse::<WindowSpan>().is_err());
        assert!("0930".parse::<WindowSpan>().is_err());
    }

    #[test]
    fn test_session_defaults() {
        let s = SessionConfig::default();
        assert_eq!(s.utc_offset.local_minus_utc(), 19_800);
        assert_eq!(s.morning.end, s.afternoon.start);
    }
}

pub mod black_scholes;
pub mod implied_vol;
pub mod strike_selector;

use crate::config::SessionConfig;
use crate::state::OptionType;
use chrono::{DateTime, NaiveDate, Utc};

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// All pricing models implement this trait.
/// price() must be a pure function: deterministic output from inputs only.
/// Send + Sync required for use across tokio tasks.
pub trait OptionPricer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Premium and signed delta (positive for calls, negative for puts). Never panics.
    fn price(&self, params: &ModelParams, option_type: OptionType) -> Priced;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Priced {
    pub premium: f64,
    pub delta: f64,
}

// ── Precomputed model parameters (stack, no alloc) ──

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ModelParams {
    pub spot: f64,
    pub strike: f64,
    pub tte_years: f64,
    pub sigma: f64,
    pub rate: f64,
    pub dividend: f64,
    // Precomputed
    pub sqrt_t: f64,
    pub sigma_sqrt_t: f64,
    pub disc_r: f64,
    pub disc_q: f64,
    pub d1: f64,
    pub d2: f64,
}

impl ModelParams {
    #[inline]
    pub fn new(spot: f64, strike: f64, tte_years: f64, sigma: f64, rate: f64, dividend: f64) -> Self {
        let t = tte_years.max(0.0);
        let sqrt_t = t.sqrt();
        let sigma_sqrt_t = sigma * sqrt_t;
        let disc_r = (-rate * t).exp();
        let disc_q = (-dividend * t).exp();

        let (d1, d2) = if spot > 0.0 && strike > 0.0 && sigma_sqrt_t > 1e-12 {
            let d1 = ((spot / strike).ln() + (rate - dividend + 0.5 * sigma * sigma) * t) / sigma_sqrt_t;
            (d1, d1 - sigma_sqrt_t)
        } else {
            (0.0, 0.0)
        };

        Self {
            spot,
            strike,
            tte_years: t,
            sigma,
            rate,
            dividend,
            sqrt_t,
            sigma_sqrt_t,
            disc_r,
            disc_q,
            d1,
            d2,
        }
    }

    /// No time or no volatility left: the option is worth its discounted intrinsic value.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.spot <= 0.0 || self.strike <= 0.0 || self.sigma_sqrt_t <= 1e-12
    }
}

/// Year fraction from `now` to the close of trading on `expiry`, floored at zero.
pub fn years_to_expiry(now: DateTime<Utc>, expiry: NaiveDate, session: &SessionConfig) -> f64 {
    let close = expiry
        .and_time(session.market.end)
        .and_local_timezone(session.utc_offset)
        .single();

    match close {
        Some(close) => ((close.with_timezone(&Utc) - now).num_seconds() as f64 / SECONDS_PER_YEAR).max(0.0),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_years_to_expiry_counts_to_session_close() {
        let session = SessionConfig::default();
        // 2026-01-06 15:30 IST == 10:00 UTC; one day earlier at 10:00 UTC
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let expiry = NaiveDate::from_ymd_opt(2026, 1, 6).unwrap();
        let t = years_to_expiry(now, expiry, &session);
        assert!((t - 1.0 / 365.0).abs() < 1e-9, "t={t}");
    }

    #[test]
    fn test_years_to_expiry_floors_after_close() {
        let session = SessionConfig::default();
        let now = Utc.with_ymd_and_hms(2026, 1, 7, 0, 0, 0).unwrap();
        let expiry = NaiveDate::from_ymd_opt(2026, 1, 6).unwrap();
        assert_eq!(years_to_expiry(now, expiry, &session), 0.0);
    }

    #[test]
    fn test_degenerate_params() {
        assert!(ModelParams::new(100.0, 100.0, 0.0, 0.2, 0.0, 0.0).is_degenerate());
        assert!(ModelParams::new(100.0, 100.0, 0.5, 0.0, 0.0, 0.0).is_degenerate());
        assert!(!ModelParams::new(100.0, 100.0, 0.5, 0.2, 0.0, 0.0).is_degenerate());
    }
}

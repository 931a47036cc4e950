use crate::errors::{EngineError, EngineResult};
use crate::models::black_scholes::BlackScholes;
use crate::models::implied_vol::{implied_vol, IvInputs};
use crate::models::{ModelParams, OptionPricer};
use crate::state::{OptionQuote, OptionType};
use serde::Serialize;

/// Deltas closer than this are a tie.
const DELTA_TIE_EPS: f64 = 1e-12;

/// One strike of a single-expiry, single-type chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainPoint {
    pub strike: f64,
    /// Strike-specific volatility (decimal)
    pub vol: f64,
    /// Last traded premium; zero when the feed had none
    pub premium: f64,
}

/// Everything besides the strike that the delta of a chain point depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainContext {
    pub underlying: f64,
    pub tte_years: f64,
    pub rate: f64,
    pub dividend: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrikeSelection {
    pub strike: f64,
    /// Signed model delta
    pub delta: f64,
    /// Chain premium when quoted, model premium otherwise
    pub premium: f64,
    pub vol: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrangleSelection {
    pub underlying: f64,
    pub call: StrikeSelection,
    pub put: StrikeSelection,
    pub width: f64,
    pub total_premium: f64,
    pub call_in_band: bool,
    pub put_in_band: bool,
}

/// Synthetic futures = ATM strike + ATM call - ATM put.
/// Carries cost of carry and dividends, so deltas priced off it use r = q = 0.
#[inline]
pub fn synthetic_futures(atm_strike: f64, atm_call: f64, atm_put: f64) -> f64 {
    atm_strike + atm_call - atm_put
}

/// Underlying to price deltas against: synthetic futures from the quoted strike
/// nearest spot that has both a call and a put, else spot itself.
pub fn underlying_from_quotes(spot: f64, quotes: &[OptionQuote]) -> f64 {
    let atm = quotes
        .iter()
        .filter(|q| q.option_type == OptionType::Call && q.premium > 0.0)
        .filter_map(|call| {
            quotes
                .iter()
                .find(|p| {
                    p.option_type == OptionType::Put
                        && p.premium > 0.0
                        && (p.strike - call.strike).abs() < 1e-9
                })
                .map(|put| (call.strike, call.premium, put.premium))
        })
        .min_by(|a, b| (a.0 - spot).abs().total_cmp(&(b.0 - spot).abs()));

    match atm {
        Some((strike, c, p)) => synthetic_futures(strike, c, p),
        None => spot,
    }
}

/// Build a sorted chain of one option type. Quotes without a usable implied vol
/// get one backed out of their premium; those that cannot be solved are dropped.
pub fn chain_points(
    bs: &BlackScholes,
    ctx: &ChainContext,
    quotes: &[OptionQuote],
    option_type: OptionType,
) -> Vec<ChainPoint> {
    let mut points: Vec<ChainPoint> = quotes
        .iter()
        .filter(|q| q.option_type == option_type)
        .filter_map(|q| {
            if q.implied_vol > 0.0 {
                return Some(ChainPoint {
                    strike: q.strike,
                    vol: q.implied_vol,
                    premium: q.premium,
                });
            }
            let solved = implied_vol(
                bs,
                &IvInputs {
                    market_price: q.premium,
                    spot: ctx.underlying,
                    strike: q.strike,
                    tte_years: ctx.tte_years,
                    rate: ctx.rate,
                    dividend: ctx.dividend,
                    option_type,
                },
            );
            match solved {
                Ok(vol) => Some(ChainPoint {
                    strike: q.strike,
                    vol,
                    premium: q.premium,
                }),
                Err(e) => {
                    tracing::debug!(strike = q.strike, %option_type, error = %e, "dropping unpriceable strike");
                    None
                }
            }
        })
        .collect();

    points.sort_by(|a, b| a.strike.total_cmp(&b.strike));
    points
}

/// Pick the strike whose |delta| is closest to `target_delta`.
///
/// Ties go to the strike farther from the underlying. Fails with
/// `NoStrikeInRange` when the target lies outside the chain's |delta| span.
/// Pure: identical inputs always select the identical strike.
pub fn find_strike_for_delta(
    model: &dyn OptionPricer,
    ctx: &ChainContext,
    chain: &[ChainPoint],
    target_delta: f64,
    option_type: OptionType,
) -> EngineResult<StrikeSelection> {
    let mut min_abs = f64::INFINITY;
    let mut max_abs = f64::NEG_INFINITY;
    let mut best: Option<(f64, StrikeSelection)> = None;

    for point in chain {
        let params = ModelParams::new(ctx.underlying, point.strike, ctx.tte_years, point.vol, ctx.rate, ctx.dividend);
        let priced = model.price(&params, option_type);
        let abs_delta = priced.delta.abs();
        min_abs = min_abs.min(abs_delta);
        max_abs = max_abs.max(abs_delta);

        let candidate = StrikeSelection {
            strike: point.strike,
            delta: priced.delta,
            premium: if point.premium > 0.0 { point.premium } else { priced.premium },
            vol: point.vol,
        };
        let diff = (abs_delta - target_delta).abs();

        best = match best {
            None => Some((diff, candidate)),
            Some((best_diff, current)) => {
                let farther = (candidate.strike - ctx.underlying).abs() > (current.strike - ctx.underlying).abs();
                if diff < best_diff - DELTA_TIE_EPS || ((diff - best_diff).abs() <= DELTA_TIE_EPS && farther) {
                    Some((diff, candidate))
                } else {
                    Some((best_diff, current))
                }
            }
        };
    }

    let out_of_range = EngineError::NoStrikeInRange {
        target: target_delta,
        min: if min_abs.is_finite() { min_abs } else { 0.0 },
        max: if max_abs.is_finite() { max_abs } else { 0.0 },
    };

    match best {
        Some(_) if min_abs > target_delta + DELTA_TIE_EPS || max_abs < target_delta - DELTA_TIE_EPS => Err(out_of_range),
        Some((_, selection)) => Ok(selection),
        None => Err(out_of_range),
    }
}

/// Select an out-of-the-money call and put near `target_delta`.
pub fn select_strangle(
    model: &dyn OptionPricer,
    ctx: &ChainContext,
    calls: &[ChainPoint],
    puts: &[ChainPoint],
    target_delta: f64,
    band: (f64, f64),
) -> EngineResult<StrangleSelection> {
    let otm_calls: Vec<ChainPoint> = calls.iter().copied().filter(|p| p.strike > ctx.underlying).collect();
    let otm_puts: Vec<ChainPoint> = puts.iter().copied().filter(|p| p.strike < ctx.underlying).collect();

    let call = find_strike_for_delta(model, ctx, &otm_calls, target_delta, OptionType::Call)?;
    let put = find_strike_for_delta(model, ctx, &otm_puts, target_delta, OptionType::Put)?;

    let in_band = |d: f64| band.0 <= d.abs() && d.abs() <= band.1;

    Ok(StrangleSelection {
        underlying: ctx.underlying,
        call,
        put,
        width: call.strike - put.strike,
        total_premium: call.premium + put.premium,
        call_in_band: in_band(call.delta),
        put_in_band: in_band(put.delta),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use proptest::prelude::*;

    fn ctx() -> ChainContext {
        ChainContext {
            underlying: 24_000.0,
            tte_years: 14.0 / 365.0,
            rate: 0.0,
            dividend: 0.0,
        }
    }

    fn flat_chain(lo: f64, hi: f64, step: f64, vol: f64) -> Vec<ChainPoint> {
        let mut out = Vec::new();
        let mut k = lo;
        while k <= hi {
            out.push(ChainPoint { strike: k, vol, premium: 0.0 });
            k += step;
        }
        out
    }

    #[test]
    fn test_selects_call_near_target() {
        let bs = BlackScholes::new();
        let chain = flat_chain(24_000.0, 26_000.0, 50.0, 0.13);
        let sel = find_strike_for_delta(&bs, &ctx(), &chain, 0.07, OptionType::Call).unwrap();
        assert!(sel.strike > 24_000.0);
        assert!((sel.delta - 0.07).abs() < 0.02, "delta={}", sel.delta);
        // neighbours must not be closer
        for p in &chain {
            let d = bs.price(&ModelParams::new(24_000.0, p.strike, 14.0 / 365.0, 0.13, 0.0, 0.0), OptionType::Call).delta;
            assert!((d - 0.07).abs() >= (sel.delta - 0.07).abs() - 1e-12);
        }
    }

    #[test]
    fn test_put_delta_is_negative() {
        let bs = BlackScholes::new();
        let chain = flat_chain(22_000.0, 24_000.0, 50.0, 0.15);
        let sel = find_strike_for_delta(&bs, &ctx(), &chain, 0.07, OptionType::Put).unwrap();
        assert!(sel.delta < 0.0);
        assert!(sel.strike < 24_000.0);
    }

    #[test]
    fn test_all_strikes_too_close() {
        let bs = BlackScholes::new();
        let chain = flat_chain(24_000.0, 24_200.0, 50.0, 0.13);
        let err = find_strike_for_delta(&bs, &ctx(), &chain, 0.07, OptionType::Call).unwrap_err();
        assert!(matches!(err, EngineError::NoStrikeInRange { .. }), "{err}");
    }

    #[test]
    fn test_all_strikes_too_far() {
        let bs = BlackScholes::new();
        let chain = flat_chain(27_000.0, 28_000.0, 50.0, 0.13);
        assert!(matches!(
            find_strike_for_delta(&bs, &ctx(), &chain, 0.07, OptionType::Call),
            Err(EngineError::NoStrikeInRange { .. })
        ));
    }

    #[test]
    fn test_empty_chain() {
        let bs = BlackScholes::new();
        assert!(find_strike_for_delta(&bs, &ctx(), &[], 0.07, OptionType::Call).is_err());
    }

    #[test]
    fn test_tie_prefers_farther_strike() {
        // A pricer whose delta is symmetric around 24100 forces an exact tie
        struct Tent;
        impl OptionPricer for Tent {
            fn name(&self) -> &'static str {
                "tent"
            }
            fn price(&self, p: &ModelParams, _t: OptionType) -> crate::models::Priced {
                crate::models::Priced {
                    premium: 1.0,
                    delta: 0.07 + (p.strike - 24_100.0).abs() / 10_000.0,
                }
            }
        }
        let chain = vec![
            ChainPoint { strike: 24_000.0, vol: 0.1, premium: 0.0 },
            ChainPoint { strike: 24_200.0, vol: 0.1, premium: 0.0 },
            ChainPoint { strike: 24_400.0, vol: 0.1, premium: 0.0 },
        ];
        let mut c = ctx();
        c.underlying = 23_900.0;
        let sel = find_strike_for_delta(&Tent, &c, &chain, 0.06, OptionType::Call);
        // min |delta| (0.08) exceeds target, so that one fails...
        assert!(sel.is_err());
        let sel = find_strike_for_delta(&Tent, &c, &chain, 0.08, OptionType::Call).unwrap();
        // ...and 24000/24200 tie at 0.08; 24200 is farther from 23900
        assert_eq!(sel.strike, 24_200.0);
    }

    #[test]
    fn test_synthetic_futures_from_quotes() {
        let t = Utc.with_ymd_and_hms(2026, 1, 5, 5, 0, 0).unwrap();
        let e = NaiveDate::from_ymd_opt(2026, 1, 20).unwrap();
        let q = |strike: f64, option_type, premium| OptionQuote {
            strike,
            option_type,
            premium,
            implied_vol: 0.0,
            delta: 0.0,
            expiry: e,
            quoted_at: t,
        };
        let quotes = vec![
            q(24_000.0, OptionType::Call, 210.0),
            q(24_000.0, OptionType::Put, 160.0),
            q(24_500.0, OptionType::Call, 40.0),
        ];
        assert_eq!(underlying_from_quotes(24_020.0, &quotes), 24_050.0);
        assert_eq!(underlying_from_quotes(24_020.0, &quotes[2..]), 24_020.0);
    }

    #[test]
    fn test_strangle_brackets_underlying() {
        let bs = BlackScholes::new();
        let calls = flat_chain(22_000.0, 26_000.0, 50.0, 0.13);
        let puts = flat_chain(22_000.0, 26_000.0, 50.0, 0.16);
        let s = select_strangle(&bs, &ctx(), &calls, &puts, 0.07, (0.06, 0.08)).unwrap();
        assert!(s.put.strike < 24_000.0 && s.call.strike > 24_000.0);
        assert!((s.width - (s.call.strike - s.put.strike)).abs() < 1e-9);
        assert!(s.call_in_band && s.put_in_band, "{s:?}");
        assert!(s.total_premium > 0.0);
    }

    proptest! {
        #[test]
        fn selection_is_idempotent(vol in 0.08f64..0.4, target in 0.03f64..0.15) {
            let bs = BlackScholes::new();
            let chain = flat_chain(24_050.0, 30_000.0, 50.0, vol);
            let a = find_strike_for_delta(&bs, &ctx(), &chain, target, OptionType::Call);
            let b = find_strike_for_delta(&bs, &ctx(), &chain, target, OptionType::Call);
            prop_assert_eq!(a, b);
        }
    }
}

/// Implied volatility solver.
///
/// Newton-Raphson from a 20% seed converges in a handful of iterations for
/// near-the-money strikes. Far wings have tiny vega, so the solver falls back
/// to bisection over [MIN_VOL, MAX_VOL], which always converges when a root
/// is bracketed.
use crate::errors::{EngineError, EngineResult};
use crate::models::black_scholes::BlackScholes;
use crate::models::{ModelParams, OptionPricer};
use crate::state::OptionType;

const INITIAL_GUESS: f64 = 0.20;
const MIN_VOL: f64 = 0.0001;
const MAX_VOL: f64 = 5.0;
const PRICE_TOLERANCE: f64 = 1e-6;
const VOL_TOLERANCE: f64 = 1e-7;
const MAX_NEWTON_ITERATIONS: u32 = 50;
const MAX_BISECTION_ITERATIONS: u32 = 200;

#[derive(Debug, Clone, Copy)]
pub struct IvInputs {
    pub market_price: f64,
    pub spot: f64,
    pub strike: f64,
    pub tte_years: f64,
    pub rate: f64,
    pub dividend: f64,
    pub option_type: OptionType,
}

impl IvInputs {
    #[inline]
    fn params(&self, sigma: f64) -> ModelParams {
        ModelParams::new(self.spot, self.strike, self.tte_years, sigma, self.rate, self.dividend)
    }
}

/// Back out the volatility that reprices `market_price`.
pub fn implied_vol(bs: &BlackScholes, inputs: &IvInputs) -> EngineResult<f64> {
    if inputs.market_price <= 0.0 || inputs.tte_years <= 0.0 {
        return Err(EngineError::Model(format!(
            "no IV for price {} with {} years to expiry",
            inputs.market_price, inputs.tte_years
        )));
    }

    let intrinsic = bs.price(&inputs.params(0.0), inputs.option_type).premium;
    if inputs.market_price < intrinsic - PRICE_TOLERANCE {
        return Err(EngineError::Model(format!(
            "price {} below intrinsic {intrinsic}",
            inputs.market_price
        )));
    }

    if let Some(sigma) = newton(bs, inputs) {
        return Ok(sigma);
    }

    tracing::debug!(strike = inputs.strike, "newton stalled, bisecting");
    bisect(bs, inputs)
}

fn newton(bs: &BlackScholes, inputs: &IvInputs) -> Option<f64> {
    let mut sigma = INITIAL_GUESS;

    for _ in 0..MAX_NEWTON_ITERATIONS {
        let params = inputs.params(sigma);
        let diff = bs.price(&params, inputs.option_type).premium - inputs.market_price;
        if diff.abs() < PRICE_TOLERANCE {
            return Some(sigma);
        }

        let vega = bs.raw_vega(&params);
        if vega < 1e-10 {
            return None;
        }

        let next = (sigma - diff / vega).clamp(MIN_VOL, MAX_VOL);
        if (next - sigma).abs() < VOL_TOLERANCE {
            return Some(next);
        }
        sigma = next;
    }

    None
}

fn bisect(bs: &BlackScholes, inputs: &IvInputs) -> EngineResult<f64> {
    let objective = |sigma: f64| bs.price(&inputs.params(sigma), inputs.option_type).premium - inputs.market_price;

    let mut lo = MIN_VOL;
    let mut hi = MAX_VOL;
    let f_lo = objective(lo);
    let f_hi = objective(hi);

    if f_lo.signum() == f_hi.signum() && f_lo.abs() > PRICE_TOLERANCE && f_hi.abs() > PRICE_TOLERANCE {
        return Err(EngineError::Model(format!(
            "IV not bracketed for strike {}: f({MIN_VOL})={f_lo:.6}, f({MAX_VOL})={f_hi:.6}",
            inputs.strike
        )));
    }

    let mut f_lo = f_lo;
    for _ in 0..MAX_BISECTION_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        let f_mid = objective(mid);
        if f_mid.abs() < PRICE_TOLERANCE || (hi - lo) < VOL_TOLERANCE {
            return Ok(mid);
        }
        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }

    Ok(0.5 * (lo + hi))
}

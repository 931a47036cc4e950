use crate::models::{ModelParams, OptionPricer, Priced};
use crate::state::OptionType;
use serde::Serialize;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

/// Black-Scholes-Merton pricing for European options with continuous dividend yield.
///
/// call = S e^{-qT} N(d1) - K e^{-rT} N(d2)
/// put  = K e^{-rT} N(-d2) - S e^{-qT} N(-d1)
///
/// where d1 = (ln(S/K) + (r - q + sigma^2/2) T) / (sigma sqrt(T)), d2 = d1 - sigma sqrt(T).
///
/// Run with r = q = 0 against a synthetic futures underlying to match how the
/// exchange's market makers quote delta.
#[derive(Debug, Clone, Copy)]
pub struct BlackScholes {
    /// Standard normal distribution (created once, reused)
    normal: Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Greeks {
    pub price: f64,
    pub delta: f64,
    pub gamma: f64,
    /// Per calendar day
    pub theta: f64,
    /// Per one volatility point (1%)
    pub vega: f64,
}

impl BlackScholes {
    pub fn new() -> Self {
        Self {
            normal: Normal::standard(),
        }
    }

    /// Price, delta and the second-order Greeks in one pass.
    pub fn greeks(&self, params: &ModelParams, option_type: OptionType) -> Greeks {
        let Priced { premium, delta } = self.price(params, option_type);

        if params.is_degenerate() {
            return Greeks {
                price: premium,
                delta,
                gamma: 0.0,
                theta: 0.0,
                vega: 0.0,
            };
        }

        let pdf_d1 = self.normal.pdf(params.d1);
        let s = params.spot;
        let k = params.strike;

        let gamma = params.disc_q * pdf_d1 / (s * params.sigma_sqrt_t);

        let decay_term = -(s * params.sigma * params.disc_q * pdf_d1) / (2.0 * params.sqrt_t);
        let theta_annual = match option_type {
            OptionType::Call => {
                decay_term + params.dividend * s * params.disc_q * self.normal.cdf(params.d1)
                    - params.rate * k * params.disc_r * self.normal.cdf(params.d2)
            }
            OptionType::Put => {
                decay_term - params.dividend * s * params.disc_q * self.normal.cdf(-params.d1)
                    + params.rate * k * params.disc_r * self.normal.cdf(-params.d2)
            }
        };

        let vega = s * params.disc_q * params.sqrt_t * pdf_d1 / 100.0;

        Greeks {
            price: premium,
            delta,
            gamma,
            theta: theta_annual / 365.0,
            vega,
        }
    }

    /// Vega per unit of volatility (not per point). Used by the IV solver.
    #[inline]
    pub(crate) fn raw_vega(&self, params: &ModelParams) -> f64 {
        if params.is_degenerate() {
            return 0.0;
        }
        params.spot * params.disc_q * params.sqrt_t * self.normal.pdf(params.d1)
    }
}

impl Default for BlackScholes {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionPricer for BlackScholes {
    #[inline]
    fn name(&self) -> &'static str {
        "Black-Scholes"
    }

    #[inline]
    fn price(&self, params: &ModelParams, option_type: OptionType) -> Priced {
        let fwd_s = params.spot * params.disc_q;
        let fwd_k = params.strike * params.disc_r;

        // Guard: no time value left, collapse to discounted intrinsic
        if params.is_degenerate() {
            let diff = option_type.sign() * (fwd_s - fwd_k);
            let delta = if diff > 0.0 {
                option_type.sign() * params.disc_q
            } else if diff < 0.0 {
                0.0
            } else {
                option_type.sign() * 0.5 * params.disc_q
            };
            return Priced {
                premium: diff.max(0.0),
                delta,
            };
        }

        let (premium, delta) = match option_type {
            OptionType::Call => {
                let nd1 = self.normal.cdf(params.d1);
                (fwd_s * nd1 - fwd_k * self.normal.cdf(params.d2), params.disc_q * nd1)
            }
            OptionType::Put => (
                fwd_k * self.normal.cdf(-params.d2) - fwd_s * self.normal.cdf(-params.d1),
                params.disc_q * (self.normal.cdf(params.d1) - 1.0),
            ),
        };

        Priced {
            premium: premium.max(0.0),
            delta: delta.clamp(-1.0, 1.0),
        }
    }
}

/// Premium and signed delta for a single contract.
pub fn price(spot: f64, strike: f64, tte_years: f64, vol: f64, rate: f64, option_type: OptionType) -> (f64, f64) {
    let params = ModelParams::new(spot, strike, tte_years, vol, rate, 0.0);
    let p = BlackScholes::new().price(&params, option_type);
    (p.premium, p.delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reference_call() {
        // Hull: S=100 K=100 T=1 sigma=20% r=5% -> C = 10.4506, delta = 0.6368
        let (c, d) = price(100.0, 100.0, 1.0, 0.2, 0.05, OptionType::Call);
        assert!((c - 10.4506).abs() < 1e-3, "call={c}");
        assert!((d - 0.6368).abs() < 1e-3, "delta={d}");
    }

    #[test]
    fn test_reference_put() {
        let (p, d) = price(100.0, 100.0, 1.0, 0.2, 0.05, OptionType::Put);
        assert!((p - 5.5735).abs() < 1e-3, "put={p}");
        assert!((d + 0.3632).abs() < 1e-3, "delta={d}");
    }

    #[test]
    fn test_put_call_parity() {
        let bs = BlackScholes::new();
        let params = ModelParams::new(24_150.0, 24_500.0, 14.0 / 365.0, 0.13, 0.065, 0.01);
        let c = bs.price(&params, OptionType::Call).premium;
        let p = bs.price(&params, OptionType::Put).premium;
        let parity = params.spot * params.disc_q - params.strike * params.disc_r;
        assert!((c - p - parity).abs() < 1e-6, "c-p={} parity={parity}", c - p);
    }

    #[test]
    fn test_expired_collapses_to_intrinsic() {
        let (c, dc) = price(105.0, 100.0, 0.0, 0.2, 0.0, OptionType::Call);
        let (p, dp) = price(105.0, 100.0, 0.0, 0.2, 0.0, OptionType::Put);
        assert_eq!((c, dc), (5.0, 1.0));
        assert_eq!((p, dp), (0.0, 0.0));
    }

    #[test]
    fn test_greeks_signs() {
        let bs = BlackScholes::new();
        let params = ModelParams::new(24_000.0, 24_800.0, 14.0 / 365.0, 0.14, 0.0, 0.0);
        let g = bs.greeks(&params, OptionType::Call);
        assert!(g.gamma > 0.0);
        assert!(g.theta < 0.0, "short-dated OTM call should bleed: {}", g.theta);
        assert!(g.vega > 0.0);
        let gp = bs.greeks(&params, OptionType::Put);
        assert!((g.gamma - gp.gamma).abs() < 1e-12);
        assert!((g.vega - gp.vega).abs() < 1e-12);
    }

    #[test]
    fn test_far_otm_delta_small() {
        let (_, d) = price(24_000.0, 25_500.0, 14.0 / 365.0, 0.13, 0.0, OptionType::Call);
        assert!(d > 0.0 && d < 0.05, "far OTM call delta={d}");
    }

    proptest! {
        #[test]
        fn delta_within_unit_interval(
            spot in 1_000.0f64..50_000.0,
            moneyness in 0.5f64..1.5,
            tte in 0.0f64..2.0,
            vol in 0.01f64..1.5,
            rate in 0.0f64..0.1,
        ) {
            let strike = spot * moneyness;
            let (premium, dc) = price(spot, strike, tte, vol, rate, OptionType::Call);
            let (_, dp) = price(spot, strike, tte, vol, rate, OptionType::Put);
            prop_assert!(premium >= 0.0);
            prop_assert!((0.0..=1.0).contains(&dc));
            prop_assert!((-1.0..=0.0).contains(&dp));
        }

        #[test]
        fn delta_falls_away_from_the_money(
            spot in 10_000.0f64..30_000.0,
            tte in 0.005f64..0.5,
            vol in 0.05f64..0.6,
        ) {
            // ATM-centred chain: |delta| shrinks as strikes move out on either side
            let step = spot * 0.01;
            let mut prev_call = f64::INFINITY;
            let mut prev_put = f64::INFINITY;
            for i in 0..20 {
                let (_, dc) = price(spot, spot + step * i as f64, tte, vol, 0.0, OptionType::Call);
                let (_, dp) = price(spot, spot - step * i as f64, tte, vol, 0.0, OptionType::Put);
                prop_assert!(dc.abs() <= prev_call + 1e-12);
                prop_assert!(dp.abs() <= prev_put + 1e-12);
                prev_call = dc.abs();
                prev_put = dp.abs();
            }
        }
    }
}

use crate::state::{Side, TradeIntent};
use chrono::{DateTime, Utc};
use smallvec::SmallVec;

/// Outcome of placing one intent. Fill prices line up with `intent.legs`.
#[derive(Debug, Clone, PartialEq)]
pub enum FillResult {
    Filled {
        prices: SmallVec<[f64; 2]>,
        filled_at: DateTime<Utc>,
    },
    Rejected {
        reason: String,
    },
}

/// Where intents go once they are cleared for execution.
/// Broker adapters implement this; the engine only ever sees fills.
pub trait ExecutionVenue: Send {
    fn name(&self) -> &'static str;

    fn place(&mut self, intent: &TradeIntent, at: DateTime<Utc>) -> FillResult;
}

/// Fills every leg immediately at its reference premium moved against us by
/// a fixed slippage: sells fill lower, buys fill higher.
#[derive(Debug, Clone)]
pub struct PaperVenue {
    slippage_pct: f64,
    orders_placed: u64,
}

impl PaperVenue {
    pub fn new(slippage_pct: f64) -> Self {
        Self {
            slippage_pct: slippage_pct.max(0.0),
            orders_placed: 0,
        }
    }

    #[inline]
    pub fn orders_placed(&self) -> u64 {
        self.orders_placed
    }

    #[inline]
    fn fill_price(&self, reference: f64, side: Side) -> f64 {
        match side {
            Side::Sell => reference * (1.0 - self.slippage_pct),
            Side::Buy => reference * (1.0 + self.slippage_pct),
        }
    }
}

impl ExecutionVenue for PaperVenue {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn place(&mut self, intent: &TradeIntent, at: DateTime<Utc>) -> FillResult {
        if intent.legs.is_empty() {
            return FillResult::Rejected {
                reason: "intent has no legs".into(),
            };
        }
        if let Some(bad) = intent.legs.iter().find(|l| !(l.reference_premium.is_finite() && l.reference_premium > 0.0)) {
            return FillResult::Rejected {
                reason: format!("no tradable premium for {} {}", bad.option_type, bad.strike),
            };
        }

        self.orders_placed += 1;
        let prices: SmallVec<[f64; 2]> = intent
            .legs
            .iter()
            .map(|l| self.fill_price(l.reference_premium, l.side))
            .collect();

        tracing::info!(
            venue = self.name(),
            kind = %intent.kind,
            expiry = %intent.expiry,
            prices = ?prices.as_slice(),
            "paper fill"
        );

        FillResult::Filled { prices, filled_at: at }
    }
}

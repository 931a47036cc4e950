use crate::errors::{EngineError, EngineResult};
use crate::state::{SignalState, SignalStatus, StraddleSample};
use chrono::{DateTime, Utc};

/// Entry confirmation: straddle premium must sit above its VWAP continuously
/// for `confirmation_secs` before the tracker reports Ready.
///
///   Idle ──elevated──▶ Confirming ──held ≥ duration──▶ Ready ──consume──▶ Consumed
///     ▲                    │                             │                   │
///     └────── not elevated ┴──────────── not elevated ───┴── not elevated ───┘
///
/// A consumed signal only re-arms after the condition breaks, so every entry
/// needs its own full confirmation window.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalTracker {
    state: SignalState,
    confirmation_secs: i64,
    last_sample_at: Option<DateTime<Utc>>,
}

impl SignalTracker {
    pub fn new(confirmation_secs: i64) -> Self {
        Self {
            state: SignalState::default(),
            confirmation_secs: confirmation_secs.max(0),
            last_sample_at: None,
        }
    }

    #[inline]
    pub fn state(&self) -> SignalState {
        self.state
    }

    #[inline]
    pub fn last_sample_at(&self) -> Option<DateTime<Utc>> {
        self.last_sample_at
    }

    /// Feed the next sample. Out-of-order or repeated timestamps are rejected
    /// and leave the tracker untouched.
    pub fn observe(&mut self, sample: &StraddleSample) -> EngineResult<SignalState> {
        if let Some(last) = self.last_sample_at {
            if sample.timestamp <= last {
                return Err(EngineError::InvalidSampleOrder {
                    last,
                    got: sample.timestamp,
                });
            }
        }

        let now = sample.timestamp;
        let elevated = sample.premium_elevated();
        let prev = self.state.status;

        self.state = match (prev, elevated) {
            (_, false) => SignalState::default(),
            (SignalStatus::Idle, true) => self.confirm_from(now, now),
            (SignalStatus::Confirming, true) => {
                let since = self.state.confirming_since.unwrap_or(now);
                self.confirm_from(since, now)
            }
            (SignalStatus::Ready, true) | (SignalStatus::Consumed, true) => self.state,
        };
        self.last_sample_at = Some(now);

        if prev != self.state.status {
            tracing::info!(
                from = %prev,
                to = %self.state.status,
                straddle = sample.straddle_price,
                vwap = sample.vwap,
                "signal transition"
            );
        }

        Ok(self.state)
    }

    fn confirm_from(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> SignalState {
        let status = if (now - since).num_seconds() >= self.confirmation_secs {
            SignalStatus::Ready
        } else {
            SignalStatus::Confirming
        };
        SignalState {
            status,
            confirming_since: Some(since),
        }
    }

    /// An Enter intent built on this signal was acted upon.
    pub fn consume(&mut self) -> EngineResult<()> {
        if self.state.status != SignalStatus::Ready {
            return Err(EngineError::InvalidTransition(format!(
                "cannot consume signal in state {}",
                self.state.status
            )));
        }
        self.state.status = SignalStatus::Consumed;
        tracing::info!("signal consumed");
        Ok(())
    }

    /// Start a new trading session from scratch.
    pub fn reset(&mut self) {
        self.state = SignalState::default();
        self.last_sample_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 4, 30, 0).unwrap()
    }

    fn sample(secs: i64, straddle: f64, vwap: f64) -> StraddleSample {
        StraddleSample {
            timestamp: t0() + Duration::seconds(secs),
            straddle_price: straddle,
            vwap,
        }
    }

    #[test]
    fn test_confirms_after_full_duration() {
        let mut tr = SignalTracker::new(300);
        assert_eq!(tr.observe(&sample(0, 210.0, 200.0)).unwrap().status, SignalStatus::Confirming);
        assert_eq!(tr.observe(&sample(150, 210.0, 200.0)).unwrap().status, SignalStatus::Confirming);
        assert_eq!(tr.observe(&sample(299, 210.0, 200.0)).unwrap().status, SignalStatus::Confirming);
        let s = tr.observe(&sample(300, 210.0, 200.0)).unwrap();
        assert_eq!(s.status, SignalStatus::Ready);
        assert_eq!(s.confirming_since, Some(t0()));
    }

    #[test]
    fn test_break_before_duration_resets() {
        let mut tr = SignalTracker::new(300);
        tr.observe(&sample(0, 210.0, 200.0)).unwrap();
        tr.observe(&sample(299, 210.0, 200.0)).unwrap();
        let s = tr.observe(&sample(300, 195.0, 200.0)).unwrap();
        assert_eq!(s.status, SignalStatus::Idle);
        assert_eq!(s.confirming_since, None);
        // a new run starts its own window
        tr.observe(&sample(310, 210.0, 200.0)).unwrap();
        assert_eq!(tr.observe(&sample(600, 210.0, 200.0)).unwrap().status, SignalStatus::Confirming);
        assert_eq!(tr.observe(&sample(610, 210.0, 200.0)).unwrap().status, SignalStatus::Ready);
    }

    #[test]
    fn test_equal_is_not_elevated() {
        let mut tr = SignalTracker::new(300);
        assert_eq!(tr.observe(&sample(0, 200.0, 200.0)).unwrap().status, SignalStatus::Idle);
    }

    #[test]
    fn test_consumed_needs_break_to_rearm() {
        let mut tr = SignalTracker::new(60);
        tr.observe(&sample(0, 210.0, 200.0)).unwrap();
        tr.observe(&sample(60, 210.0, 200.0)).unwrap();
        tr.consume().unwrap();
        assert_eq!(tr.observe(&sample(500, 210.0, 200.0)).unwrap().status, SignalStatus::Consumed);
        assert_eq!(tr.observe(&sample(501, 190.0, 200.0)).unwrap().status, SignalStatus::Idle);
        assert_eq!(tr.observe(&sample(502, 210.0, 200.0)).unwrap().status, SignalStatus::Confirming);
    }

    #[test]
    fn test_consume_requires_ready() {
        let mut tr = SignalTracker::new(300);
        tr.observe(&sample(0, 210.0, 200.0)).unwrap();
        assert!(matches!(tr.consume(), Err(EngineError::InvalidTransition(_))));
        assert_eq!(tr.state().status, SignalStatus::Confirming);
    }

    #[test]
    fn test_out_of_order_sample_preserves_state() {
        let mut tr = SignalTracker::new(300);
        tr.observe(&sample(0, 210.0, 200.0)).unwrap();
        tr.observe(&sample(100, 210.0, 200.0)).unwrap();
        let before = tr.clone();
        let err = tr.observe(&sample(50, 190.0, 200.0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSampleOrder { .. }));
        assert_eq!(tr, before);
        assert!(tr.observe(&sample(100, 190.0, 200.0)).is_err(), "repeated timestamp");
    }

    #[test]
    fn test_zero_duration_is_immediately_ready() {
        let mut tr = SignalTracker::new(0);
        assert_eq!(tr.observe(&sample(0, 210.0, 200.0)).unwrap().status, SignalStatus::Ready);
    }
}

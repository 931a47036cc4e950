use crate::config::SessionConfig;
use crate::state::{TradingWindow, WindowState};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

/// Turns wall-clock time into the window gating the orchestrator consumes.
/// Counts entries per named window and forgets them on a new trading day.
/// The clock is always passed in; nothing here reads the system time.
#[derive(Debug, Clone)]
pub struct SessionClock {
    config: SessionConfig,
    day: Option<NaiveDate>,
    entries: HashMap<TradingWindow, u32>,
}

impl SessionClock {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            day: None,
            entries: HashMap::new(),
        }
    }

    /// Local trading date for `now`.
    #[inline]
    pub fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.config.utc_offset).date_naive()
    }

    pub fn active_window(&self, now: DateTime<Utc>) -> Option<TradingWindow> {
        let t = now.with_timezone(&self.config.utc_offset).time();
        if self.config.morning.contains(t) {
            Some(TradingWindow::Morning)
        } else if self.config.afternoon.contains(t) {
            Some(TradingWindow::Afternoon)
        } else {
            None
        }
    }

    /// Roll the day if needed. Returns true when a new session began.
    pub fn roll(&mut self, now: DateTime<Utc>) -> bool {
        let today = self.trading_day(now);
        if self.day == Some(today) {
            return false;
        }
        self.day = Some(today);
        self.entries.clear();
        tracing::info!(day = %today, "new trading session");
        true
    }

    /// Gating as of `now`. Call `roll` first so counters belong to today.
    pub fn window_state(&self, now: DateTime<Utc>) -> WindowState {
        let local = now.with_timezone(&self.config.utc_offset).time();
        let active = self.active_window(now);
        let used = active
            .map(|w| self.entries_in(w) >= self.config.max_trades_per_window)
            .unwrap_or(false);

        WindowState {
            inside_entry_window: active.is_some(),
            entry_quota_used: used,
            inside_exit_window: self.config.market.contains(local),
            active_window: active,
        }
    }

    pub fn record_entry(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        match self.active_window(now) {
            Some(w) => {
                *self.entries.entry(w).or_insert(0) += 1;
                tracing::info!(window = ?w, count = self.entries_in(w), "entry recorded");
            }
            None => tracing::warn!("entry recorded outside any trading window"),
        }
    }

    #[inline]
    pub fn entries_in(&self, window: TradingWindow) -> u32 {
        self.entries.get(&window).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // IST = UTC+5:30
    fn ist(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, h, m, 0).unwrap() - chrono::Duration::minutes(330)
    }

    #[test]
    fn test_no_entries_in_opening_minutes() {
        let clock = SessionClock::new(SessionConfig::default());
        let w = clock.window_state(ist(9, 20));
        assert!(!w.inside_entry_window);
        assert!(w.inside_exit_window);
        assert_eq!(w.active_window, None);
    }

    #[test]
    fn test_windows_split_at_boundary() {
        let clock = SessionClock::new(SessionConfig::default());
        assert_eq!(clock.active_window(ist(13, 14)), Some(TradingWindow::Morning));
        assert_eq!(clock.active_window(ist(13, 15)), Some(TradingWindow::Afternoon));
        assert_eq!(clock.active_window(ist(15, 15)), None);
        assert!(!clock.window_state(ist(15, 40)).inside_exit_window);
    }

    #[test]
    fn test_quota_per_window() {
        let mut clock = SessionClock::new(SessionConfig::default());
        clock.roll(ist(10, 0));
        clock.record_entry(ist(10, 0));
        assert!(clock.window_state(ist(11, 0)).entry_quota_used);
        assert!(!clock.window_state(ist(11, 0)).entry_permitted());
        // afternoon has its own quota
        assert!(clock.window_state(ist(14, 0)).entry_permitted());
    }

    #[test]
    fn test_new_day_resets_quota() {
        let mut clock = SessionClock::new(SessionConfig::default());
        clock.record_entry(ist(10, 0));
        let tomorrow = ist(10, 0) + chrono::Duration::days(1);
        assert!(clock.roll(tomorrow));
        assert!(clock.window_state(tomorrow).entry_permitted());
        assert!(!clock.roll(tomorrow));
    }
}

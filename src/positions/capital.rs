use crate::state::CapitalStatus;
use chrono::NaiveDate;

/// Entry gate result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapitalCheck {
    Allowed,
    Blocked(&'static str),
}

impl CapitalCheck {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, CapitalCheck::Allowed)
    }
}

/// Splits capital into equal parts. Each strangle entry takes one part and
/// holds it until its expiry has no live legs left.
#[derive(Debug, Clone, PartialEq)]
pub struct CapitalManager {
    total_capital: f64,
    /// One slot per part, tagged with the expiry that holds it.
    parts: Vec<Option<NaiveDate>>,
    max_entries_per_day: u32,
    entries_today: u32,
    day: Option<NaiveDate>,
}

impl CapitalManager {
    pub fn new(total_capital: f64, parts: usize, max_entries_per_day: u32) -> Self {
        Self {
            total_capital,
            parts: vec![None; parts],
            max_entries_per_day,
            entries_today: 0,
            day: None,
        }
    }

    /// Reset the daily entry counter when `today` is a new day.
    pub fn roll_day(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.entries_today = 0;
        }
    }

    #[inline]
    pub fn available_parts(&self) -> usize {
        self.parts.iter().filter(|p| p.is_none()).count()
    }

    #[inline]
    pub fn capital_per_part(&self) -> f64 {
        if self.parts.is_empty() {
            return 0.0;
        }
        self.total_capital / self.parts.len() as f64
    }

    /// Pure check, no side effects.
    pub fn check(&self, today: NaiveDate) -> CapitalCheck {
        let entries = if self.day == Some(today) { self.entries_today } else { 0 };
        if entries >= self.max_entries_per_day {
            return CapitalCheck::Blocked("daily entry limit reached");
        }
        if self.available_parts() == 0 {
            return CapitalCheck::Blocked("no free capital part");
        }
        CapitalCheck::Allowed
    }

    #[inline]
    pub fn can_enter(&self, today: NaiveDate) -> bool {
        self.check(today).is_allowed()
    }

    /// Take a part for a new entry on `expiry`. Returns the slot index.
    pub fn allocate(&mut self, expiry: NaiveDate, today: NaiveDate) -> Option<usize> {
        self.roll_day(today);
        let slot = self.parts.iter().position(Option::is_none)?;
        self.parts[slot] = Some(expiry);
        self.entries_today += 1;
        tracing::info!(
            slot,
            expiry = %expiry,
            free = self.available_parts(),
            entries_today = self.entries_today,
            "capital part allocated"
        );
        Some(slot)
    }

    /// Free every part held by `expiry`. Returns how many were freed.
    pub fn release(&mut self, expiry: NaiveDate) -> usize {
        let mut freed = 0;
        for p in self.parts.iter_mut().filter(|p| **p == Some(expiry)) {
            *p = None;
            freed += 1;
        }
        if freed > 0 {
            tracing::info!(expiry = %expiry, freed, free = self.available_parts(), "capital released");
        }
        freed
    }

    pub fn status(&self) -> CapitalStatus {
        CapitalStatus {
            total_capital: self.total_capital,
            capital_per_part: self.capital_per_part(),
            total_parts: self.parts.len(),
            available_parts: self.available_parts(),
            entries_today: self.entries_today,
            max_entries_per_day: self.max_entries_per_day,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
    }

    #[test]
    fn test_daily_entry_limit() {
        let mut cm = CapitalManager::new(600_000.0, 6, 2);
        assert!(cm.can_enter(d(5)));
        cm.allocate(d(20), d(5)).unwrap();
        cm.allocate(d(20), d(5)).unwrap();
        assert_eq!(cm.check(d(5)), CapitalCheck::Blocked("daily entry limit reached"));
        // next day the counter is fresh even before roll_day
        assert!(cm.can_enter(d(6)));
        cm.roll_day(d(6));
        assert_eq!(cm.status().entries_today, 0);
    }

    #[test]
    fn test_parts_exhaust_and_release() {
        let mut cm = CapitalManager::new(200_000.0, 2, 10);
        assert_eq!(cm.capital_per_part(), 100_000.0);
        cm.allocate(d(20), d(5)).unwrap();
        cm.allocate(d(27), d(5)).unwrap();
        assert!(cm.allocate(d(27), d(5)).is_none());
        assert!(!cm.can_enter(d(5)));

        assert_eq!(cm.release(d(20)), 1);
        assert_eq!(cm.release(d(20)), 0);
        let s = cm.status();
        assert_eq!(s.available_parts, 1);
        assert_eq!(s.total_parts, 2);
    }
}

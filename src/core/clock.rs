use crate::models::keys::DayKey;
use chrono::{Local, Utc};
use parking_lot::Mutex;

/// Source of "today" and "now". Injected everywhere a day boundary or a
/// timestamp matters, so rollover behavior is testable.
pub trait Clock: Send + Sync {
    fn today(&self) -> DayKey;
    fn now_ms(&self) -> i64;
}

/// Wall clock. Day keys follow the host's local date, matching how the
/// dashboards bucket traffic.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> DayKey {
        DayKey::new(Local::now().date_naive())
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Test support: a clock pinned to a settable instant.
#[derive(Debug)]
pub struct FixedClock {
    inner: Mutex<(DayKey, i64)>,
}

impl FixedClock {
    pub fn new(day: DayKey, now_ms: i64) -> Self {
        Self {
            inner: Mutex::new((day, now_ms)),
        }
    }

    pub fn set_today(&self, day: DayKey) {
        self.inner.lock().0 = day;
    }

    pub fn set_now_ms(&self, now_ms: i64) {
        self.inner.lock().1 = now_ms;
    }

    pub fn advance_ms(&self, by: i64) {
        self.inner.lock().1 += by;
    }
}

impl Clock for FixedClock {
    fn today(&self) -> DayKey {
        self.inner.lock().0
    }

    fn now_ms(&self) -> i64 {
        self.inner.lock().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_is_settable() {
        let day: DayKey = "2025-01-01".parse().unwrap();
        let clock = FixedClock::new(day, 100);
        assert_eq!(clock.today(), day);
        assert_eq!(clock.now_ms(), 100);

        let next: DayKey = "2025-01-02".parse().unwrap();
        clock.set_today(next);
        clock.advance_ms(50);
        assert_eq!(clock.today(), next);
        assert_eq!(clock.now_ms(), 150);
    }

    #[test]
    fn system_clock_day_matches_local_date() {
        let clock = SystemClock;
        assert_eq!(clock.today(), DayKey::new(Local::now().date_naive()));
    }
}

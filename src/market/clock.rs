// =============================================================================
// Session Clock — phase resolution for the trading day
// =============================================================================
//
// Pure functions of a supplied `DateTime<Utc>` plus the holiday calendar, so
// every scheduling decision is testable against a pinned wall clock. The
// engine passes `Utc::now()`; tests pass literals.
//
// Phases on a trading day (ET wall clock):
//
//   DARK      before 04:00 and from 20:00
//   PREP      [04:00, 09:30)
//   OPEN      [09:30, close)        close = 16:00, or 13:00 on half days
//   COOLDOWN  [close, 20:00)
//
// Non-trading days (weekends, bank holidays, low-volume skip days) are DARK
// all day.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::Serialize;

use super::eastern;
use super::holidays::{early_close_time, HolidayCalendar};

/// Session phase of the exchange clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionPhase {
    Dark,
    Prep,
    Open,
    Cooldown,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dark => write!(f, "DARK"),
            Self::Prep => write!(f, "PREP"),
            Self::Open => write!(f, "OPEN"),
            Self::Cooldown => write!(f, "COOLDOWN"),
        }
    }
}

/// Why a date does not trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonTradingReason {
    Weekend,
    BankHoliday(&'static str),
    LowVolume(&'static str),
}

fn rth_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).expect("valid time")
}

fn rth_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).expect("valid time")
}

fn prep_start() -> NaiveTime {
    NaiveTime::from_hms_opt(4, 0, 0).expect("valid time")
}

fn cooldown_end() -> NaiveTime {
    NaiveTime::from_hms_opt(20, 0, 0).expect("valid time")
}

/// The session clock. Holds only the cached holiday calendar.
#[derive(Debug, Default)]
pub struct MarketClock {
    calendar: HolidayCalendar,
}

impl MarketClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Why `date` does not trade, or `None` if it is a normal trading day.
    pub fn non_trading_reason(&self, date: NaiveDate) -> Option<NonTradingReason> {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return Some(NonTradingReason::Weekend);
        }
        if let Some(name) = self.calendar.bank_holiday(date) {
            return Some(NonTradingReason::BankHoliday(name));
        }
        if let Some(name) = self.calendar.low_volume_day(date) {
            return Some(NonTradingReason::LowVolume(name));
        }
        None
    }

    /// False on weekends, bank holidays, and low-volume skip days.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.non_trading_reason(date).is_none()
    }

    /// Whether the exchange itself is open on `date` (the strategy may still
    /// stand down on low-volume days).
    pub fn is_exchange_open_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
            && self.calendar.bank_holiday(date).is_none()
    }

    /// Closing time (ET) for `date`: 13:00 on early-close days, else 16:00.
    pub fn close_time(&self, date: NaiveDate) -> NaiveTime {
        if self.calendar.early_close(date).is_some() {
            early_close_time()
        } else {
            rth_close()
        }
    }

    /// RTH open in UTC for `date`.
    pub fn open_instant(&self, date: NaiveDate) -> DateTime<Utc> {
        eastern::from_eastern(date.and_time(rth_open()))
    }

    /// RTH close in UTC for `date`, respecting early closes.
    pub fn close_instant(&self, date: NaiveDate) -> DateTime<Utc> {
        eastern::from_eastern(date.and_time(self.close_time(date)))
    }

    /// Trading day AND the ET wall clock is inside regular hours.
    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        let et = eastern::to_eastern(now);
        if !self.is_trading_day(et.date()) {
            return false;
        }
        et.time() >= rth_open() && et.time() < self.close_time(et.date())
    }

    /// Current session phase.
    pub fn phase(&self, now: DateTime<Utc>) -> SessionPhase {
        let et = eastern::to_eastern(now);
        if !self.is_trading_day(et.date()) {
            return SessionPhase::Dark;
        }
        let t = et.time();
        let close = self.close_time(et.date());
        if t < prep_start() {
            SessionPhase::Dark
        } else if t < rth_open() {
            SessionPhase::Prep
        } else if t < close {
            SessionPhase::Open
        } else if t < cooldown_end() {
            SessionPhase::Cooldown
        } else {
            SessionPhase::Dark
        }
    }

    /// The next RTH open at or after `now`.
    pub fn next_open(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = eastern::eastern_date(now);
        for _ in 0..3660 {
            if self.is_trading_day(date) {
                let open = self.open_instant(date);
                if open > now {
                    return open;
                }
            }
            date += Duration::days(1);
        }
        // Ten years without a trading day cannot happen.
        unreachable!("no trading day found within ten years")
    }

    /// The next RTH close at or after `now`.
    pub fn next_close(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = eastern::eastern_date(now);
        for _ in 0..3660 {
            if self.is_trading_day(date) {
                let close = self.close_instant(date);
                if close > now {
                    return close;
                }
            }
            date += Duration::days(1);
        }
        unreachable!("no trading day found within ten years")
    }

    /// Minutes elapsed since today's RTH open, or `None` outside OPEN.
    pub fn minutes_since_open(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.phase(now) != SessionPhase::Open {
            return None;
        }
        let date = eastern::eastern_date(now);
        Some((now - self.open_instant(date)).num_minutes())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn weekend_is_not_a_trading_day() {
        let clock = MarketClock::new();
        assert!(!clock.is_trading_day(d(2026, 1, 3))); // Saturday
        assert!(!clock.is_trading_day(d(2026, 1, 4))); // Sunday
        assert!(clock.is_trading_day(d(2026, 1, 6))); // Tuesday
    }

    #[test]
    fn holidays_and_skip_days_are_masked() {
        let clock = MarketClock::new();
        // Christmas 2026 (Friday).
        assert_eq!(
            clock.non_trading_reason(d(2026, 12, 25)),
            Some(NonTradingReason::BankHoliday("Christmas Day"))
        );
        // Black Friday 2026 — exchange open, strategy skips.
        assert!(matches!(
            clock.non_trading_reason(d(2026, 11, 27)),
            Some(NonTradingReason::LowVolume(_))
        ));
        assert!(clock.is_exchange_open_day(d(2026, 11, 27)));
    }

    #[test]
    fn phases_across_a_winter_day() {
        let clock = MarketClock::new();
        // 2026-01-06, EST (UTC-5).
        assert_eq!(clock.phase(utc(2026, 1, 6, 8, 0)), SessionPhase::Dark); // 03:00 ET
        assert_eq!(clock.phase(utc(2026, 1, 6, 9, 0)), SessionPhase::Prep); // 04:00 ET
        assert_eq!(clock.phase(utc(2026, 1, 6, 14, 29)), SessionPhase::Prep); // 09:29 ET
        assert_eq!(clock.phase(utc(2026, 1, 6, 14, 30)), SessionPhase::Open); // 09:30 ET
        assert_eq!(clock.phase(utc(2026, 1, 6, 20, 59)), SessionPhase::Open); // 15:59 ET
        assert_eq!(clock.phase(utc(2026, 1, 6, 21, 0)), SessionPhase::Cooldown); // 16:00 ET
        assert_eq!(clock.phase(utc(2026, 1, 7, 1, 0)), SessionPhase::Dark); // 20:00 ET
    }

    #[test]
    fn early_close_shortens_open_phase() {
        let clock = MarketClock::new();
        // Black Friday 2026-11-27 is a low-volume skip day, so use Christmas
        // Eve 2026-12-24 (early close, also low-volume) to check close_time
        // directly instead of the phase.
        assert_eq!(clock.close_time(d(2026, 12, 24)), early_close_time());
        assert_eq!(clock.close_time(d(2026, 12, 23)), NaiveTime::from_hms_opt(16, 0, 0).unwrap());
    }

    #[test]
    fn market_open_respects_rth_bounds() {
        let clock = MarketClock::new();
        assert!(!clock.is_market_open(utc(2026, 1, 6, 14, 29)));
        assert!(clock.is_market_open(utc(2026, 1, 6, 14, 30)));
        assert!(clock.is_market_open(utc(2026, 1, 6, 20, 59)));
        assert!(!clock.is_market_open(utc(2026, 1, 6, 21, 0)));
        // Saturday never opens.
        assert!(!clock.is_market_open(utc(2026, 1, 3, 15, 0)));
    }

    #[test]
    fn next_open_skips_weekend_and_holiday() {
        let clock = MarketClock::new();
        // Friday 2026-01-02 is a low-volume skip day (day after New Year's);
        // from Thursday 20:00 ET the next open is Monday 2026-01-05.
        let from = utc(2026, 1, 2, 1, 0); // Thursday Jan 1 20:00 ET
        let open = clock.next_open(from);
        assert_eq!(eastern::eastern_date(open), d(2026, 1, 5));
        assert_eq!(
            eastern::eastern_time(open),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap()
        );
    }

    #[test]
    fn next_close_same_day_when_open() {
        let clock = MarketClock::new();
        let now = utc(2026, 1, 6, 15, 0); // 10:00 ET
        let close = clock.next_close(now);
        assert_eq!(eastern::eastern_date(close), d(2026, 1, 6));
        assert_eq!(
            eastern::eastern_time(close),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap()
        );
    }

    #[test]
    fn minutes_since_open_tracks_session() {
        let clock = MarketClock::new();
        assert_eq!(clock.minutes_since_open(utc(2026, 1, 6, 14, 45)), Some(15));
        assert_eq!(clock.minutes_since_open(utc(2026, 1, 6, 15, 15)), Some(45));
        assert_eq!(clock.minutes_since_open(utc(2026, 1, 6, 13, 0)), None);
    }
}

// =============================================================================
// US market holiday calendar — computed, not tabulated
// =============================================================================
//
// Three independent classifications per calendar date:
//
//   1. **Bank holidays** — market fully closed. Fixed dates (observed-shifted
//      when they land on a weekend), Easter-derived Good Friday, and
//      nth-weekday holidays (MLK, Presidents', Memorial, Labor,
//      Thanksgiving).
//   2. **Low-volume skip days** — market open but the strategy stands down:
//      Columbus/Indigenous Peoples' Day, Veterans Day and Halloween when they
//      fall on a weekday, the day before Thanksgiving, Black Friday,
//      Christmas Eve, the day after Christmas, New Year's Eve, and the day
//      after New Year's.
//   3. **Early-close days** — 13:00 ET close: July 3 (when the 4th is a
//      weekday or Monday), Black Friday, Christmas Eve (when Christmas is a
//      weekday or Monday).
//
// Everything is derived algorithmically so the calendar works for any year;
// computed sets are cached per-year.
// =============================================================================

use std::collections::HashMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use parking_lot::RwLock;

use super::eastern::{last_weekday_of_month, nth_weekday_of_month};

/// Early-close wall-clock time (ET) on half days.
pub fn early_close_time() -> NaiveTime {
    NaiveTime::from_hms_opt(13, 0, 0).expect("valid time")
}

/// Easter Sunday via the anonymous Gregorian computus.
pub fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).expect("computus yields a valid date")
}

/// Shift a fixed-date holiday to its observed weekday: Saturday observes
/// Friday, Sunday observes Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// A single computed calendar year.
#[derive(Debug, Clone)]
pub struct HolidayYear {
    /// Market fully closed.
    pub bank_holidays: HashMap<NaiveDate, &'static str>,
    /// Market open, strategy stands down.
    pub low_volume_days: HashMap<NaiveDate, &'static str>,
    /// 13:00 ET close.
    pub early_close_days: HashMap<NaiveDate, &'static str>,
}

impl HolidayYear {
    pub fn compute(year: i32) -> Self {
        let mut bank = HashMap::new();
        let mut low = HashMap::new();
        let mut early = HashMap::new();

        // ── Bank holidays ───────────────────────────────────────────────
        let new_years = NaiveDate::from_ymd_opt(year, 1, 1).expect("valid");
        bank.insert(observed(new_years), "New Year's Day");
        bank.insert(
            nth_weekday_of_month(year, 1, Weekday::Mon, 3),
            "Martin Luther King Jr. Day",
        );
        bank.insert(
            nth_weekday_of_month(year, 2, Weekday::Mon, 3),
            "Presidents' Day",
        );
        bank.insert(easter_sunday(year) - Duration::days(2), "Good Friday");
        bank.insert(last_weekday_of_month(year, 5, Weekday::Mon), "Memorial Day");
        bank.insert(
            observed(NaiveDate::from_ymd_opt(year, 6, 19).expect("valid")),
            "Juneteenth",
        );
        bank.insert(
            observed(NaiveDate::from_ymd_opt(year, 7, 4).expect("valid")),
            "Independence Day",
        );
        bank.insert(nth_weekday_of_month(year, 9, Weekday::Mon, 1), "Labor Day");
        let thanksgiving = nth_weekday_of_month(year, 11, Weekday::Thu, 4);
        bank.insert(thanksgiving, "Thanksgiving Day");
        let christmas = NaiveDate::from_ymd_opt(year, 12, 25).expect("valid");
        bank.insert(observed(christmas), "Christmas Day");

        // ── Low-volume skip days ────────────────────────────────────────
        let halloween = NaiveDate::from_ymd_opt(year, 10, 31).expect("valid");
        if is_weekday(halloween) {
            low.insert(halloween, "Halloween");
        }
        low.insert(
            nth_weekday_of_month(year, 10, Weekday::Mon, 2),
            "Indigenous Peoples' Day",
        );
        let veterans = NaiveDate::from_ymd_opt(year, 11, 11).expect("valid");
        if is_weekday(veterans) {
            low.insert(veterans, "Veterans Day");
        }
        let day_before_thanksgiving = thanksgiving - Duration::days(1);
        low.insert(day_before_thanksgiving, "Day Before Thanksgiving");
        let black_friday = thanksgiving + Duration::days(1);
        low.insert(black_friday, "Black Friday");
        let christmas_eve = NaiveDate::from_ymd_opt(year, 12, 24).expect("valid");
        if is_weekday(christmas_eve) {
            low.insert(christmas_eve, "Christmas Eve");
        }
        let nye = NaiveDate::from_ymd_opt(year, 12, 31).expect("valid");
        if is_weekday(nye) {
            low.insert(nye, "New Year's Eve");
        }
        let day_after_christmas = NaiveDate::from_ymd_opt(year, 12, 26).expect("valid");
        if is_weekday(christmas) && is_weekday(day_after_christmas) {
            low.insert(day_after_christmas, "Day After Christmas");
        }
        let day_after_ny = NaiveDate::from_ymd_opt(year, 1, 2).expect("valid");
        if is_weekday(new_years) && is_weekday(day_after_ny) {
            low.insert(day_after_ny, "Day After New Year's");
        }

        // ── Early-close days ────────────────────────────────────────────
        let july_4 = NaiveDate::from_ymd_opt(year, 7, 4).expect("valid");
        if matches!(
            july_4.weekday(),
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu | Weekday::Fri
        ) {
            early.insert(
                NaiveDate::from_ymd_opt(year, 7, 3).expect("valid"),
                "Independence Day Eve",
            );
        }
        early.insert(black_friday, "Black Friday");
        if matches!(
            christmas.weekday(),
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu | Weekday::Fri
        ) {
            early.insert(christmas_eve, "Christmas Eve");
        }

        Self {
            bank_holidays: bank,
            low_volume_days: low,
            early_close_days: early,
        }
    }
}

/// Per-year cache over [`HolidayYear::compute`].
#[derive(Debug, Default)]
pub struct HolidayCalendar {
    years: RwLock<HashMap<i32, HolidayYear>>,
}

impl HolidayCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_year<T>(&self, year: i32, f: impl FnOnce(&HolidayYear) -> T) -> T {
        {
            let years = self.years.read();
            if let Some(y) = years.get(&year) {
                return f(y);
            }
        }
        let mut years = self.years.write();
        let entry = years.entry(year).or_insert_with(|| HolidayYear::compute(year));
        f(entry)
    }

    /// Bank holiday name, if `date` is one.
    pub fn bank_holiday(&self, date: NaiveDate) -> Option<&'static str> {
        self.with_year(date.year(), |y| y.bank_holidays.get(&date).copied())
    }

    /// Low-volume skip-day name, if `date` is one.
    pub fn low_volume_day(&self, date: NaiveDate) -> Option<&'static str> {
        self.with_year(date.year(), |y| y.low_volume_days.get(&date).copied())
    }

    /// Early-close name, if `date` closes at 13:00 ET.
    pub fn early_close(&self, date: NaiveDate) -> Option<&'static str> {
        self.with_year(date.year(), |y| y.early_close_days.get(&date).copied())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn easter_known_dates() {
        assert_eq!(easter_sunday(2024), d(2024, 3, 31));
        assert_eq!(easter_sunday(2025), d(2025, 4, 20));
        assert_eq!(easter_sunday(2026), d(2026, 4, 5));
        assert_eq!(easter_sunday(2030), d(2030, 4, 21));
    }

    #[test]
    fn bank_holidays_2026() {
        let y = HolidayYear::compute(2026);
        assert!(y.bank_holidays.contains_key(&d(2026, 1, 1)), "New Year's");
        assert!(y.bank_holidays.contains_key(&d(2026, 1, 19)), "MLK");
        assert!(y.bank_holidays.contains_key(&d(2026, 2, 16)), "Presidents'");
        assert!(y.bank_holidays.contains_key(&d(2026, 4, 3)), "Good Friday");
        assert!(y.bank_holidays.contains_key(&d(2026, 5, 25)), "Memorial");
        assert!(y.bank_holidays.contains_key(&d(2026, 6, 19)), "Juneteenth");
        assert!(y.bank_holidays.contains_key(&d(2026, 7, 3)), "July 4 observed Friday");
        assert!(y.bank_holidays.contains_key(&d(2026, 9, 7)), "Labor Day");
        assert!(y.bank_holidays.contains_key(&d(2026, 11, 26)), "Thanksgiving");
        assert!(y.bank_holidays.contains_key(&d(2026, 12, 25)), "Christmas");
    }

    #[test]
    fn observed_shifts() {
        // July 4 2026 is a Saturday — observed Friday July 3.
        let y = HolidayYear::compute(2026);
        assert!(!y.bank_holidays.contains_key(&d(2026, 7, 4)));
        assert!(y.bank_holidays.contains_key(&d(2026, 7, 3)));

        // Christmas 2021 was a Saturday — observed Friday Dec 24.
        let y21 = HolidayYear::compute(2021);
        assert!(y21.bank_holidays.contains_key(&d(2021, 12, 24)));
    }

    #[test]
    fn low_volume_days_2026() {
        let y = HolidayYear::compute(2026);
        // Indigenous Peoples' Day: second Monday of October = Oct 12.
        assert!(y.low_volume_days.contains_key(&d(2026, 10, 12)));
        // Veterans Day 2026 is a Wednesday.
        assert!(y.low_volume_days.contains_key(&d(2026, 11, 11)));
        // Day before Thanksgiving and Black Friday.
        assert!(y.low_volume_days.contains_key(&d(2026, 11, 25)));
        assert!(y.low_volume_days.contains_key(&d(2026, 11, 27)));
        // Christmas Eve 2026 is a Thursday; NYE 2026 is a Thursday.
        assert!(y.low_volume_days.contains_key(&d(2026, 12, 24)));
        assert!(y.low_volume_days.contains_key(&d(2026, 12, 31)));
        // Halloween 2026 is a Saturday — not a skip day.
        assert!(!y.low_volume_days.contains_key(&d(2026, 10, 31)));
    }

    #[test]
    fn early_close_days_2026() {
        let y = HolidayYear::compute(2026);
        // Black Friday is always an early close.
        assert!(y.early_close_days.contains_key(&d(2026, 11, 27)));
        // Christmas 2026 is a Friday, so Dec 24 closes early.
        assert!(y.early_close_days.contains_key(&d(2026, 12, 24)));
    }

    #[test]
    fn holiday_mask_2020_to_2035() {
        // Every year must produce the full bank-holiday set and the low-volume
        // entries that are weekday-independent.
        let cal = HolidayCalendar::new();
        for year in 2020..=2035 {
            let thanksgiving = nth_weekday_of_month(year, 11, Weekday::Thu, 4);
            assert!(cal.bank_holiday(thanksgiving).is_some(), "thanksgiving {year}");
            assert!(
                cal.low_volume_day(thanksgiving + Duration::days(1)).is_some(),
                "black friday {year}"
            );
            assert!(
                cal.low_volume_day(nth_weekday_of_month(year, 10, Weekday::Mon, 2)).is_some(),
                "columbus {year}"
            );
            assert!(
                cal.bank_holiday(easter_sunday(year) - Duration::days(2)).is_some(),
                "good friday {year}"
            );
            assert!(
                cal.bank_holiday(nth_weekday_of_month(year, 1, Weekday::Mon, 3)).is_some(),
                "mlk {year}"
            );
            assert!(
                cal.bank_holiday(last_weekday_of_month(year, 5, Weekday::Mon)).is_some(),
                "memorial {year}"
            );
            assert!(
                cal.bank_holiday(nth_weekday_of_month(year, 9, Weekday::Mon, 1)).is_some(),
                "labor {year}"
            );
        }
    }

    #[test]
    fn calendar_caches_years() {
        let cal = HolidayCalendar::new();
        let _ = cal.bank_holiday(d(2026, 12, 25));
        assert!(cal.years.read().contains_key(&2026));
    }
}

// =============================================================================
// US Eastern wall-clock conversion
// =============================================================================
//
// The exchange clock is US Eastern with DST. Rather than pulling in a tz
// database, the offset is computed from the statutory rule in force since
// 2007: DST begins 02:00 local on the second Sunday of March and ends 02:00
// local on the first Sunday of November.
//
// All engine scheduling questions reduce to "what is the ET wall clock and
// date right now", answered here from a `DateTime<Utc>`.
// =============================================================================

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};

/// Standard-time offset (EST): UTC-5.
const EST_OFFSET_HOURS: i64 = -5;
/// Daylight-time offset (EDT): UTC-4.
const EDT_OFFSET_HOURS: i64 = -4;

/// The nth occurrence of `weekday` in the given month.
pub fn nth_weekday_of_month(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let days_ahead =
        (weekday.num_days_from_monday() + 7 - first.weekday().num_days_from_monday()) % 7;
    first + Duration::days(days_ahead as i64 + 7 * (n as i64 - 1))
}

/// The last occurrence of `weekday` in the given month.
pub fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let next_month_start = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month start");
    let last = next_month_start - Duration::days(1);
    let days_back =
        (last.weekday().num_days_from_monday() + 7 - weekday.num_days_from_monday()) % 7;
    last - Duration::days(days_back as i64)
}

/// DST start instant in UTC for `year`: second Sunday of March, 02:00 EST.
fn dst_start_utc(year: i32) -> NaiveDateTime {
    let date = nth_weekday_of_month(year, 3, Weekday::Sun, 2);
    // 02:00 EST == 07:00 UTC
    date.and_time(NaiveTime::from_hms_opt(7, 0, 0).expect("valid time"))
}

/// DST end instant in UTC for `year`: first Sunday of November, 02:00 EDT.
fn dst_end_utc(year: i32) -> NaiveDateTime {
    let date = nth_weekday_of_month(year, 11, Weekday::Sun, 1);
    // 02:00 EDT == 06:00 UTC
    date.and_time(NaiveTime::from_hms_opt(6, 0, 0).expect("valid time"))
}

/// Whether the given UTC instant falls in US daylight-saving time.
pub fn is_dst(utc: chrono::DateTime<Utc>) -> bool {
    let naive = utc.naive_utc();
    naive >= dst_start_utc(naive.year()) && naive < dst_end_utc(naive.year())
}

/// UTC offset of the Eastern wall clock at `utc`, in hours.
pub fn offset_hours(utc: chrono::DateTime<Utc>) -> i64 {
    if is_dst(utc) {
        EDT_OFFSET_HOURS
    } else {
        EST_OFFSET_HOURS
    }
}

/// Eastern wall-clock datetime for a UTC instant.
pub fn to_eastern(utc: chrono::DateTime<Utc>) -> NaiveDateTime {
    utc.naive_utc() + Duration::hours(offset_hours(utc))
}

/// Eastern calendar date for a UTC instant.
pub fn eastern_date(utc: chrono::DateTime<Utc>) -> NaiveDate {
    to_eastern(utc).date()
}

/// Eastern wall-clock time of day for a UTC instant.
pub fn eastern_time(utc: chrono::DateTime<Utc>) -> NaiveTime {
    to_eastern(utc).time()
}

/// Convert an Eastern wall-clock datetime back to UTC.
///
/// During the repeated hour at the fall-back transition the earlier (EDT)
/// reading is chosen.
pub fn from_eastern(eastern: NaiveDateTime) -> chrono::DateTime<Utc> {
    // Try EDT first; accept it if the roundtrip lands inside DST.
    let candidate_edt = Utc
        .from_utc_datetime(&(eastern - Duration::hours(EDT_OFFSET_HOURS)));
    if is_dst(candidate_edt) {
        return candidate_edt;
    }
    Utc.from_utc_datetime(&(eastern - Duration::hours(EST_OFFSET_HOURS)))
}

/// Next midnight on the Eastern wall clock after `utc`, expressed in UTC.
/// OAuth tokens expire at this instant.
pub fn next_midnight_eastern(utc: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    let et_date = eastern_date(utc);
    let next_midnight = (et_date + Duration::days(1))
        .and_time(NaiveTime::from_hms_opt(0, 0, 0).expect("valid time"));
    from_eastern(next_midnight)
}

// ===============================
// src/clock.rs
// ===============================
//
// Jam pasar (market window) sebagai fungsi murni dari waktu + timezone lokal.
// Semua perbandingan dalam resolusi menit, sama seperti jam bursa.
//
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Timelike, Utc, Weekday};

/// Source of "now". Production uses [`SystemClock`]; tests drive time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

#[derive(Debug, Clone)]
pub struct MarketHours {
    pub offset: FixedOffset,
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Non-negative EOD close starts here.
    pub eod_start: NaiveTime,
    /// Soft risk guard (stop entries when red) starts here.
    pub derisk_after: NaiveTime,
    pub hard_cutoff: NaiveTime,
    /// Dev override: treat the market as always open.
    pub force_open: bool,
}

impl Default for MarketHours {
    fn default() -> Self {
        // NSE cash session, IST (UTC+05:30, no DST)
        Self {
            offset: offset_minutes(330),
            open: hm(9, 15),
            close: hm(15, 10),
            eod_start: hm(14, 30),
            derisk_after: hm(14, 0),
            hard_cutoff: hm(15, 25),
            force_open: false,
        }
    }
}

/// Fixed offset east of UTC in minutes; out-of-range values fall back to UTC.
pub fn offset_minutes(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix())
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

fn minutes_of(t: NaiveTime) -> u32 { t.hour() * 60 + t.minute() }

/// Parse "HH:MM" (e.g. `EOD_HARD_CUTOFF=15:25`).
pub fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    let (h, m) = raw.trim().split_once(':')?;
    NaiveTime::from_hms_opt(h.trim().parse().ok()?, m.trim().parse().ok()?, 0)
}

impl MarketHours {
    pub fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.offset)
    }

    fn minutes(&self, now: DateTime<Utc>) -> u32 {
        let l = self.local(now);
        l.hour() * 60 + l.minute()
    }

    pub fn is_weekend(&self, now: DateTime<Utc>) -> bool {
        matches!(self.local(now).weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        if self.force_open { return true; }
        if self.is_weekend(now) { return false; }
        let m = self.minutes(now);
        m >= minutes_of(self.open) && m <= minutes_of(self.close)
    }

    /// Past the official close (weekends count as closed all day).
    pub fn is_after_close(&self, now: DateTime<Utc>) -> bool {
        self.is_weekend(now) || self.minutes(now) > minutes_of(self.close)
    }

    pub fn is_squareoff_window(&self, now: DateTime<Utc>) -> bool {
        self.minutes(now) >= minutes_of(self.close)
    }

    pub fn is_eod_window(&self, now: DateTime<Utc>) -> bool {
        self.minutes(now) >= minutes_of(self.eod_start)
    }

    pub fn is_past_derisk(&self, now: DateTime<Utc>) -> bool {
        self.minutes(now) >= minutes_of(self.derisk_after)
    }

    pub fn is_past_hard_cutoff(&self, now: DateTime<Utc>) -> bool {
        self.minutes(now) >= minutes_of(self.hard_cutoff)
    }

    /// "yyyy-mm-dd" of the local trading day.
    pub fn today_key(&self, now: DateTime<Utc>) -> String {
        self.local(now).format("%Y-%m-%d").to_string()
    }

    /// UTC `[start, end)` of the local day containing `now`.
    pub fn day_bounds_utc(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let local = self.local(now);
        let midnight = local.date_naive().and_time(NaiveTime::MIN);
        let start = self
            .offset
            .from_local_datetime(&midnight)
            .single()
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(now);
        (start, start + Duration::days(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    // 2024-01-01 is a Monday. IST = UTC+05:30.
    #[test]
    fn session_edges_are_inclusive_by_minute() {
        let hours = MarketHours::default();
        assert!(!hours.is_market_open(utc(2024, 1, 1, 3, 44))); // 09:14 IST
        assert!(hours.is_market_open(utc(2024, 1, 1, 3, 45))); // 09:15 IST
        assert!(hours.is_market_open(utc(2024, 1, 1, 9, 40))); // 15:10 IST
        assert!(!hours.is_market_open(utc(2024, 1, 1, 9, 41))); // 15:11 IST
        assert!(hours.is_after_close(utc(2024, 1, 1, 9, 41)));
        assert!(!hours.is_after_close(utc(2024, 1, 1, 9, 40)));
    }

    #[test]
    fn weekend_is_closed_and_after_close() {
        let hours = MarketHours::default();
        let sat_noon = utc(2024, 1, 6, 6, 30);
        assert!(hours.is_weekend(sat_noon));
        assert!(!hours.is_market_open(sat_noon));
        assert!(hours.is_after_close(sat_noon));

        let forced = MarketHours { force_open: true, ..MarketHours::default() };
        assert!(forced.is_market_open(sat_noon));
    }

    #[test]
    fn cutoff_and_windows() {
        let hours = MarketHours::default();
        assert!(!hours.is_past_hard_cutoff(utc(2024, 1, 1, 9, 54))); // 15:24
        assert!(hours.is_past_hard_cutoff(utc(2024, 1, 1, 9, 55))); // 15:25
        assert!(hours.is_eod_window(utc(2024, 1, 1, 9, 0))); // 14:30
        assert!(!hours.is_eod_window(utc(2024, 1, 1, 8, 59)));
        assert!(hours.is_past_derisk(utc(2024, 1, 1, 8, 30))); // 14:00
        assert!(hours.is_squareoff_window(utc(2024, 1, 1, 9, 40)));
    }

    #[test]
    fn day_key_follows_local_date() {
        let hours = MarketHours::default();
        // 2024-01-01 19:00 UTC is already 00:30 on the 2nd in IST
        let now = utc(2024, 1, 1, 19, 0);
        assert_eq!(hours.today_key(now), "2024-01-02");
        let (start, end) = hours.day_bounds_utc(now);
        assert_eq!(start, utc(2024, 1, 1, 18, 30));
        assert_eq!(end, utc(2024, 1, 2, 18, 30));
    }

    #[test]
    fn parses_hhmm() {
        assert_eq!(parse_hhmm("15:25"), Some(hm(15, 25)));
        assert_eq!(parse_hhmm(" 9:05 "), Some(hm(9, 5)));
        assert_eq!(parse_hhmm("25:00"), None);
        assert_eq!(parse_hhmm("nope"), None);
    }
}

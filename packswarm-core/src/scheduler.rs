//! Time-of-day bandwidth windows, evaluated in a fixed IANA timezone via
//! `chrono-tz` for real tzdb lookups.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeekdaySet {
    All,
    Weekday,
    Weekend,
    Single(
        #[serde(with = "weekday_serde")]
        Weekday,
    ),
}

mod weekday_serde {
    use chrono::Weekday;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(w: &Weekday, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&w.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Weekday, D::Error> {
        let s = String::deserialize(d)?;
        Weekday::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl WeekdaySet {
    fn contains(&self, day: Weekday) -> bool {
        match self {
            WeekdaySet::All => true,
            WeekdaySet::Weekday => !matches!(day, Weekday::Sat | Weekday::Sun),
            WeekdaySet::Weekend => matches!(day, Weekday::Sat | Weekday::Sun),
            WeekdaySet::Single(d) => *d == day,
        }
    }

    /// Parses `"monday"`..`"sunday"`, or the aliases `"weekday"`, `"weekend"`, `"all"`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "all" => Ok(WeekdaySet::All),
            "weekday" | "weekdays" => Ok(WeekdaySet::Weekday),
            "weekend" | "weekends" => Ok(WeekdaySet::Weekend),
            other => {
                let mut capitalized = String::with_capacity(other.len());
                let mut chars = other.chars();
                if let Some(first) = chars.next() {
                    capitalized.extend(first.to_uppercase());
                    capitalized.extend(chars);
                }
                capitalized
                    .parse::<Weekday>()
                    .map(WeekdaySet::Single)
                    .map_err(|_| format!("unrecognized weekday or alias: {other}"))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Window {
    pub days: Vec<WeekdaySet>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Window {
    fn days_match(&self, day: Weekday) -> bool {
        self.days.iter().any(|set| set.contains(day))
    }

    /// True if `end <= start`, meaning the window spans midnight.
    fn crosses_midnight(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `local` (already converted to the scheduler's timezone) falls
    /// inside this window, accounting for midnight-crossing windows which
    /// must be checked against both "today" and "yesterday".
    fn contains(&self, local: DateTime<Tz>) -> bool {
        let day = local.weekday();
        let time = local.time();

        if !self.crosses_midnight() {
            return self.days_match(day) && time >= self.start && time < self.end;
        }

        // Window opened "today" and hasn't closed yet (runs into tomorrow).
        let opened_today = self.days_match(day) && time >= self.start;
        // Window opened "yesterday" and hasn't closed yet (we're in the tail).
        let opened_yesterday = self.days_match(day.pred()) && time < self.end;
        opened_today || opened_yesterday
    }

    /// The next instant (on or after `from_time` on `from_day`) at which this
    /// window opens, ignoring whether we're currently inside it.
    fn next_start_after(&self, local: DateTime<Tz>) -> DateTime<Tz> {
        for offset in 0..8 {
            let candidate_date = local.date_naive() + chrono::Duration::days(offset);
            let candidate_day = candidate_date.weekday();
            if !self.days_match(candidate_day) {
                continue;
            }
            let candidate = candidate_date.and_time(self.start);
            if let Some(dt) = local.timezone().from_local_datetime(&candidate).earliest() {
                if dt > local {
                    return dt;
                }
            }
        }
        // Degenerate: no matching weekday in the lookahead window. Should be
        // unreachable given `offset` spans a full week, but avoid panicking.
        local
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub windows: Vec<Window>,
    pub timezone: Tz,
    /// bytes/sec; 0 means unlimited.
    pub inside_window_rate: u64,
    /// bytes/sec; 0 means unlimited.
    pub outside_window_rate: u64,
    pub urgent_full_speed: bool,
}

pub struct WindowScheduler {
    config: SchedulerConfig,
}

impl WindowScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn is_in_window(&self, now: DateTime<Utc>) -> bool {
        if !self.config.enabled || self.config.windows.is_empty() {
            return false;
        }
        let local = now.with_timezone(&self.config.timezone);
        self.config.windows.iter().any(|w| w.contains(local))
    }

    /// `0` always means unlimited. Urgent transfers bypass entirely when
    /// `urgent_full_speed` is set, regardless of window.
    pub fn current_rate(&self, now: DateTime<Utc>, urgent: bool) -> u64 {
        if urgent && self.config.urgent_full_speed {
            return 0;
        }
        if !self.config.enabled {
            return 0;
        }
        if self.is_in_window(now) {
            self.config.inside_window_rate
        } else {
            self.config.outside_window_rate
        }
    }

    /// The earliest future window start, or `None` if we're currently
    /// inside a window (or scheduling is disabled).
    pub fn next_open(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.config.enabled || self.config.windows.is_empty() {
            return None;
        }
        if self.is_in_window(now) {
            return None;
        }
        let local = now.with_timezone(&self.config.timezone);
        self.config
            .windows
            .iter()
            .map(|w| w.next_start_after(local))
            .min()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn business_hours_scheduler() -> WindowScheduler {
        WindowScheduler::new(SchedulerConfig {
            enabled: true,
            windows: vec![Window {
                days: vec![WeekdaySet::Weekday],
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            }],
            timezone: chrono_tz::UTC,
            inside_window_rate: 0,
            outside_window_rate: 1024 * 1024,
            urgent_full_speed: true,
        })
    }

    #[test]
    fn weekday_business_hours_window_containment() {
        let sched = business_hours_scheduler();

        let monday_10am = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        assert!(sched.is_in_window(monday_10am));
        assert_eq!(sched.current_rate(monday_10am, false), 0);

        let monday_859am = Utc.with_ymd_and_hms(2025, 1, 6, 8, 59, 0).unwrap();
        assert!(!sched.is_in_window(monday_859am));
        assert_eq!(sched.current_rate(monday_859am, false), 1024 * 1024);
        assert_eq!(sched.current_rate(monday_859am, true), 0);

        let monday_8am = Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap();
        let expected_open = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();
        assert_eq!(sched.next_open(monday_8am), Some(expected_open));
    }

    #[test]
    fn next_open_is_none_while_inside() {
        let sched = business_hours_scheduler();
        let monday_10am = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        assert_eq!(sched.next_open(monday_10am), None);
    }

    #[test]
    fn weekend_is_outside_weekday_window() {
        let sched = business_hours_scheduler();
        let saturday_noon = Utc.with_ymd_and_hms(2025, 1, 4, 12, 0, 0).unwrap();
        assert!(!sched.is_in_window(saturday_noon));
    }

    #[test]
    fn midnight_crossing_window_spans_two_calendar_days() {
        let sched = WindowScheduler::new(SchedulerConfig {
            enabled: true,
            windows: vec![Window {
                days: vec![WeekdaySet::All],
                start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            }],
            timezone: chrono_tz::UTC,
            inside_window_rate: 0,
            outside_window_rate: 500_000,
            urgent_full_speed: false,
        });

        let just_after_open = Utc.with_ymd_and_hms(2025, 1, 6, 23, 0, 0).unwrap();
        assert!(sched.is_in_window(just_after_open));

        let tail_of_window = Utc.with_ymd_and_hms(2025, 1, 7, 3, 0, 0).unwrap();
        assert!(sched.is_in_window(tail_of_window));

        let outside = Utc.with_ymd_and_hms(2025, 1, 7, 12, 0, 0).unwrap();
        assert!(!sched.is_in_window(outside));
    }

    #[test]
    fn disabled_scheduler_is_never_in_window() {
        let mut cfg = SchedulerConfig {
            enabled: false,
            windows: vec![],
            timezone: chrono_tz::UTC,
            inside_window_rate: 0,
            outside_window_rate: 0,
            urgent_full_speed: false,
        };
        cfg.windows.push(Window {
            days: vec![WeekdaySet::All],
            start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
        });
        let sched = WindowScheduler::new(cfg);
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        assert!(!sched.is_in_window(now));
        assert_eq!(sched.next_open(now), None);
    }
}

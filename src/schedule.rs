//! Weekly schedule windows
//!
//! A schedule is a set of weekdays plus a start/stop minute-of-day.
//! Evaluation is a pure function of the wall clock so the reaper, the
//! proxy handler and the tests all agree on what "up" means.

use crate::config::ScheduleConfig;
use crate::error::Error;
use chrono::{Datelike, Timelike, Weekday};
use std::collections::HashSet;

/// Parsed weekly window.
///
/// `start == stop` means always on. `start < stop` is the window
/// `[start, stop)`. `start > stop` wraps around midnight:
/// `[start, 1440) ∪ [0, stop)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSchedule {
    /// Days the window applies to. Empty means any day.
    pub days: HashSet<Weekday>,
    /// Window start, minutes after midnight.
    pub start_minutes: u32,
    /// Window stop, minutes after midnight.
    pub stop_minutes: u32,
}

/// Parse "HH:MM" into minutes after midnight. Empty input means 00:00.
fn parse_hhmm(s: &str) -> Result<u32, Error> {
    if s.is_empty() {
        return Ok(0);
    }
    let invalid = || Error::InvalidInput(format!("invalid time {:?}, expected HH:MM", s));
    let (h, m) = s.split_once(':').ok_or_else(invalid)?;
    let h: u32 = h.parse().map_err(|_| invalid())?;
    let m: u32 = m.parse().map_err(|_| invalid())?;
    if h > 23 || m > 59 {
        return Err(invalid());
    }
    Ok(h * 60 + m)
}

fn parse_day(s: &str) -> Result<Weekday, Error> {
    match s.to_lowercase().as_str() {
        "mon" => Ok(Weekday::Mon),
        "tue" => Ok(Weekday::Tue),
        "wed" => Ok(Weekday::Wed),
        "thu" => Ok(Weekday::Thu),
        "fri" => Ok(Weekday::Fri),
        "sat" => Ok(Weekday::Sat),
        "sun" => Ok(Weekday::Sun),
        _ => Err(Error::InvalidInput(format!("invalid day {:?}", s))),
    }
}

impl ServiceSchedule {
    /// Parse a schedule from its config form.
    pub fn parse(config: &ScheduleConfig) -> Result<Self, Error> {
        let mut days = HashSet::new();
        for day in &config.days {
            days.insert(parse_day(day)?);
        }
        Ok(Self {
            days,
            start_minutes: parse_hhmm(&config.start)?,
            stop_minutes: parse_hhmm(&config.stop)?,
        })
    }

    /// Whether the window covers the given wall-clock instant.
    /// Independent of the service mode.
    pub fn should_be_up<T: Datelike + Timelike>(&self, now: &T) -> bool {
        if !self.days.is_empty() && !self.days.contains(&now.weekday()) {
            return false;
        }

        let minutes = now.hour() * 60 + now.minute();

        if self.start_minutes == self.stop_minutes {
            return true;
        }
        if self.start_minutes < self.stop_minutes {
            return minutes >= self.start_minutes && minutes < self.stop_minutes;
        }
        minutes >= self.start_minutes || minutes < self.stop_minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(weekday: Weekday, hour: u32, minute: u32) -> NaiveDateTime {
        // 2024-01-01 is a Monday
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let date = base + chrono::Days::new(weekday.num_days_from_monday() as u64);
        assert_eq!(date.weekday(), weekday);
        date.and_hms_opt(hour, minute, 0).unwrap()
    }

    fn schedule(days: &[&str], start: &str, stop: &str) -> ServiceSchedule {
        ServiceSchedule::parse(&ScheduleConfig {
            days: days.iter().map(|d| d.to_string()).collect(),
            start: start.to_string(),
            stop: stop.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("").unwrap(), 0);
        assert_eq!(parse_hhmm("00:00").unwrap(), 0);
        assert_eq!(parse_hhmm("09:30").unwrap(), 570);
        assert_eq!(parse_hhmm("23:59").unwrap(), 1439);
        assert!(parse_hhmm("24:00").is_err());
        assert!(parse_hhmm("12:60").is_err());
        assert!(parse_hhmm("noon").is_err());
        assert!(parse_hhmm("9").is_err());
    }

    #[test]
    fn test_parse_days() {
        let s = schedule(&["mon", "Fri", "SUN"], "", "");
        let expected: HashSet<Weekday> =
            [Weekday::Mon, Weekday::Fri, Weekday::Sun].into_iter().collect();
        assert_eq!(s.days, expected);
        assert!(ServiceSchedule::parse(&ScheduleConfig {
            days: vec!["funday".to_string()],
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_simple_window() {
        let s = schedule(&["mon"], "09:00", "17:00");
        assert!(s.should_be_up(&at(Weekday::Mon, 9, 0)));
        assert!(s.should_be_up(&at(Weekday::Mon, 12, 30)));
        assert!(!s.should_be_up(&at(Weekday::Mon, 17, 0)));
        assert!(!s.should_be_up(&at(Weekday::Mon, 8, 59)));
        // wrong day, inside the hours
        assert!(!s.should_be_up(&at(Weekday::Tue, 10, 0)));
    }

    #[test]
    fn test_wrap_around_window() {
        let s = schedule(&[], "22:00", "06:00");
        assert!(s.should_be_up(&at(Weekday::Wed, 23, 30)));
        assert!(s.should_be_up(&at(Weekday::Wed, 5, 59)));
        assert!(!s.should_be_up(&at(Weekday::Wed, 6, 0)));
        assert!(!s.should_be_up(&at(Weekday::Wed, 21, 59)));
        assert!(s.should_be_up(&at(Weekday::Wed, 22, 0)));
    }

    #[test]
    fn test_equal_start_stop_is_always_on() {
        let s = schedule(&[], "08:00", "08:00");
        assert!(s.should_be_up(&at(Weekday::Sat, 0, 0)));
        assert!(s.should_be_up(&at(Weekday::Sat, 8, 0)));
        assert!(s.should_be_up(&at(Weekday::Sat, 23, 59)));

        // but the day filter still applies
        let s = schedule(&["sat"], "08:00", "08:00");
        assert!(s.should_be_up(&at(Weekday::Sat, 3, 0)));
        assert!(!s.should_be_up(&at(Weekday::Sun, 3, 0)));
    }

    #[test]
    fn test_empty_days_means_any_day() {
        let s = schedule(&[], "10:00", "11:00");
        for weekday in [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ] {
            assert!(s.should_be_up(&at(weekday, 10, 30)));
        }
    }
}

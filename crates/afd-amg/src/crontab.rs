//! Crontab expressions for `time` jobs.
//!
//! Five fields: minute, hour, day of month, month, day of week (0 and 7
//! are Sunday). Each field takes `*`, numbers, `a-b` ranges, comma lists
//! and a `/step` suffix. As in cron, when both day fields are restricted a
//! day matches if either does.

use chrono::{DateTime, Datelike, Duration, Local, TimeZone, Timelike};

use crate::{AmgError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronSpec {
    minutes: u64,
    hours: u32,
    days: u32,
    months: u16,
    weekdays: u8,
    any_day: bool,
    any_weekday: bool,
}

fn parse_field(text: &str, min: u32, max: u32, spec: &str) -> Result<(u64, bool)> {
    let bad = |reason: String| AmgError::Crontab {
        spec: spec.to_string(),
        reason,
    };
    let number = |t: &str| -> Result<u32> {
        let n: u32 = t.parse().map_err(|_| bad(format!("`{}` is not a number", t)))?;
        if n < min || n > max {
            return Err(bad(format!("{} outside {}-{}", n, min, max)));
        }
        Ok(n)
    };

    let mut bits = 0u64;
    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| bad(format!("bad step `{}`", s)))?;
                if step == 0 {
                    return Err(bad("step of zero".into()));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (number(a)?, number(b)?);
            if a > b {
                return Err(bad(format!("empty range {}-{}", a, b)));
            }
            (a, b)
        } else {
            let n = number(range)?;
            (n, if step > 1 { max } else { n })
        };
        let mut v = lo;
        while v <= hi {
            bits |= 1 << v;
            v += step;
        }
    }
    Ok((bits, text == "*"))
}

impl CronSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(AmgError::Crontab {
                spec: spec.to_string(),
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
        }
        let (minutes, _) = parse_field(fields[0], 0, 59, spec)?;
        let (hours, _) = parse_field(fields[1], 0, 23, spec)?;
        let (days, any_day) = parse_field(fields[2], 1, 31, spec)?;
        let (months, _) = parse_field(fields[3], 1, 12, spec)?;
        let (mut weekdays, any_weekday) = parse_field(fields[4], 0, 7, spec)?;
        if weekdays & (1 << 7) != 0 {
            weekdays |= 1;
        }
        Ok(Self {
            minutes,
            hours: hours as u32,
            days: days as u32,
            months: months as u16,
            weekdays: (weekdays & 0x7f) as u8,
            any_day,
            any_weekday,
        })
    }

    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        let day_ok = self.days & (1 << t.day()) != 0;
        let weekday_ok = self.weekdays & (1 << t.weekday().num_days_from_sunday()) != 0;
        let day = match (self.any_day, self.any_weekday) {
            (true, true) => true,
            (true, false) => weekday_ok,
            (false, true) => day_ok,
            (false, false) => day_ok || weekday_ok,
        };
        self.minutes & (1 << t.minute()) != 0
            && self.hours & (1 << t.hour()) != 0
            && self.months & (1 << t.month()) != 0
            && day
    }

    /// Whether a matching minute lies in `(after, until]` (epoch seconds).
    /// Gaps longer than a day are treated as one day.
    pub fn due_between(&self, after: i64, until: i64) -> bool {
        let first = after.div_euclid(60) + 1;
        let last = until.div_euclid(60);
        let first = first.max(last - 24 * 60);
        let Some(start) = Local.timestamp_opt(first * 60, 0).single() else {
            return false;
        };
        (0..=(last - first).max(-1))
            .map(|i| start + Duration::minutes(i))
            .any(|t| self.matches(&t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_five_minutes() {
        let spec = CronSpec::parse("*/5 * * * *").unwrap();
        assert!(spec.matches(&at(2024, 3, 7, 9, 0)));
        assert!(spec.matches(&at(2024, 3, 7, 9, 55)));
        assert!(!spec.matches(&at(2024, 3, 7, 9, 3)));
    }

    #[test]
    fn test_lists_ranges_and_days() {
        // 2024-03-07 is a Thursday
        let spec = CronSpec::parse("30 8-10,14 * * 1-5").unwrap();
        assert!(spec.matches(&at(2024, 3, 7, 9, 30)));
        assert!(spec.matches(&at(2024, 3, 7, 14, 30)));
        assert!(!spec.matches(&at(2024, 3, 7, 12, 30)));
        assert!(!spec.matches(&at(2024, 3, 9, 9, 30)));

        let sunday = CronSpec::parse("0 0 * * 7").unwrap();
        assert!(sunday.matches(&at(2024, 3, 10, 0, 0)));

        // Either restricted day field may match
        let either = CronSpec::parse("0 0 1 * 0").unwrap();
        assert!(either.matches(&at(2024, 3, 1, 0, 0)));
        assert!(either.matches(&at(2024, 3, 10, 0, 0)));
        assert!(!either.matches(&at(2024, 3, 7, 0, 0)));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(CronSpec::parse("* * * *").is_err());
        assert!(CronSpec::parse("60 * * * *").is_err());
        assert!(CronSpec::parse("*/0 * * * *").is_err());
        assert!(CronSpec::parse("5-2 * * * *").is_err());
    }

    #[test]
    fn test_due_between() {
        let spec = CronSpec::parse("* * * * *").unwrap();
        assert!(spec.due_between(0, 60));
        assert!(!spec.due_between(60, 119));
    }
}

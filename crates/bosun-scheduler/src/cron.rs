//! Calendar recurrence for nightly schedulers.
//!
//! Fields follow cron conventions except that day-of-week counts from
//! Monday = 0. When both day-of-month and day-of-week are constrained, a day
//! matching either one qualifies. All times are UTC.

use bosun_core::{Error, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// One recurrence field: `*`, a single value, or a list of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CronField {
    Any(AnyMarker),
    One(u32),
    Many(Vec<u32>),
}

/// The `*` wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnyMarker {
    #[serde(rename = "*")]
    Star,
}

impl Default for CronField {
    fn default() -> Self {
        CronField::Any(AnyMarker::Star)
    }
}

impl CronField {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_any(&self) -> bool {
        matches!(self, CronField::Any(_))
    }

    fn contains(&self, value: u32) -> bool {
        match self {
            CronField::Any(_) => true,
            CronField::One(v) => *v == value,
            CronField::Many(vs) => vs.contains(&value),
        }
    }

    fn validate(&self, name: &str, min: u32, max: u32) -> Result<()> {
        let values: &[u32] = match self {
            CronField::Any(_) => return Ok(()),
            CronField::One(v) => std::slice::from_ref(v),
            CronField::Many(vs) => vs,
        };
        if values.is_empty() {
            return Err(Error::InvalidConfig(format!("{name} list is empty")));
        }
        if let Some(bad) = values.iter().find(|v| **v < min || **v > max) {
            return Err(Error::InvalidConfig(format!(
                "{name} value {bad} is outside {min}..={max}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Recurrence {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
}

/// Searching further than this means the recurrence can never match
/// (e.g. February 31st).
const SEARCH_YEARS: i32 = 8;

impl Recurrence {
    pub fn validate(&self) -> Result<()> {
        self.minute.validate("minute", 0, 59)?;
        self.hour.validate("hour", 0, 23)?;
        self.day_of_month.validate("day_of_month", 1, 31)?;
        self.month.validate("month", 1, 12)?;
        self.day_of_week.validate("day_of_week", 0, 6)?;
        Ok(())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_monday());
        if !self.day_of_month.is_any() && !self.day_of_week.is_any() {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// The first matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?
            + Duration::minutes(1);
        let limit = start.year() + SEARCH_YEARS;

        let mut date = start.date_naive();
        let mut first_day = true;
        while date.year() <= limit {
            if self.month.contains(date.month()) && self.day_matches(date) {
                let (from_hour, from_minute) = if first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                for hour in from_hour..24 {
                    if !self.hour.contains(hour) {
                        continue;
                    }
                    let min_start = if hour == from_hour { from_minute } else { 0 };
                    if let Some(minute) = (min_start..60).find(|m| self.minute.contains(*m)) {
                        let naive = date.and_hms_opt(hour, minute, 0)?;
                        return Some(Utc.from_utc_datetime(&naive));
                    }
                }
            }
            date = date.succ_opt()?;
            first_day = false;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_at_fixed_time() {
        let r = Recurrence {
            minute: CronField::One(30),
            hour: CronField::One(3),
            ..Default::default()
        };
        assert_eq!(r.next_after(at(2024, 5, 1, 2, 0)), Some(at(2024, 5, 1, 3, 30)));
        assert_eq!(r.next_after(at(2024, 5, 1, 3, 30)), Some(at(2024, 5, 2, 3, 30)));
    }

    #[test]
    fn test_every_minute_by_default() {
        let r = Recurrence::default();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 42).unwrap();
        assert_eq!(r.next_after(t), Some(at(2024, 5, 1, 10, 16)));
    }

    #[test]
    fn test_dom_and_dow_union() {
        // 15th of the month OR any Monday.
        let r = Recurrence {
            minute: CronField::One(0),
            hour: CronField::One(0),
            day_of_month: CronField::One(15),
            day_of_week: CronField::One(0),
            ..Default::default()
        };
        // 2024-05-01 is a Wednesday; the next Monday is the 6th.
        assert_eq!(r.next_after(at(2024, 5, 1, 0, 0)), Some(at(2024, 5, 6, 0, 0)));
        // 2024-05-15 is a Wednesday but matches on day of month.
        assert_eq!(r.next_after(at(2024, 5, 13, 0, 0)), Some(at(2024, 5, 15, 0, 0)));
    }

    #[test]
    fn test_dow_alone_is_intersection_with_any_dom() {
        let r = Recurrence {
            minute: CronField::One(0),
            hour: CronField::One(12),
            day_of_week: CronField::Many(vec![5, 6]),
            ..Default::default()
        };
        // 2024-05-04 is a Saturday.
        assert_eq!(r.next_after(at(2024, 5, 1, 0, 0)), Some(at(2024, 5, 4, 12, 0)));
    }

    #[test]
    fn test_impossible_date_returns_none() {
        let r = Recurrence {
            day_of_month: CronField::One(31),
            month: CronField::One(2),
            ..Default::default()
        };
        assert_eq!(r.next_after(at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_validation() {
        let bad = Recurrence {
            hour: CronField::One(24),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let empty = Recurrence {
            minute: CronField::Many(vec![]),
            ..Default::default()
        };
        assert!(empty.validate().is_err());
        assert!(Recurrence::default().validate().is_ok());
    }

    #[test]
    fn test_yaml_fields() {
        let r: Recurrence =
            serde_yaml::from_str("minute: 0\nhour: [1, 13]\nday_of_week: '*'").unwrap();
        assert_eq!(r.minute, CronField::One(0));
        assert_eq!(r.hour, CronField::Many(vec![1, 13]));
        assert!(r.day_of_week.is_any());
    }
}

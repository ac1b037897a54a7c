//! Lightweight cron expression parser and trigger evaluation.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Fields: *, */N, N, A-B, A-B/N, lists ("0,15,30"), month/day names.
//! Descriptors: @yearly @annually @monthly @weekly @daily @midnight @hourly,
//! and "@every 1h30m".
//! Example: "0 8 * * 1-5" = weekdays at 8:00
//!
//! Timezones are fixed offsets ("UTC", "+07:00", "UTC-5"); results are UTC.

use agentloom_core::error::{LoomError, Result};
use agentloom_core::types::TriggerType;
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};

/// How far ahead a cron search may look before giving up (e.g. "0 0 30 2 *").
const MAX_SEARCH_DAYS: i64 = 366 * 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// A parsed schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Fields(CronFields),
    Every(Duration),
}

/// Bitmask form of the five cron fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CronFields {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if let Some(rest) = expression.strip_prefix("@every") {
            let every = parse_every(rest.trim())?;
            return Ok(Schedule::Every(every));
        }
        let expanded = match expression.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
            "@monthly" => "0 0 1 * *".to_string(),
            "@weekly" => "0 0 * * 0".to_string(),
            "@daily" | "@midnight" => "0 0 * * *".to_string(),
            "@hourly" => "0 * * * *".to_string(),
            other if other.starts_with('@') => {
                return Err(LoomError::Trigger(format!("unknown descriptor '{expression}'")));
            }
            _ => expression.to_string(),
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(LoomError::Trigger(format!(
                "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }

        let minutes = parse_field(parts[0], 0, 59, &[])?;
        let hours = parse_field(parts[1], 0, 23, &[])?;
        let days_of_month = parse_field(parts[2], 1, 31, &[])?;
        let months = parse_field(parts[3], 1, 12, &MONTH_NAMES)?;
        // 7 is an alias for Sunday.
        let mut dow = parse_field(parts[4], 0, 7, &DAY_NAMES)?;
        if dow & (1 << 7) != 0 {
            dow |= 1;
        }

        Ok(Schedule::Fields(CronFields {
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: (dow & 0x7f) as u8,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        }))
    }

    /// First fire time strictly after `after`, evaluated in `zone`.
    pub fn next_after(&self, after: DateTime<Utc>, zone: FixedOffset) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(every) => after.checked_add_signed(*every),
            Schedule::Fields(fields) => {
                let local = after.with_timezone(&zone).naive_local();
                let found = fields.next_local(local)?;
                zone.from_local_datetime(&found)
                    .single()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}

impl CronFields {
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn next_local(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        // Zero out seconds and step to the next whole minute.
        let mut candidate = after
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;
        let limit = candidate.checked_add_signed(Duration::days(MAX_SEARCH_DAYS))?;

        while candidate <= limit {
            let date = candidate.date();
            if self.months & (1 << date.month()) == 0 {
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                candidate = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(date) {
                candidate = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if self.hours & (1 << candidate.hour()) == 0 {
                candidate = candidate
                    .with_minute(0)?
                    .checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if self.minutes & (1 << candidate.minute()) == 0 {
                candidate = candidate.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return Some(candidate);
        }
        None
    }
}

/// Parse a cron field into a bitmask of matching values.
fn parse_field(field: &str, min: u32, max: u32, names: &[&str]) -> Result<u64> {
    let invalid = || LoomError::Trigger(format!("invalid cron field '{field}'"));
    let mut mask = 0u64;

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid());
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, names)?, parse_value(b, min, names)?)
        } else {
            let value = parse_value(range, min, names)?;
            // "5/15" means 5 through max, every 15.
            if step.is_some() { (value, max) } else { (value, value) }
        };

        if start < min || end > max || start > end {
            return Err(invalid());
        }
        for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
            mask |= 1 << value;
        }
    }
    Ok(mask)
}

fn parse_value(raw: &str, offset: u32, names: &[&str]) -> Result<u32> {
    let lower = raw.trim().to_ascii_lowercase();
    if let Some(index) = names.iter().position(|n| *n == lower) {
        return Ok(index as u32 + offset);
    }
    lower
        .parse()
        .map_err(|_| LoomError::Trigger(format!("invalid cron value '{raw}'")))
}

/// Parse "90s", "15m", "2h", "1h30m" into a duration.
pub fn parse_every(raw: &str) -> Result<Duration> {
    let invalid = || LoomError::Trigger(format!("invalid duration '{raw}'"));
    let mut total = Duration::zero();
    let mut digits = String::new();

    for ch in raw.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let part = match ch {
            's' => Duration::try_seconds(n),
            'm' => Duration::try_minutes(n),
            'h' => Duration::try_hours(n),
            'd' => Duration::try_days(n),
            _ => return Err(invalid()),
        };
        total = part
            .and_then(|part| total.checked_add(&part))
            .ok_or_else(|| LoomError::Trigger(format!("duration '{raw}' is too large")))?;
    }
    if !digits.is_empty() || total <= Duration::zero() {
        return Err(invalid());
    }
    Ok(total)
}

/// Parse an objective timezone: "UTC", "Z", "+07:00", "-0530", "UTC+7".
pub fn parse_timezone(raw: &str) -> Result<FixedOffset> {
    let invalid = || LoomError::Trigger(format!("invalid timezone '{raw}'"));
    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();
    let rest = match upper.as_str() {
        "" | "UTC" | "Z" | "GMT" => return FixedOffset::east_opt(0).ok_or_else(invalid),
        other => other
            .strip_prefix("UTC")
            .or_else(|| other.strip_prefix("GMT"))
            .unwrap_or(other),
    };

    let (sign, digits) = match rest.chars().next() {
        Some('+') => (1, &rest[1..]),
        Some('-') => (-1, &rest[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => digits.split_at(2),
        None => (digits, "0"),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Compute the next run for a trigger strictly after `after`.
///
/// Event triggers never become time-due and return `None`, as does a `Once`
/// trigger whose instant has passed.
pub fn next_run_after(
    trigger: &TriggerType,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        TriggerType::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(LoomError::Trigger("interval must be at least 1 second".into()));
            }
            let overflow =
                || LoomError::Trigger(format!("interval of {every_secs}s is out of range"));
            let every = i64::try_from(*every_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .ok_or_else(overflow)?;
            after
                .checked_add_signed(every)
                .map(Some)
                .ok_or_else(overflow)
        }
        TriggerType::Cron { expression } => {
            let zone = parse_timezone(timezone)?;
            let schedule = Schedule::parse(expression)?;
            schedule
                .next_after(after, zone)
                .map(Some)
                .ok_or_else(|| LoomError::Trigger(format!("cron '{expression}' never fires")))
        }
        TriggerType::Once { at } => Ok((*at > after).then_some(*at)),
        TriggerType::Event { .. } => Ok(None),
    }
}

/// First due time for a freshly created or resumed objective.
/// A `Once` trigger keeps its instant even when it is already in the past.
pub fn initial_next_run(
    trigger: &TriggerType,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        TriggerType::Once { at } => Ok(Some(*at)),
        other => next_run_after(other, timezone, now),
    }
}

// pgbackup/src/schedule/next_fire.rs
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::errors::{EngineError, Result};

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// A cron expression bound to the IANA time zone it is evaluated in.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    tz: Tz,
}

impl CronSchedule {
    /// Accepts standard five-field expressions and the six-field form with
    /// a leading seconds column.
    pub fn parse(expression: &str, time_zone: &str) -> Result<Self> {
        let tz = parse_time_zone(time_zone)?;
        let invalid = |reason: String| {
            EngineError::InvalidConfig(format!("invalid cron expression {expression:?}: {reason}"))
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [minute, hour, day, month, weekday] => format!(
                "0 {minute} {hour} {day} {month} {}",
                weekday_names(weekday)
            ),
            [second, minute, hour, day, month, weekday] => format!(
                "{second} {minute} {hour} {day} {month} {}",
                weekday_names(weekday)
            ),
            _ => return Err(invalid(format!("expected 5 or 6 fields, got {}", fields.len()))),
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self { schedule, tz })
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let local = now.with_timezone(&self.tz);
        self.schedule
            .after(&local)
            .next()
            .map(|next| next.with_timezone(&Utc))
            .ok_or_else(|| EngineError::InvalidConfig("cron expression never fires".to_string()))
    }
}

/// Rewrites numeric weekdays (0 or 7 = Sunday) as names, since the parser
/// numbers days from 1. Ranges ending at 7 are spelled out because
/// `X-SUN` would run backwards.
fn weekday_names(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (part, None),
            };
            if let Some(days) = range_ending_on_seven(base, step) {
                return days;
            }
            let base = base
                .split('-')
                .map(|day| match day.parse::<usize>() {
                    Ok(n) if n < WEEKDAYS.len() => WEEKDAYS[n].to_string(),
                    _ => day.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{base}/{step}"),
                None => base,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// `a-7` or `a-7/n` as a list of day names, Sunday last.
fn range_ending_on_seven(base: &str, step: Option<&str>) -> Option<String> {
    let (start, end) = base.split_once('-')?;
    let start = start.parse::<usize>().ok()?;
    if end.parse::<usize>().ok()? != 7 || start > 7 {
        return None;
    }
    let step = match step {
        Some(step) => step.parse::<usize>().ok().filter(|n| *n > 0)?,
        None => 1,
    };
    let mut names: Vec<&str> = Vec::new();
    for day in (start..=7).step_by(step) {
        let name = WEEKDAYS[day];
        if !names.contains(&name) {
            names.push(name);
        }
    }
    Some(names.join(","))
}

pub fn parse_time_zone(time_zone: &str) -> Result<Tz> {
    time_zone
        .trim()
        .parse::<Tz>()
        .map_err(|e| EngineError::InvalidConfig(format!("unknown time zone {time_zone:?}: {e}")))
}

/// `(expression, time zone, now) -> next fire time`.
pub fn next_fire_time(expression: &str, time_zone: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronSchedule::parse(expression, time_zone)?.next_after(now)
}

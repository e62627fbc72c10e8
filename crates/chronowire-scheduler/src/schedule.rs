use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::{
    error::{Result, SchedulerError},
    types::{Chronology, Schedule},
};

/// Parse a user-supplied schedule string for the given chronology.
///
/// One-shot jobs accept an RFC 3339 timestamp or a human interval counted
/// from `now` ("5 seconds", "in 2 minutes", "1h30m"). Recurring jobs accept
/// a human interval ("every 10 minutes") or a cron expression with 5, 6 or 7
/// fields.
pub fn parse_schedule(chronology: Chronology, input: &str, now: DateTime<Utc>) -> Result<Schedule> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SchedulerError::InvalidSchedule("empty schedule".to_string()));
    }

    match chronology {
        Chronology::OneShot => {
            if let Ok(at) = DateTime::parse_from_rfc3339(input) {
                return Ok(Schedule::Once {
                    at: at.with_timezone(&Utc),
                });
            }
            let delay = parse_interval(input).ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!(
                    "'{input}' is neither a timestamp nor an interval"
                ))
            })?;
            let at = now.checked_add_signed(delay).ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!("'{input}' is out of range"))
            })?;
            Ok(Schedule::Once { at })
        }
        Chronology::Recurring => {
            if let Some(every) = parse_interval(input) {
                // Sub-second remainders are dropped.
                let every_secs = every.num_milliseconds() / 1000;
                if every_secs < 1 {
                    return Err(SchedulerError::InvalidSchedule(format!(
                        "interval '{input}' is shorter than one second"
                    )));
                }
                return Ok(Schedule::Interval {
                    every_secs: every_secs as u64,
                });
            }
            let expression = normalize_cron(input)?;
            Ok(Schedule::Cron { expression })
        }
    }
}

/// Check that `schedule` is well-formed and fits `chronology`.
pub fn validate(schedule: &Schedule, chronology: Chronology) -> Result<()> {
    let invalid = |msg: String| Err(SchedulerError::InvalidSchedule(msg));
    match (chronology, schedule) {
        (Chronology::OneShot, Schedule::Once { .. }) => Ok(()),
        (Chronology::OneShot, other) => invalid(format!(
            "one-shot jobs need an absolute time, got {other:?}"
        )),
        (Chronology::Recurring, Schedule::Once { .. }) => {
            invalid("recurring jobs need an interval or cron expression".to_string())
        }
        (Chronology::Recurring, Schedule::Interval { every_secs }) => {
            if *every_secs == 0 {
                invalid("interval must be at least one second".to_string())
            } else {
                Ok(())
            }
        }
        (Chronology::Recurring, Schedule::Daily { hour, minute }) => check_clock(*hour, *minute),
        (Chronology::Recurring, Schedule::Weekly { day, hour, minute }) => {
            if *day > 6 {
                return invalid(format!("weekday {day} out of range 0..=6"));
            }
            check_clock(*hour, *minute)
        }
        (Chronology::Recurring, Schedule::Cron { expression }) => {
            cron_schedule(expression).map(|_| ())
        }
    }
}

fn check_clock(hour: u8, minute: u8) -> Result<()> {
    if hour > 23 || minute > 59 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "time {hour:02}:{minute:02} out of range"
        )));
    }
    Ok(())
}

/// Due time of the first occurrence of a freshly scheduled job.
///
/// A `Once` instant in the past is due immediately. Recurring schedules fire
/// first at their first occurrence strictly after `now`.
pub fn first_due(schedule: &Schedule, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => Ok(*at),
        other => occurrence_after(other, now).ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("{other:?} has no future occurrence"))
        }),
    }
}

/// Next due time after an occurrence that was scheduled for `previous`.
///
/// Intervals step exactly one period from `previous`, even when that instant
/// has already passed, so a run that finishes late neither drifts nor drops
/// the following occurrence. `None` means the schedule is exhausted.
pub fn next_due(schedule: &Schedule, previous: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { .. } => None,
        other => occurrence_after(other, previous),
    }
}

/// First occurrence strictly after `now` on the grid anchored at `previous`.
///
/// Used when an occurrence is dropped outright (an interrupted run that is
/// not retried), so no missed occurrence is replayed.
pub fn catch_up_due(
    schedule: &Schedule,
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { .. } => None,
        Schedule::Interval { .. } => next_due(
            schedule,
            last_missed(schedule, previous, now).unwrap_or(previous),
        ),
        other => occurrence_after(other, previous.max(now)),
    }
}

/// Latest grid point at or before `now` for an interval job due at `due`,
/// if at least one whole period has gone by since `due`.
///
/// Calendar and cron schedules return `None`.
pub fn last_missed(
    schedule: &Schedule,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let Schedule::Interval { every_secs } = schedule else {
        return None;
    };
    let every_ms = i64::try_from(*every_secs).ok()?.checked_mul(1000)?;
    if every_ms <= 0 {
        return None;
    }
    let steps = (now - due).num_milliseconds() / every_ms;
    if steps < 1 {
        return None;
    }
    due.checked_add_signed(Duration::try_milliseconds(every_ms.checked_mul(steps)?)?)
}

/// First occurrence of a recurring schedule strictly after `from`.
fn occurrence_after(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => (*at > from).then_some(*at),

        Schedule::Interval { every_secs } => {
            from.checked_add_signed(Duration::try_seconds(i64::try_from(*every_secs).ok()?)?)
        }

        Schedule::Daily { hour, minute } => {
            let candidate = at_clock(from, *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                // Today's window has passed; advance to tomorrow.
                candidate.checked_add_signed(Duration::days(1))
            }
        }

        Schedule::Weekly { day, hour, minute } => {
            // `day` follows ISO weekday numbering: 0=Monday … 6=Sunday,
            // which matches chrono's `num_days_from_monday`.
            let today = from.weekday().num_days_from_monday() as i64;
            let target = (*day as i64).clamp(0, 6);
            let days_ahead = (target - today).rem_euclid(7);
            let target_day = from.checked_add_signed(Duration::days(days_ahead))?;
            let candidate = at_clock(target_day, *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                // Same weekday but the time already passed.
                candidate.checked_add_signed(Duration::days(7))
            }
        }

        Schedule::Cron { expression } => cron_schedule(expression).ok()?.after(&from).next(),
    }
}

fn at_clock(day: DateTime<Utc>, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        day.year(),
        day.month(),
        day.day(),
        hour as u32,
        minute as u32,
        0,
    )
    .single()
}

/// Parse a cron expression. Classic 5-field crontab lines get a leading
/// seconds field of `0`.
fn cron_schedule(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression)
        .map_err(|e| SchedulerError::InvalidSchedule(format!("bad cron '{expression}': {e}")))
}

fn normalize_cron(input: &str) -> Result<String> {
    let fields = input.split_whitespace().count();
    let expression = match fields {
        5 => format!("0 {}", input.split_whitespace().collect::<Vec<_>>().join(" ")),
        6 | 7 => input.split_whitespace().collect::<Vec<_>>().join(" "),
        _ => {
            return Err(SchedulerError::InvalidSchedule(format!(
                "'{input}' is neither an interval nor a cron expression"
            )))
        }
    };
    cron_schedule(&expression)?;
    Ok(expression)
}

/// Parse a human interval such as `"5 seconds"`, `"in 2 minutes"`,
/// `"every 1 hour and 30 minutes"` or `"1h30m"`.
///
/// A bare number without a unit is rejected.
pub fn parse_interval(input: &str) -> Option<Duration> {
    let lower = input.trim().to_ascii_lowercase();
    let mut rest = lower.as_str();
    for prefix in ["in ", "every "] {
        if let Some(r) = rest.strip_prefix(prefix) {
            rest = r;
            break;
        }
    }

    let mut total_ms = 0f64;
    let mut terms = 0;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if let Some(r) = rest.strip_prefix("and ") {
            rest = r;
            continue;
        }
        if rest.is_empty() {
            break;
        }

        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let amount: f64 = rest[..num_end].parse().ok()?;
        rest = rest[num_end..].trim_start();

        let unit_end = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let factor = unit_millis(&rest[..unit_end])?;
        rest = &rest[unit_end..];

        total_ms += amount * factor;
        terms += 1;
    }

    if terms == 0 || !total_ms.is_finite() || total_ms < 1.0 || total_ms >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(total_ms.round() as i64)
}

fn unit_millis(unit: &str) -> Option<f64> {
    let ms = match unit {
        "ms" | "msec" | "millisecond" | "milliseconds" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
        "d" | "day" | "days" => 86_400_000.0,
        "w" | "week" | "weeks" => 604_800_000.0,
        _ => return None,
    };
    Some(ms)
}

impl Schedule {
    /// Parse `input` for `chronology`, relative to the current time.
    pub fn parse(chronology: Chronology, input: &str) -> Result<Schedule> {
        parse_schedule(chronology, input, Utc::now())
    }
}

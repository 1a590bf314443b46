//! Stateless gate: promotion is only allowed inside declared day/hour
//! windows, evaluated in the window's declared timezone. Safe to call
//! repeatedly; no persisted state.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};

use rudder_core::{Constraint, DeliveryArtifact, DeliveryConfig, Environment, TimeWindow};

use crate::ConstraintEvaluator;

pub const CONSTRAINT_TYPE: &str = "allowed-times";

#[derive(Default)]
pub struct AllowedTimesEvaluator;

impl AllowedTimesEvaluator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConstraintEvaluator for AllowedTimesEvaluator {
    fn constraint_type(&self) -> &'static str {
        CONSTRAINT_TYPE
    }

    async fn can_promote(
        &self,
        _artifact: &DeliveryArtifact,
        _version: &str,
        _config: &DeliveryConfig,
        environment: &Environment,
    ) -> Result<bool> {
        match environment.constraint(CONSTRAINT_TYPE) {
            Some(Constraint::AllowedTimes { windows, tz }) => {
                in_any_window(windows, tz.as_deref(), Utc::now())
            }
            _ => Ok(true),
        }
    }
}

/// `tz` is `utc` (default) or a fixed offset such as `+02:00`.
fn in_any_window(windows: &[TimeWindow], tz: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
    let local: DateTime<FixedOffset> = match tz {
        Some(s) if !s.eq_ignore_ascii_case("utc") => {
            let offset: FixedOffset = s.parse().with_context(|| format!("invalid timezone offset {s:?}"))?;
            now.with_timezone(&offset)
        }
        _ => now.into(),
    };
    let day = local.weekday().num_days_from_monday() as usize;
    let hour = local.hour() as usize;
    for window in windows {
        if parse_days(&window.days)?[day] && parse_hours(&window.hours)?[hour] {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Comma-separated day names, `weekdays`/`weekends` aliases, or ranges
/// like `monday-friday`. Ranges may wrap past the weekend.
fn parse_days(spec: &str) -> Result<[bool; 7]> {
    let mut days = [false; 7];
    for token in spec.split(',') {
        let token = token.trim().to_ascii_lowercase();
        match token.as_str() {
            "weekdays" => days[..5].fill(true),
            "weekends" => days[5..].fill(true),
            _ => {
                if let Some((start, end)) = token.split_once('-') {
                    let start = day_index(start.trim())?;
                    let end = day_index(end.trim())?;
                    let mut d = start;
                    loop {
                        days[d] = true;
                        if d == end {
                            break;
                        }
                        d = (d + 1) % 7;
                    }
                } else {
                    days[day_index(&token)?] = true;
                }
            }
        }
    }
    Ok(days)
}

fn day_index(name: &str) -> Result<usize> {
    Ok(match name {
        "monday" | "mon" => 0,
        "tuesday" | "tue" => 1,
        "wednesday" | "wed" => 2,
        "thursday" | "thu" => 3,
        "friday" | "fri" => 4,
        "saturday" | "sat" => 5,
        "sunday" | "sun" => 6,
        other => bail!("unrecognized day {other:?}"),
    })
}

/// Comma-separated hours or end-exclusive ranges like `9-17`. A range may
/// wrap past midnight (`22-6`).
fn parse_hours(spec: &str) -> Result<[bool; 24]> {
    let mut hours = [false; 24];
    for token in spec.split(',') {
        let token = token.trim();
        if let Some((start, end)) = token.split_once('-') {
            let start = hour_value(start.trim())?;
            let end = hour_value(end.trim())?;
            if start < end {
                hours[start..end].fill(true);
            } else {
                hours[start..].fill(true);
                hours[..end].fill(true);
            }
        } else {
            hours[hour_value(token)?] = true;
        }
    }
    Ok(hours)
}

fn hour_value(s: &str) -> Result<usize> {
    let h: usize = s.parse().with_context(|| format!("invalid hour {s:?}"))?;
    if h > 23 {
        bail!("hour {h} out of range");
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(days: &str, hours: &str) -> TimeWindow {
        TimeWindow { days: days.into(), hours: hours.into() }
    }

    // 2026-08-26 was a Wednesday.
    fn wednesday_noon_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 26, 12, 0, 0).unwrap()
    }

    #[test]
    fn weekday_business_hours_match() {
        let windows = vec![window("monday-friday", "9-17")];
        assert!(in_any_window(&windows, None, wednesday_noon_utc()).unwrap());
    }

    #[test]
    fn range_end_is_exclusive() {
        let windows = vec![window("wednesday", "9-12")];
        assert!(!in_any_window(&windows, None, wednesday_noon_utc()).unwrap());
    }

    #[test]
    fn offset_shifts_the_local_hour() {
        // noon UTC is 17:00 at +05:00, outside a 9-17 window
        let windows = vec![window("weekdays", "9-17")];
        assert!(!in_any_window(&windows, Some("+05:00"), wednesday_noon_utc()).unwrap());
        assert!(in_any_window(&windows, Some("+04:00"), wednesday_noon_utc()).unwrap());
    }

    #[test]
    fn wrapping_ranges_cover_both_sides() {
        let hours = parse_hours("22-6").unwrap();
        assert!(hours[23] && hours[5] && !hours[6] && !hours[12]);

        let days = parse_days("friday-monday").unwrap();
        assert!(days[4] && days[5] && days[6] && days[0] && !days[2]);
    }

    #[test]
    fn weekend_alias_and_lists() {
        let days = parse_days("weekends,wed").unwrap();
        assert!(days[5] && days[6] && days[2] && !days[0]);
        assert!(parse_days("someday").is_err());
        assert!(parse_hours("25").is_err());
    }
}

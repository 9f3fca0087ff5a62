//! CF time coordinate decoding.
//!
//! Understands `"<unit> since <reference>"` strings with second, minute,
//! hour or day units on the standard (proleptic) Gregorian calendar.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

/// Parsed CF time units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CfTimeUnits {
    /// Length of one unit in seconds.
    pub seconds_per_unit: f64,
    pub reference: DateTime<Utc>,
}

impl CfTimeUnits {
    pub fn parse(units: &str, calendar: Option<&str>) -> Result<Self> {
        if let Some(calendar) = calendar {
            match calendar.to_lowercase().as_str() {
                "standard" | "gregorian" | "proleptic_gregorian" => {}
                other => bail!("Unsupported calendar: {}", other),
            }
        }

        let (unit, reference) = units
            .split_once(" since ")
            .with_context(|| format!("Time units lack 'since': {:?}", units))?;

        let seconds_per_unit = match unit.trim().to_lowercase().as_str() {
            "seconds" | "second" | "secs" | "sec" | "s" => 1.0,
            "minutes" | "minute" | "mins" | "min" => 60.0,
            "hours" | "hour" | "hrs" | "hr" | "h" => 3600.0,
            "days" | "day" | "d" => 86_400.0,
            other => bail!("Unsupported time unit: {}", other),
        };

        Ok(Self {
            seconds_per_unit,
            reference: parse_reference(reference.trim())?,
        })
    }

    pub fn to_datetime(&self, value: f64) -> Result<DateTime<Utc>> {
        if !value.is_finite() {
            bail!("Non-finite time value");
        }
        let millis = (value * self.seconds_per_unit * 1000.0).round() as i64;
        self.reference
            .checked_add_signed(Duration::milliseconds(millis))
            .with_context(|| format!("Time value {} overflows", value))
    }

    /// Inverse of [`to_datetime`](Self::to_datetime).
    pub fn from_datetime(&self, time: &DateTime<Utc>) -> f64 {
        (*time - self.reference).num_milliseconds() as f64 / 1000.0 / self.seconds_per_unit
    }
}

fn parse_reference(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim_end_matches('Z').trim_end_matches(" UTC").trim();

    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    for format in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(dt.and_utc());
        }
    }

    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .with_context(|| format!("Cannot parse reference time {:?}", text))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .context("Invalid midnight")?
        .and_utc())
}

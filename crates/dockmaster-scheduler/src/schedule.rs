//! Recurrence specs and next-run evaluation.
//!
//! All arithmetic is done on the local wall clock (`NaiveDateTime`): a job
//! scheduled "daily at 03:30" fires when the host clock reads 03:30.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::{config_err, Result};

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    /// Every day at `time`.
    Daily { time: NaiveTime },
    /// Every `weekday` at `time`.
    Weekly { weekday: Weekday, time: NaiveTime },
    /// On day-of-month `day` at `time`. Months without that day are skipped.
    Monthly { day: u32, time: NaiveTime },
    /// Every hour at `minute` past.
    Hourly { minute: u32 },
}

impl Recurrence {
    /// Parse the legacy `"HH:MM"` / `"HH:MM:SS"` form, sugar for `Daily`.
    pub fn parse_legacy(s: &str) -> Result<Self> {
        Ok(Recurrence::Daily {
            time: parse_time(s)?,
        })
    }

    /// Parse either a legacy string or a structured `{"type": …}` object.
    ///
    /// Omitted fields default to `time = "00:00"`, `weekday = "monday"`,
    /// `day = 1`, `minute = 0`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = match value {
            Value::String(s) => return Self::parse_legacy(s),
            Value::Object(map) => map,
            other => return Err(config_err(format!("invalid recurrence spec: {other}"))),
        };

        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| config_err("recurrence spec is missing a \"type\""))?;

        match kind {
            "daily" => Ok(Recurrence::Daily {
                time: time_field(map)?,
            }),
            "weekly" => {
                let weekday = match map.get("weekday") {
                    None => Weekday::Mon,
                    Some(Value::String(s)) => s
                        .parse::<Weekday>()
                        .map_err(|_| config_err(format!("invalid weekday: {s}")))?,
                    Some(other) => return Err(config_err(format!("invalid weekday: {other}"))),
                };
                Ok(Recurrence::Weekly {
                    weekday,
                    time: time_field(map)?,
                })
            }
            "monthly" => {
                let day = uint_field(map, "day", 1)?;
                if !(1..=31).contains(&day) {
                    return Err(config_err(format!("day of month out of range: {day}")));
                }
                Ok(Recurrence::Monthly {
                    day,
                    time: time_field(map)?,
                })
            }
            "hourly" => {
                let minute = uint_field(map, "minute", 0)?;
                if minute > 59 {
                    return Err(config_err(format!("minute out of range: {minute}")));
                }
                Ok(Recurrence::Hourly { minute })
            }
            other => Err(config_err(format!("unsupported recurrence type: {other}"))),
        }
    }

    /// Structured JSON form, as persisted under `schedule.<task>.cron`.
    pub fn to_value(&self) -> Value {
        match self {
            Recurrence::Daily { time } => json!({"type": "daily", "time": format_time(*time)}),
            Recurrence::Weekly { weekday, time } => json!({
                "type": "weekly",
                "weekday": weekday_name(*weekday),
                "time": format_time(*time),
            }),
            Recurrence::Monthly { day, time } => json!({
                "type": "monthly",
                "day": day,
                "time": format_time(*time),
            }),
            Recurrence::Hourly { minute } => json!({"type": "hourly", "minute": minute}),
        }
    }

    /// Next table checkpoint strictly after `now`.
    ///
    /// Monthly jobs are checked daily at `time`; whether a checkpoint actually
    /// runs the body is decided by [`Recurrence::fires_on`].
    pub fn next_run(&self, now: NaiveDateTime) -> NaiveDateTime {
        match *self {
            Recurrence::Daily { time } | Recurrence::Monthly { time, .. } => {
                let candidate = now.date().and_time(time);
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Recurrence::Weekly { weekday, time } => {
                let days_ahead = (weekday.num_days_from_monday() as i64
                    - now.weekday().num_days_from_monday() as i64)
                    .rem_euclid(7);
                let candidate = (now.date() + Duration::days(days_ahead)).and_time(time);
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::days(7)
                }
            }
            Recurrence::Hourly { minute } => {
                let top = now
                    .date()
                    .and_time(NaiveTime::from_hms_opt(now.hour(), 0, 0).unwrap_or(NaiveTime::MIN));
                let candidate = top + Duration::minutes(minute as i64);
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::hours(1)
                }
            }
        }
    }

    /// Whether a checkpoint reached at `at` should invoke the job body.
    pub fn fires_on(&self, at: NaiveDateTime) -> bool {
        match *self {
            Recurrence::Monthly { day, .. } => at.day() == day,
            _ => true,
        }
    }

    /// The next instant the job body will really run, for display and
    /// persistence. Differs from [`Recurrence::next_run`] only for monthly
    /// specs, where it skips idle daily checkpoints.
    pub fn next_fire(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match *self {
            Recurrence::Monthly { day, time } => {
                let (mut year, mut month) = (now.year(), now.month());
                // 31 only recurs in 7 of 12 months, so a year is always enough;
                // 13 iterations cover starting mid-month.
                for _ in 0..13 {
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                        let candidate = date.and_time(time);
                        if candidate > now {
                            return Some(candidate);
                        }
                    }
                    if month == 12 {
                        year += 1;
                        month = 1;
                    } else {
                        month += 1;
                    }
                }
                None
            }
            _ => Some(self.next_run(now)),
        }
    }

    /// Short human description, e.g. `every monday at 03:30`.
    pub fn describe(&self) -> String {
        match self {
            Recurrence::Daily { time } => format!("daily at {}", format_time(*time)),
            Recurrence::Weekly { weekday, time } => {
                format!("every {} at {}", weekday_name(*weekday), format_time(*time))
            }
            Recurrence::Monthly { day, time } => {
                format!("monthly on day {day} at {}", format_time(*time))
            }
            Recurrence::Hourly { minute } => format!("hourly at :{minute:02}"),
        }
    }
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

impl Serialize for Recurrence {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Recurrence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Recurrence::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Parse `HH:MM` or `HH:MM:SS` (hours 0–23, minutes/seconds 0–59).
///
/// Hours may be one or two digits; minutes and seconds are always two.
pub fn parse_time(s: &str) -> Result<NaiveTime> {
    let invalid = || config_err(format!("invalid time format: {s:?}, expected HH:MM"));
    let parts: Vec<&str> = s.trim().split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(invalid());
    }

    let digits = |p: &str, min_len: usize, max_len: usize| -> Option<u32> {
        if p.len() < min_len || p.len() > max_len || !p.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        p.parse().ok()
    };

    let hour = digits(parts[0], 1, 2).filter(|h| *h <= 23).ok_or_else(invalid)?;
    let minute = digits(parts[1], 2, 2).filter(|m| *m <= 59).ok_or_else(invalid)?;
    let second = match parts.get(2) {
        Some(p) => digits(p, 2, 2).filter(|s| *s <= 59).ok_or_else(invalid)?,
        None => 0,
    };
    NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(invalid)
}

/// `HH:MM`, or `HH:MM:SS` when seconds are set.
pub fn format_time(time: NaiveTime) -> String {
    if time.second() == 0 {
        time.format("%H:%M").to_string()
    } else {
        time.format("%H:%M:%S").to_string()
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn time_field(map: &Map<String, Value>) -> Result<NaiveTime> {
    match map.get("time") {
        None => Ok(NaiveTime::MIN),
        Some(Value::String(s)) => parse_time(s),
        Some(other) => Err(config_err(format!("invalid time: {other}"))),
    }
}

fn uint_field(map: &Map<String, Value>, key: &str, default: u32) -> Result<u32> {
    match map.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| config_err(format!("invalid {key}: {v}"))),
    }
}

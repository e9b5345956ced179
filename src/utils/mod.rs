/// Utility functions and helpers
use chrono::{DateTime, Utc};
use cron::Schedule;
use flate2::read::GzDecoder;
use std::io::{self, Read};
use std::str::FromStr;

/// How far ahead the next uptime firing may be for a backend to count as up
pub const UPTIME_WINDOW_MS: i64 = 60_000;

/// Parse an uptime schedule
///
/// Five-field expressions use standard crontab fields (minute, hour, day
/// of month, month, day of week with Sunday as 0 or 7). Six and seven field
/// expressions are taken as-is, seconds first.
pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = if fields.len() == 5 {
        format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            crontab_weekdays(fields[4])
        )
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
}

/// Whether `now` is within one minute of the schedule's next firing
pub fn is_time_in_cron(now: DateTime<Utc>, expr: &str) -> Result<bool, cron::error::Error> {
    let schedule = parse_schedule(expr)?;
    Ok(schedule
        .after(&now)
        .next()
        .map(|next| (next - now).num_milliseconds() <= UPTIME_WINDOW_MS)
        .unwrap_or(false))
}

/// Crontab weekdays count Sunday as 0 (or 7); the scheduler counts it as 1
fn crontab_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = match range.split_once('-') {
                Some((start, "7")) => match start.parse::<u8>() {
                    Ok(start) if start <= 6 && step.is_none() => {
                        format!("{}-7,1", start + 1)
                    }
                    _ => format!("{}-1", shift_weekday(start)),
                },
                Some((start, end)) => format!("{}-{}", shift_weekday(start), shift_weekday(end)),
                None => shift_weekday(range),
            };
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_weekday(day: &str) -> String {
    match day.parse::<u8>() {
        Ok(7) => "1".to_string(),
        Ok(n) => (n + 1).to_string(),
        Err(_) => day.to_string(),
    }
}

/// Decode a request or response body for inspection
///
/// gzip bodies are decompressed, anything else is read as UTF-8 text.
pub fn decode_body(body: &[u8], content_encoding: Option<&str>) -> io::Result<String> {
    let bytes = match content_encoding.map(str::trim) {
        Some(enc) if enc.eq_ignore_ascii_case("gzip") => {
            let mut decoded = Vec::new();
            GzDecoder::new(body).read_to_end(&mut decoded)?;
            decoded
        }
        _ => body.to_vec(),
    };
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Format duration for human-readable output
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Current time as epoch seconds
pub fn epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

//! Rate-limit window selection, usage hints and burn-rate projection.

use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Utc};
use serde::Deserialize;

const SAMPLE_RETENTION_HOURS: i64 = 3;
const BURN_WINDOW_HOURS: i64 = 2;
const MIN_PROJECTION_SPAN_HOURS: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSample {
    pub at: DateTime<Utc>,
    pub pct: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    #[serde(default)]
    pub used_percent: f64,
    #[serde(default)]
    pub window_duration_mins: Option<i64>,
    #[serde(default)]
    pub resets_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RateLimitSnapshot {
    #[serde(default)]
    pub primary: Option<RateLimitWindow>,
    #[serde(default)]
    pub secondary: Option<RateLimitWindow>,
}

/// Shape shared by the `account/rateLimits/read` reply and the
/// `account/rateLimits/updated` notification.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitsPayload {
    #[serde(default)]
    pub rate_limits: Option<RateLimitSnapshot>,
}

impl RateLimitSnapshot {
    /// The window with the higher used percentage; ties keep `primary`.
    pub fn worst_window(&self) -> Option<&RateLimitWindow> {
        match (self.primary.as_ref(), self.secondary.as_ref()) {
            (Some(primary), Some(secondary)) => {
                if secondary.used_percent > primary.used_percent {
                    Some(secondary)
                } else {
                    Some(primary)
                }
            }
            (primary, secondary) => primary.or(secondary),
        }
    }
}

/// Rounds half-up and clamps to 0..=100.
pub fn usage_percent(window: &RateLimitWindow) -> u8 {
    let rounded = (window.used_percent + 0.5).floor();
    if rounded.is_nan() {
        return 0;
    }
    rounded.clamp(0.0, 100.0) as u8
}

pub fn format_window_duration(mins: i64) -> String {
    if mins <= 0 {
        return "unknown".to_string();
    }
    let days = mins / (24 * 60);
    let hours = (mins % (24 * 60)) / 60;
    let minutes = mins % 60;
    let parts = [(days, "d"), (hours, "h"), (minutes, "m")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect::<Vec<_>>();
    if parts.is_empty() {
        "0m".to_string()
    } else {
        parts.join(" ")
    }
}

/// `Used N%`, plus reset time and window length when known.
pub fn usage_hint<Tz>(window: &RateLimitWindow, pct: u8, zone: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let mut hint = format!("Used {pct}%");
    if let Some(resets_at) = window.resets_at.filter(|resets_at| *resets_at > 0) {
        if let Some(reset) = DateTime::<Utc>::from_timestamp(resets_at, 0) {
            hint.push_str(", resets ");
            hint.push_str(&reset.with_timezone(zone).to_rfc2822());
        }
    }
    if let Some(mins) = window.window_duration_mins.filter(|mins| *mins > 0) {
        hint.push_str(&format!(" ({} window)", format_window_duration(mins)));
    }
    hint
}

pub fn local_usage_hint(window: &RateLimitWindow, pct: u8) -> String {
    usage_hint(window, pct, &Local)
}

/// Appends `sample` and drops samples older than the retention window.
pub fn record_sample(samples: &mut Vec<UsageSample>, sample: UsageSample) {
    samples.push(sample);
    let cutoff = sample.at - ChronoDuration::hours(SAMPLE_RETENTION_HOURS);
    samples.retain(|kept| kept.at > cutoff);
}

/// Linear burn-rate projection over the trailing two hours.
pub fn usage_projection_hint(samples: &[UsageSample], now: DateTime<Utc>) -> Option<String> {
    if samples.len() < 2 {
        return None;
    }
    let window_start = now - ChronoDuration::hours(BURN_WINDOW_HOURS);
    let first = samples
        .iter()
        .find(|sample| sample.at >= window_start)
        .unwrap_or(&samples[0]);
    let last = samples.last()?;

    let span_hours = (last.at - first.at).num_milliseconds() as f64 / 3_600_000.0;
    if span_hours <= MIN_PROJECTION_SPAN_HOURS {
        return None;
    }
    let burn = (f64::from(last.pct) - f64::from(first.pct)) / span_hours;
    if burn <= 0.0 {
        return Some(format!("2h burn {burn:.1}%/h (stable/down)"));
    }
    if last.pct >= 100 {
        return Some(format!("2h burn {burn:.1}%/h (at limit)"));
    }
    let hours_to_limit = (f64::from(100 - last.pct) / burn).max(0.0);
    let total_minutes = (hours_to_limit * 60.0).round() as i64;
    let (hours, minutes) = (total_minutes / 60, total_minutes % 60);
    Some(if hours > 0 {
        format!("2h burn {burn:.1}%/h, projected 100% in {hours}h {minutes}m")
    } else {
        format!("2h burn {burn:.1}%/h, projected 100% in {minutes}m")
    })
}

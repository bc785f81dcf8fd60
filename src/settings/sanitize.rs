// Speed validation: every rate that reaches a video goes through here.

use serde_json::Value;

use crate::config::{DEFAULT_SPEED, MAX_SPEED, MIN_SPEED};

/// Clamp a finite rate into `[MIN_SPEED, MAX_SPEED]`.
pub fn clamp_speed(speed: f64) -> f64 {
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

/// True for finite rates already inside the allowed range.
pub fn is_valid_speed(speed: f64) -> bool {
    speed.is_finite() && (MIN_SPEED..=MAX_SPEED).contains(&speed)
}

/// Read a number out of a stored value.
///
/// Numbers are taken as-is; strings are parsed leniently, using the longest
/// numeric prefix (`"1.5x"` reads as 1.5). Anything else yields `None`.
pub fn parse_speed(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_leading_float(s),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn parse_leading_float(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let prefix_len = text
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
        .unwrap_or(text.len());
    let prefix = &text[..prefix_len];
    (1..=prefix.len())
        .rev()
        .find_map(|end| prefix[..end].parse::<f64>().ok())
}

/// Validate `value` as a playback rate.
///
/// Unparseable or non-finite input falls back to `fallback`; a non-finite
/// fallback falls back to [`DEFAULT_SPEED`]. The result is always clamped.
pub fn sanitize(value: &Value, fallback: f64) -> f64 {
    sanitize_with_default(value, fallback, DEFAULT_SPEED)
}

/// Like [`sanitize`], but with an explicit last-resort default (usually the
/// platform default speed).
pub fn sanitize_with_default(value: &Value, fallback: f64, default: f64) -> f64 {
    match parse_speed(value) {
        Some(speed) => clamp_speed(speed),
        None => sanitize_fallback(fallback, default),
    }
}

/// Validate an already-numeric rate.
pub fn sanitize_f64(speed: f64, fallback: f64) -> f64 {
    if speed.is_finite() {
        clamp_speed(speed)
    } else {
        sanitize_fallback(fallback, DEFAULT_SPEED)
    }
}

fn sanitize_fallback(fallback: f64, default: f64) -> f64 {
    if fallback.is_finite() {
        clamp_speed(fallback)
    } else if default.is_finite() {
        clamp_speed(default)
    } else {
        DEFAULT_SPEED
    }
}

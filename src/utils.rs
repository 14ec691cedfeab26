// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Utility functions shared across the crate.
//!
//! Timestamps are carried as microseconds since the Unix epoch everywhere
//! (metadata rows, version file names), and converted to chrono types only
//! at the public API and on the wire.

use chrono::{DateTime, TimeZone, Utc};

/// Format used for `If-Modified-Since` and `X-ClientDate`.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Current wall-clock time in microseconds.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Convert microseconds since the epoch to a UTC timestamp.
pub fn micros_to_utc(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Render microseconds as an RFC 7231 http-date.
pub fn http_date(micros: i64) -> String {
    micros_to_utc(micros).format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an http-date (`Mon, 01 Jan 2024 00:00:00 GMT`) into microseconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_micros())
}

/// Mask a sensitive string (like a signing secret) for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest with "...".
///
/// # Examples
///
/// ```
/// use assetlib::utils::mask_sensitive;
///
/// let secret = "k3y-abcdefghijklmnopqrstuvwxyz";
/// assert_eq!(mask_sensitive(secret, 4), "k3y-...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.chars().count() <= visible_prefix {
        // Nothing would stay hidden; show none of it
        return "...".to_string();
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

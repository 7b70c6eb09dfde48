//! Rate-limit header parsing.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use vesper_core::backoff::parse_retry_after;
use vesper_core::session::RateLimitInfo;

use crate::backend::HttpResponse;

/// Values above this are epoch seconds; below it, seconds from now.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

pub fn retry_after(resp: &HttpResponse) -> Option<Duration> {
    resp.header("retry-after").and_then(parse_retry_after)
}

/// Build [`RateLimitInfo`] from a 429 response.
///
/// `resetAt` comes from `x-ratelimit-reset` when present, otherwise from
/// `Retry-After`.
pub fn rate_limit_from_headers(resp: &HttpResponse, now: DateTime<Utc>) -> RateLimitInfo {
    let number = |name: &str| resp.header(name).and_then(|v| v.trim().parse::<i64>().ok());

    let reset_at = number("x-ratelimit-reset")
        .and_then(|v| {
            if v >= EPOCH_THRESHOLD {
                Utc.timestamp_opt(v, 0).single()
            } else {
                Some(now + chrono::Duration::seconds(v.max(0)))
            }
        })
        .or_else(|| {
            retry_after(resp)
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d)
        });

    RateLimitInfo {
        active: true,
        bucket: resp.header("x-ratelimit-bucket").map(str::to_string),
        limit: number("x-ratelimit-limit").and_then(|v| u32::try_from(v).ok()),
        remaining: number("x-ratelimit-remaining").and_then(|v| u32::try_from(v).ok()),
        reset_at,
    }
}

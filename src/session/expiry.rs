//! Access token expiry arithmetic.
//!
//! Pure functions of `(now, expires_at)`. Minutes are whole minutes truncated
//! toward zero, so a token that expired 30 seconds ago is still at `0`.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default window, in minutes, under which a token is "expiring soon".
pub const DEFAULT_EXPIRING_SOON_MINUTES: i64 = 5;

const MINUTES_PER_HOUR: i64 = 60;

/// Expiry state of the stored access token.
///
/// `Unknown` covers a missing record, token or expiry timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryStatus {
    Expired,
    Active,
    Unknown,
}

impl ExpiryStatus {
    /// Classify `expires_at` relative to `now`.
    pub fn of(now: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> Self {
        match expires_at {
            Some(expires_at) if is_expired(now, expires_at) => Self::Expired,
            Some(_) => Self::Active,
            None => Self::Unknown,
        }
    }

    /// Two-valued collapse: unknown counts as not expired.
    pub fn is_expired(self) -> bool {
        self == Self::Expired
    }
}

/// `true` once `now` is strictly after `expires_at`.
pub fn is_expired(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> bool {
    now > expires_at
}

/// Whole minutes left before expiry, negative once expired.
pub fn minutes_until_expiry(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> i64 {
    (expires_at - now).num_minutes()
}

/// `true` when at most `threshold_minutes` remain, including expired tokens.
pub fn is_expiring_soon(
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    threshold_minutes: i64,
) -> bool {
    minutes_until_expiry(now, expires_at) <= threshold_minutes
}

/// Human readable remaining time: hours above one hour, minutes otherwise.
pub fn expiry_display(minutes_until_expiry: i64) -> String {
    if minutes_until_expiry > MINUTES_PER_HOUR {
        format!("{} hours", minutes_until_expiry / MINUTES_PER_HOUR)
    } else {
        format!("{minutes_until_expiry} minutes")
    }
}

/// Expiry snapshot for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryInfo {
    pub expires_at: DateTime<Utc>,
    pub minutes_until_expiry: i64,
    pub is_expired: bool,
    pub is_expiring_soon: bool,
    pub expiry_display: String,
}

impl ExpiryInfo {
    pub fn compute(
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        threshold_minutes: i64,
    ) -> Self {
        let minutes = minutes_until_expiry(now, expires_at);

        Self {
            expires_at,
            minutes_until_expiry: minutes,
            is_expired: is_expired(now, expires_at),
            is_expiring_soon: minutes <= threshold_minutes,
            expiry_display: expiry_display(minutes),
        }
    }
}

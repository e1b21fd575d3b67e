//! Common types used across Sitebill

use serde::{Deserialize, Serialize};
use time::macros::datetime;
use time::{Date, OffsetDateTime};

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant ID wrapper (bigserial in Postgres)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, PartialOrd, Ord,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TenantId(pub i64);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TenantId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// =============================================================================
// Calendar helpers
// =============================================================================

/// Expiry sentinel for tenants that never expire (comped / permanent).
/// Payment events never move an expiry past this value.
pub const NEVER_EXPIRES: OffsetDateTime = datetime!(9999-12-31 00:00 UTC);

/// Add calendar months to a timestamp, clamping the day-of-month when the
/// target month is shorter (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(at: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = at.date();
    let zero_based = date.year() * 12 + (date.month() as i32 - 1) + months;
    let year = zero_based.div_euclid(12);
    let month = match time::Month::try_from((zero_based.rem_euclid(12) + 1) as u8) {
        Ok(m) => m,
        // Unreachable: rem_euclid(12) + 1 is always in 1..=12
        Err(_) => return at,
    };
    let day = date.day().min(month.length(year));
    match Date::from_calendar_date(year, month, day) {
        Ok(new_date) => at.replace_date(new_date),
        // Only reachable if `year` overflows the supported range
        Err(_) => NEVER_EXPIRES,
    }
}

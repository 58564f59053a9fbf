//! # Clock Module
//!
//! Creation timestamps for contacts. All times are UTC epoch milliseconds.
//!
//! Contacts are totally ordered by `(created_at, id)`; the clock only has to be
//! non-decreasing for that order to agree with insertion order.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;

/// UTC epoch milliseconds.
pub type Timestamp = i64;

/// Source of creation/update timestamps for a store.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock that never goes backwards.
///
/// A regression of the system clock is absorbed by re-issuing the last value,
/// so ties are possible and are broken by contact id.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = wall_clock_millis();
        let previous = self.last.fetch_max(wall, Ordering::AcqRel);
        previous.max(wall)
    }
}

/// Manually driven clock. Used by tests that need identical or specific timestamps.
#[derive(Debug, Default)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    pub fn set(&self, value: Timestamp) {
        self.current.store(value, Ordering::Release);
    }

    pub fn advance(&self, millis: i64) {
        self.current.fetch_add(millis, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.current.load(Ordering::Acquire)
    }
}

/// Current UTC time in epoch milliseconds.
pub fn wall_clock_millis() -> Timestamp {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos / 1_000_000) as Timestamp
}

/// Render a timestamp as RFC 3339, falling back to the raw number when out of range.
pub fn format_timestamp(ts: Timestamp) -> String {
    let nanos = i128::from(ts) * 1_000_000;
    match OffsetDateTime::from_unix_timestamp_nanos(nanos) {
        Ok(dt) => dt
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| ts.to_string()),
        Err(_) => ts.to_string(),
    }
}

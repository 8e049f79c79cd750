//! Millisecond timestamps, day quantization and the clock the store reads.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::Timestamp;

pub const HOUR_MILLIS: i64 = 60 * 60 * 1000;
pub const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

/// Round down to the UTC midnight at or before `ts`.
pub fn quantize_date(ts: Timestamp) -> Timestamp {
    ts.div_euclid(DAY_MILLIS) * DAY_MILLIS
}

/// Round down to the server-local midnight at or before `ts`.
pub fn quantize_local_midnight(ts: Timestamp, tz_offset_ms: i64) -> Timestamp {
    quantize_date(ts + tz_offset_ms) - tz_offset_ms
}

/// Round up to the next UTC midnight unless already on one.
pub fn quantize_date_up(ts: Timestamp) -> Timestamp {
    let down = quantize_date(ts);
    if down == ts {
        ts
    } else {
        down + DAY_MILLIS
    }
}

pub fn make_days_ago(now: Timestamp, days: u32) -> Timestamp {
    quantize_date(now) - i64::from(days) * DAY_MILLIS
}

pub fn make_days_before(ts: Timestamp, days: u32) -> Timestamp {
    ts - i64::from(days) * DAY_MILLIS
}

/// Source of "now" for everything time dependent in the store.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize() {
        let jan2 = 631_152_000_000 + DAY_MILLIS;
        assert_eq!(quantize_date(jan2 + 5 * HOUR_MILLIS), jan2);
        assert_eq!(quantize_date(jan2), jan2);
        assert_eq!(quantize_date_up(jan2 + 1), jan2 + DAY_MILLIS);
        assert_eq!(quantize_date_up(jan2), jan2);
        assert_eq!(quantize_date(-1), -DAY_MILLIS);
    }

    #[test]
    fn test_local_midnight() {
        let jan2 = 631_152_000_000 + DAY_MILLIS;
        // UTC-5: local midnight is 05:00 UTC
        let offset = -5 * HOUR_MILLIS;
        let local = quantize_local_midnight(jan2 + 7 * HOUR_MILLIS, offset);
        assert_eq!(local, jan2 + 5 * HOUR_MILLIS);
        let local = quantize_local_midnight(jan2 + 2 * HOUR_MILLIS, offset);
        assert_eq!(local, jan2 - DAY_MILLIS + 5 * HOUR_MILLIS);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1000);
        clock.advance(500);
        assert_eq!(clock.now(), 1500);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}

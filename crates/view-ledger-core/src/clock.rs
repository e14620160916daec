use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};

/// Timestamp shared by every revision written during one logical operation.
///
/// Stamps are UTC and truncated to millisecond precision so they survive a
/// round trip through RFC 3339 text unchanged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OperationStamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime);

impl OperationStamp {
    #[must_use]
    pub fn from_datetime(value: OffsetDateTime) -> Self {
        let utc = value.to_offset(UtcOffset::UTC);
        let sub_millis = i64::from(utc.nanosecond() % 1_000_000);
        Self(utc - Duration::nanoseconds(sub_millis))
    }

    #[must_use]
    pub fn at(self) -> OffsetDateTime {
        self.0
    }

    /// This stamp, or the first millisecond after `floor` when the clock has
    /// not moved past it. Writers pass the newest stamp already stored for
    /// the entity so that every write gets its own instant, even when two
    /// writes land in one millisecond or the wall clock steps backward.
    #[must_use]
    pub fn after(self, floor: OffsetDateTime) -> Self {
        if self.0 > floor {
            self
        } else {
            Self::from_datetime(floor + Duration::milliseconds(1))
        }
    }
}

pub trait OperationClock {
    /// Allocate the stamp for one operation. Called once per write operation.
    fn stamp(&self) -> OperationStamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl OperationClock for SystemClock {
    fn stamp(&self) -> OperationStamp {
        OperationStamp::from_datetime(OffsetDateTime::now_utc())
    }
}

/// Deterministic clock that hands out `start`, `start + step`, `start + 2*step`, ...
#[derive(Debug)]
pub struct SteppingClock {
    next: Mutex<OffsetDateTime>,
    step: Duration,
}

impl SteppingClock {
    #[must_use]
    pub fn new(start: OffsetDateTime, step: Duration) -> Self {
        Self { next: Mutex::new(start), step }
    }

    #[must_use]
    pub fn starting_at(start: OffsetDateTime) -> Self {
        Self::new(start, Duration::seconds(1))
    }
}

impl OperationClock for SteppingClock {
    fn stamp(&self) -> OperationStamp {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let stamp = OperationStamp::from_datetime(*next);
        *next += self.step;
        stamp
    }
}

impl<C: OperationClock + ?Sized> OperationClock for &C {
    fn stamp(&self) -> OperationStamp {
        (**self).stamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_drop_sub_millisecond_precision() {
        let raw = OffsetDateTime::UNIX_EPOCH + Duration::nanoseconds(1_234_567_891);
        let stamp = OperationStamp::from_datetime(raw);
        assert_eq!(stamp.at().nanosecond(), 234_000_000);
        assert_eq!(stamp.at().unix_timestamp(), 1);
    }

    #[test]
    fn stamps_are_normalised_to_utc() {
        let offset = match UtcOffset::from_hms(2, 0, 0) {
            Ok(offset) => offset,
            Err(err) => panic!("fixture offset: {err}"),
        };
        let local = OffsetDateTime::UNIX_EPOCH.to_offset(offset);
        assert_eq!(OperationStamp::from_datetime(local).at().offset(), UtcOffset::UTC);
    }

    #[test]
    fn stepping_clock_advances_per_stamp() {
        let clock = SteppingClock::starting_at(OffsetDateTime::UNIX_EPOCH);
        let first = clock.stamp();
        let second = clock.stamp();
        assert_eq!(second.at() - first.at(), Duration::seconds(1));
    }

    #[test]
    fn stamps_move_past_a_stored_floor() {
        let floor = OffsetDateTime::UNIX_EPOCH + Duration::seconds(10);
        let frozen = SteppingClock::new(floor, Duration::ZERO);

        let bumped = frozen.stamp().after(floor);
        assert_eq!(bumped.at(), floor + Duration::milliseconds(1));

        let behind = OperationStamp::from_datetime(floor - Duration::hours(1)).after(floor);
        assert_eq!(behind.at(), floor + Duration::milliseconds(1));

        let ahead = OperationStamp::from_datetime(floor + Duration::seconds(5));
        assert_eq!(ahead.after(floor), ahead);

        let sub_milli_floor = floor + Duration::microseconds(1_500);
        assert!(OperationStamp::from_datetime(floor).after(sub_milli_floor).at() > sub_milli_floor);
    }

    #[test]
    fn chained_floors_keep_stamps_strictly_increasing() {
        let clock = SteppingClock::new(OffsetDateTime::UNIX_EPOCH, Duration::ZERO);
        let mut floor = clock.stamp().at();
        for _ in 0..5 {
            let next = clock.stamp().after(floor);
            assert!(next.at() > floor);
            floor = next.at();
        }
        assert_eq!(floor, OffsetDateTime::UNIX_EPOCH + Duration::milliseconds(5));
    }
}

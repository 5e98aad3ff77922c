//! 100-nanosecond tick timestamps

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Timestamp expressed as 100ns ticks since 0001-01-01T00:00:00Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Ticks(pub i64);

impl Ticks {
    pub const PER_SECOND: i64 = 10_000_000;
    pub const PER_MILLISECOND: i64 = 10_000;
    pub const PER_MINUTE: i64 = 60 * Self::PER_SECOND;
    pub const PER_HOUR: i64 = 60 * Self::PER_MINUTE;

    /// Tick value of the Unix epoch.
    pub const UNIX_EPOCH: i64 = 621_355_968_000_000_000;

    /// Largest representable timestamp.
    pub const MAX: Ticks = Ticks(i64::MAX);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Current UTC time in ticks.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        let seconds = time.timestamp();
        let sub_ticks = i64::from(time.timestamp_subsec_nanos()) / 100;
        Self(Self::UNIX_EPOCH + seconds * Self::PER_SECOND + sub_ticks)
    }

    /// Converts back to a calendar time, `None` when out of chrono's range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let since_epoch = self.0.checked_sub(Self::UNIX_EPOCH)?;
        let seconds = since_epoch.div_euclid(Self::PER_SECOND);
        let nanos = (since_epoch.rem_euclid(Self::PER_SECOND) * 100) as u32;
        Utc.timestamp_opt(seconds, nanos).single()
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self((duration.as_nanos() / 100).min(i64::MAX as u128) as i64)
    }

    /// Whole seconds since the tick epoch, used for per-second bucketing.
    pub fn whole_seconds(self) -> i64 {
        self.0.div_euclid(Self::PER_SECOND)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(time) => write!(f, "{}", time.format("%Y-%m-%d %H:%M:%S%.3f")),
            None => write!(f, "{} ticks", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_maps_to_1970() {
        let epoch = Ticks(Ticks::UNIX_EPOCH).to_datetime().unwrap();
        assert_eq!(epoch.timestamp(), 0);
    }

    #[test]
    fn datetime_conversion_keeps_sub_second_ticks() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(1_234_500);
        let ticks = Ticks::from_datetime(time);
        assert_eq!(ticks.to_datetime().unwrap(), time);
        assert_eq!(ticks.0 % Ticks::PER_SECOND, 12_345);
    }

    #[test]
    fn now_is_after_2020() {
        let year_2020 = Ticks::from_datetime(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert!(Ticks::now() > year_2020);
    }
}

//! Conversions between wire timestamps and [`chrono`] values.

use chrono::{DateTime, Utc};
use prost_types::Timestamp;

/// The current wall-clock time as a wire timestamp.
pub fn now() -> Timestamp {
    from_datetime(Utc::now())
}

pub fn from_datetime(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

/// Returns `None` if the timestamp is outside chrono's representable range.
pub fn to_datetime(ts: &Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
}

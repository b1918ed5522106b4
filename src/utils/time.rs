use jiff::{Timestamp, civil::DateTime, tz::Offset};

use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::ByteCursor;

const WINDOWS_TO_UNIX_SECS: i64 = 11_644_473_600;
const TICKS_PER_SEC: i64 = 10_000_000;

#[inline]
pub(crate) fn filetime_to_timestamp(filetime: u64) -> DeserializationResult<Timestamp> {
    let secs = (filetime / 10_000_000) as i64 - WINDOWS_TO_UNIX_SECS;
    let nanos = ((filetime % 10_000_000) * 100) as i32;
    Timestamp::new(secs, nanos).map_err(|_| DeserializationError::InvalidDateTimeError)
}

/// The inverse of [`filetime_to_timestamp`]; instants before 1601 clamp to zero.
pub(crate) fn timestamp_to_filetime(ts: Timestamp) -> u64 {
    let secs = ts.as_second() + WINDOWS_TO_UNIX_SECS;
    if secs < 0 {
        return 0;
    }
    let ticks = secs * TICKS_PER_SEC + i64::from(ts.subsec_nanosecond()) / 100;
    ticks as u64
}

pub(crate) fn read_systime(cursor: &mut ByteCursor<'_>) -> DeserializationResult<Timestamp> {
    let bytes = cursor.array::<16>("systime")?;
    systime_from_bytes(&bytes)
}

pub(crate) fn systime_from_bytes(bytes: &[u8; 16]) -> DeserializationResult<Timestamp> {
    let field = |i: usize| u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
    let (year, month, day) = (field(0), field(1), field(3));
    let (hour, minute, second, milliseconds) = (field(4), field(5), field(6), field(7));

    // The entire value is unset. By convention, use the "1601-01-01T00:00:00.0000000Z" timestamp.
    if bytes.iter().all(|&b| b == 0) {
        return filetime_to_timestamp(0);
    }

    let invalid = |_| DeserializationError::InvalidDateTimeError;
    let dt = DateTime::new(
        i16::try_from(year).map_err(invalid)?,
        i8::try_from(month).map_err(invalid)?,
        i8::try_from(day).map_err(invalid)?,
        i8::try_from(hour).map_err(invalid)?,
        i8::try_from(minute).map_err(invalid)?,
        i8::try_from(second).map_err(invalid)?,
        i32::from(milliseconds) * 1_000_000,
    )
    .map_err(|_| DeserializationError::InvalidDateTimeError)?;
    Offset::UTC
        .to_timestamp(dt)
        .map_err(|_| DeserializationError::InvalidDateTimeError)
}

/// Lay out a timestamp as a `SYSTEMTIME` (UTC, millisecond precision).
pub(crate) fn timestamp_to_systime(ts: Timestamp) -> [u8; 16] {
    let dt = Offset::UTC.to_datetime(ts);
    let fields = [
        dt.year() as u16,
        dt.month() as u16,
        dt.weekday().to_sunday_zero_offset() as u16,
        dt.day() as u16,
        dt.hour() as u16,
        dt.minute() as u16,
        dt.second() as u16,
        dt.millisecond() as u16,
    ];
    let mut out = [0u8; 16];
    for (i, v) in fields.iter().enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
    }
    out
}

//! Calendar timestamps for log file names.
//!
//! Pure arithmetic on the epoch second count. Nothing here touches the C library's
//! time zone or calendar state, so it stays usable from the crash path.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const SECS_PER_DAY: u64 = 86_400;
/// Days from 0000-03-01 to 1970-01-01.
const EPOCH_SHIFT_DAYS: u64 = 719_468;
const DAYS_PER_ERA: u64 = 146_097;
const MAX_YEAR: u64 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub millis: u16,
}

impl Timestamp {
    pub fn from_unix_secs(secs: u64) -> Self {
        let days = secs / SECS_PER_DAY;
        let tod = secs % SECS_PER_DAY;

        // Shift to a March-based year so the leap day is the last day of the year.
        let z = days + EPOCH_SHIFT_DAYS;
        let era = z / DAYS_PER_ERA;
        let doe = z - era * DAYS_PER_ERA;
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = doy - (153 * mp + 2) / 5 + 1;
        let month = if mp < 10 { mp + 3 } else { mp - 9 };
        let year = yoe + era * 400 + u64::from(month <= 2);

        Self {
            year: year.min(MAX_YEAR) as u16,
            month: month as u8,
            day: day as u8,
            hour: (tod / 3600) as u8,
            minute: (tod / 60 % 60) as u8,
            second: (tod % 60) as u8,
            millis: 0,
        }
    }

    pub fn from_unix_duration(since_epoch: Duration) -> Self {
        Self {
            millis: since_epoch.subsec_millis() as u16,
            ..Self::from_unix_secs(since_epoch.as_secs())
        }
    }

    /// Clocks set before 1970 read as the epoch.
    pub fn now() -> Self {
        Self::from_unix_duration(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
            self.year, self.month, self.day, self.hour, self.minute, self.second, self.millis
        )
    }
}

/// `manderrow-agent-<label>-<timestamp>.log`
pub fn log_file_name(label: &str, ts: Timestamp) -> String {
    format!("manderrow-agent-{label}-{ts}.log")
}

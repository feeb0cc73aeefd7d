use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};

/// Text form of `start_time` shared by the time dimension and the fact table.
pub const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Calendar attributes of one instant; every field is a function of `start_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAttributes {
    pub start_time: DateTime<Utc>,
    pub hour: u32,
    pub day: u32,
    /// ISO-8601 week of the year.
    pub week: u32,
    pub month: u32,
    pub year: i32,
    /// ISO weekday, Monday = 1 through Sunday = 7.
    pub weekday: u32,
}

impl TimeAttributes {
    /// The warehouse key for this instant.
    pub fn start_time_key(&self) -> String {
        self.start_time.format(START_TIME_FORMAT).to_string()
    }
}

pub struct TimeDimensionExtractor;

impl TimeDimensionExtractor {
    pub fn extract(epoch_ms: i64) -> Result<TimeAttributes> {
        let start_time = DateTime::<Utc>::from_timestamp_millis(epoch_ms).ok_or_else(|| {
            LoadError::ConstraintViolation {
                relation: crate::warehouse::schema::TIME.to_string(),
                detail: format!("epoch milliseconds {} out of range", epoch_ms),
            }
        })?;

        Ok(TimeAttributes {
            start_time,
            hour: start_time.hour(),
            day: start_time.day(),
            week: start_time.iso_week().week(),
            month: start_time.month(),
            year: start_time.year(),
            weekday: start_time.weekday().number_from_monday(),
        })
    }

    pub fn start_time_key(epoch_ms: i64) -> Result<String> {
        Ok(Self::extract(epoch_ms)?.start_time_key())
    }
}

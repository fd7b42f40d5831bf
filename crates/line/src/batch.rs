use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::line_protocol::write_point;
use crate::point::Point;

/// Timestamp granularity declared for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    /// Value of the `precision` query parameter understood by `InfluxDB`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Precision::Nanoseconds => "ns",
            Precision::Microseconds => "u",
            Precision::Milliseconds => "ms",
            Precision::Seconds => "s",
            Precision::Minutes => "m",
            Precision::Hours => "h",
        }
    }

    /// Truncates `since_epoch` to this precision.
    #[must_use]
    pub const fn timestamp(self, since_epoch: Duration) -> u128 {
        let secs = since_epoch.as_secs() as u128;
        match self {
            Precision::Nanoseconds => since_epoch.as_nanos(),
            Precision::Microseconds => since_epoch.as_micros(),
            Precision::Milliseconds => since_epoch.as_millis(),
            Precision::Seconds => secs,
            Precision::Minutes => secs / 60,
            Precision::Hours => secs / 3600,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a batch is written and how its timestamps are encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub database: String,
    pub retention_policy: Option<String>,
    pub precision: Precision,
}

/// An ordered group of points written to the store in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPoints {
    config: BatchConfig,
    points: Vec<Point>,
}

impl BatchPoints {
    /// Creates an empty batch.
    ///
    /// # Errors
    ///
    /// Errors if the database or retention policy names are unusable.
    pub fn new(config: BatchConfig) -> Result<Self, BatchError> {
        if config.database.trim().is_empty() {
            return Err(BatchError::EmptyDatabase);
        }
        if config
            .retention_policy
            .as_deref()
            .is_some_and(|rp| rp.trim().is_empty())
        {
            return Err(BatchError::EmptyRetentionPolicy);
        }

        Ok(BatchPoints { config, points: Vec::new() })
    }

    pub fn add_point(&mut self, point: Point) {
        self.points.push(point);
    }

    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.config.database
    }

    #[must_use]
    pub fn retention_policy(&self) -> Option<&str> {
        self.config.retention_policy.as_deref()
    }

    #[must_use]
    pub const fn precision(&self) -> Precision {
        self.config.precision
    }

    /// Encodes every point, one line each, in insertion order.
    #[must_use]
    pub fn to_line_protocol(&self) -> String {
        let mut buf = String::new();
        for point in &self.points {
            write_point(&mut buf, point, self.config.precision);
        }

        buf
    }
}

/// Possible failure while creating a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("Database name is empty")]
    EmptyDatabase,
    #[error("Retention policy is empty")]
    EmptyRetentionPolicy,
}

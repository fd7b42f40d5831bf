use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    UInteger(u64),
    Boolean(bool),
    String(String),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<f32> for FieldValue {
    fn from(value: f32) -> Self {
        FieldValue::Float(f64::from(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UInteger(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::UInteger(u64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

/// A validated point, ready to be encoded.
///
/// Construction rejects anything the line protocol cannot represent, so a
/// [`Point`] held in a batch always encodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    since_epoch: Duration,
}

impl Point {
    /// Validates and builds a point.
    ///
    /// # Errors
    ///
    /// See [`PointError`] for the rejected inputs.
    pub fn new(
        measurement: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        timestamp: SystemTime,
    ) -> Result<Self, PointError> {
        let measurement = measurement.into();
        if measurement.is_empty() {
            return Err(PointError::EmptyMeasurement);
        }

        for (key, value) in &tags {
            if key.is_empty() {
                return Err(PointError::EmptyTagKey);
            }
            if value.is_empty() {
                return Err(PointError::EmptyTagValue(key.clone()));
            }
        }

        if fields.is_empty() {
            return Err(PointError::NoFields);
        }
        for (key, value) in &fields {
            if key.is_empty() {
                return Err(PointError::EmptyFieldKey);
            }
            if let FieldValue::Float(float) = value {
                if !float.is_finite() {
                    return Err(PointError::NonFiniteField(key.clone()));
                }
            }
        }

        let since_epoch = timestamp
            .duration_since(UNIX_EPOCH)
            .map_err(|_| PointError::BeforeEpoch)?;

        Ok(Point { measurement, tags, fields, since_epoch })
    }

    #[must_use]
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    #[must_use]
    pub const fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    #[must_use]
    pub const fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Time elapsed between the Unix epoch and the point's timestamp.
    #[must_use]
    pub const fn since_epoch(&self) -> Duration {
        self.since_epoch
    }
}

/// Reasons a point cannot be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointError {
    #[error("Measurement name is empty")]
    EmptyMeasurement,
    #[error("Tag key is empty")]
    EmptyTagKey,
    #[error("Tag value is empty; key={0}")]
    EmptyTagValue(String),
    #[error("Point has no fields")]
    NoFields,
    #[error("Field key is empty")]
    EmptyFieldKey,
    #[error("Field is not finite; key={0}")]
    NonFiniteField(String),
    #[error("Timestamp precedes the Unix epoch")]
    BeforeEpoch,
}

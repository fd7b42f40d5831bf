//! `InfluxDB` line protocol encoding.
//!
//! Points are validated on construction ([`Point::new`]) and grouped into a
//! [`BatchPoints`] that carries the database, retention policy and timestamp
//! [`Precision`] it will be written with.

mod batch;
mod line_protocol;
mod point;

pub use batch::{BatchConfig, BatchError, BatchPoints, Precision};
pub use point::{FieldValue, Point, PointError};

use std::collections::BTreeMap;
use std::time::SystemTime;

use influx_line::FieldValue;

/// Field name to value mapping produced by one sample.
pub type Fields = BTreeMap<String, FieldValue>;

/// Produces one set of fields per scheduler tick.
///
/// Called on the scheduler's task, so it must return quickly relative to the
/// poll interval.
pub trait SampleSource {
    fn sample(&mut self) -> Fields;
}

impl<F> SampleSource for F
where
    F: FnMut() -> Fields,
{
    fn sample(&mut self) -> Fields {
        self()
    }
}

/// One sample, as emitted by the scheduler and consumed by the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub fields: Fields,
    pub timestamp: SystemTime,
}

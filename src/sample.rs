//! The immutable data carrier flowing along pipeline edges.
//!
//! A `DataSample` is created once and then shared by reference; it is never
//! mutated. Queues, in-flight deliveries and filters all hold the same
//! `Arc`, so a sample is freed exactly when the last holder drops it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Resolution of sample timestamps in seconds (timestamps are microseconds).
pub const TIMESTAMP_RES: f64 = 1e-6;

/// Shared handle to an immutable data sample.
pub type SharedDataSample = Arc<DataSample>;

/// An immutable sample: opaque byte payload, a short datatype tag and a
/// timestamp in microseconds.
///
/// Equality of samples is identity of the `Arc`; the payload is opaque to
/// the runtime.
#[derive(Debug)]
pub struct DataSample {
    content: Vec<u8>,
    datatype: String,
    timestamp: i64,
}

impl DataSample {
    /// Create a new sample. `timestamp` is in units of [`TIMESTAMP_RES`]
    /// seconds (i.e. microseconds), typically from [`DataSample::current_time`].
    pub fn new(
        content: impl Into<Vec<u8>>,
        datatype: impl Into<String>,
        timestamp: i64,
    ) -> SharedDataSample {
        Arc::new(DataSample {
            content: content.into(),
            datatype: datatype.into(),
            timestamp,
        })
    }

    /// Create an independent copy of `src` with equal content, datatype and
    /// timestamp.
    pub fn copy(src: &DataSample) -> SharedDataSample {
        DataSample::new(src.content.clone(), src.datatype.clone(), src.timestamp)
    }

    /// The sample payload.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// The datatype tag.
    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    /// The timestamp in microseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Current wall-clock time in microseconds since the Unix epoch.
    pub fn current_time() -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_micros() as i64,
            // clock before 1970; report a negative offset
            Err(e) => -(e.duration().as_micros() as i64),
        }
    }
}

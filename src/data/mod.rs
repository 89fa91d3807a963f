//! Measurement persistence.
pub mod recorder;

pub use recorder::{DataRecorder, MeasurementRecord, RecordData, RecordMetadata};

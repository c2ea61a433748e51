//! Telemetry recording: on-device buffer configuration, internal-format
//! decoding, continuous multi-drive drain, and fault-triggered capture.

pub mod decode;

mod capture;
mod profile;
mod recorder;
mod sink;

pub use capture::{capture_fault, record_streams, FaultCapture, RecordStream};
pub use profile::{
    record_current_profile, record_velocity_profile, CurrentSegment, VelocitySegment,
    PROFILE_CHANNELS,
};
pub use recorder::{
    effective_frequency, FaultTrigger, Recorder, RecorderConfig, BASE_RATE_HZ, MAX_BUFFER_POINTS,
};
pub use sink::{fault_log_file_name, telemetry_file_name, CsvSink, MemorySink, TelemetrySink};

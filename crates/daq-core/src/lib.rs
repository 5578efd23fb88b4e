//! `daq-core`
//!
//! Shared types for the Basler acquisition crates: the error type, the camera
//! value types exchanged with callers, and the [`FrameSink`] seam through
//! which the driver hands frames to the acquisition framework's buffer pool.

pub mod camera;
pub mod error;
pub mod frame_sink;

pub use camera::{
    AcquisitionStatus, DetectorInfo, FrameInfo, ImageSize, ImageType, TriggerMode,
};
pub use error::{DaqError, DaqResult, DriverError, DriverErrorKind};
pub use frame_sink::FrameSink;

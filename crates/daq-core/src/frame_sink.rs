//! Destination of completed frames.
//!
//! The frame buffer pool is owned by the acquisition framework, not by the
//! camera driver. The driver only sees this trait: it writes each frame into
//! the slot addressed by its acquisition frame number and then signals that
//! the frame is ready. Implementations provide their own synchronization.

use chrono::{DateTime, Utc};

use crate::camera::FrameInfo;
use crate::error::DaqResult;

pub trait FrameSink: Send + Sync {
    /// Byte capacity of one slot.
    fn slot_capacity(&self) -> usize;

    /// Record the wall clock start of a run. Frame timestamps are relative to it.
    fn set_start_timestamp(&self, at: DateTime<Utc>);

    /// Start timestamp of the current run, if one was recorded.
    fn start_timestamp(&self) -> Option<DateTime<Utc>>;

    /// Copy `payload` into the slot for `frame_nb`.
    ///
    /// Fails with [`crate::error::DaqError::FrameTooLarge`] when the payload
    /// exceeds [`slot_capacity`](Self::slot_capacity).
    fn write_frame(&self, frame_nb: u64, payload: &[u8]) -> DaqResult<()>;

    /// Announce that the slot for `info.frame_nb` holds a complete frame.
    fn notify_frame_ready(&self, info: FrameInfo);
}

//! Acquisition tuning knobs.

use daq_core::{DaqError, DaqResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::components::device::MAX_EXPOSURE_MS;

/// Settings of the acquisition controller.
///
/// Deserializable so it can be embedded in the application configuration:
///
/// ```toml
/// [acquisition]
/// buffer_count = 1
/// poll_timeout = "10s"
/// nb_frames = 1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Grab buffers registered with the stream grabber.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// Bound of one poll. Defaults to the longest exposure the protocol allows.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Capacity of the controller's command channel.
    #[serde(default = "default_command_channel_capacity")]
    pub command_channel_capacity: usize,

    /// Frames per run until changed with `set_nb_frames`.
    #[serde(default = "default_nb_frames")]
    pub nb_frames: u64,

    /// Physical pixel pitch in micrometres.
    #[serde(default = "default_pixel_size_um")]
    pub pixel_size_um: f64,
}

fn default_buffer_count() -> usize {
    1
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(MAX_EXPOSURE_MS as u64)
}

fn default_command_channel_capacity() -> usize {
    32
}

fn default_nb_frames() -> u64 {
    1
}

fn default_pixel_size_um() -> f64 {
    6.45
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            buffer_count: default_buffer_count(),
            poll_timeout: default_poll_timeout(),
            command_channel_capacity: default_command_channel_capacity(),
            nb_frames: default_nb_frames(),
            pixel_size_um: default_pixel_size_um(),
        }
    }
}

impl AcquisitionSettings {
    pub fn validate(&self) -> DaqResult<()> {
        if self.buffer_count == 0 {
            return Err(DaqError::InvalidParameter(
                "buffer_count must be at least 1".into(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(DaqError::InvalidParameter(
                "poll_timeout must be non-zero".into(),
            ));
        }
        if self.command_channel_capacity == 0 {
            return Err(DaqError::InvalidParameter(
                "command_channel_capacity must be at least 1".into(),
            ));
        }
        if self.nb_frames == 0 {
            return Err(DaqError::InvalidParameter(
                "nb_frames must be at least 1".into(),
            ));
        }
        if !(self.pixel_size_um.is_finite() && self.pixel_size_um > 0.0) {
            return Err(DaqError::InvalidParameter(
                "pixel_size_um must be positive".into(),
            ));
        }
        Ok(())
    }
}

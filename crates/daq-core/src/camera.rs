//! Camera-side value types shared by the driver and its callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DaqError;

/// Phase of the acquisition pipeline.
///
/// Legal edges:
///
/// ```text
/// Ready ──start──> Exposure ──first frame──> Readout
///   ^                 │                         │
///   └─────── stop / timeout / completion ───────┘
///
/// any ──teardown failure──> Fault   (absorbing)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AcquisitionStatus {
    #[default]
    Ready,
    Exposure,
    Readout,
    Fault,
}

impl AcquisitionStatus {
    /// Whether a run is in progress.
    pub fn is_running(self) -> bool {
        matches!(self, AcquisitionStatus::Exposure | AcquisitionStatus::Readout)
    }

    /// Whether `next` is an edge of the acquisition state machine.
    ///
    /// Self-transitions are not edges. `Fault` has no outgoing edge.
    pub fn can_transition_to(self, next: AcquisitionStatus) -> bool {
        use AcquisitionStatus::*;
        match (self, next) {
            (Fault, _) => false,
            (_, Fault) => true,
            (Ready, Exposure) => true,
            (Exposure, Readout) | (Exposure, Ready) => true,
            (Readout, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AcquisitionStatus::Ready => "Ready",
            AcquisitionStatus::Exposure => "Exposure",
            AcquisitionStatus::Readout => "Readout",
            AcquisitionStatus::Fault => "Fault",
        };
        f.write_str(label)
    }
}

/// Acquisition timing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free running, timed by the camera.
    #[default]
    Internal,
    /// Exposure lasts as long as the external trigger signal is active.
    ExternalGate,
    /// Each external trigger starts one timed exposure.
    ExternalTriggerSingle,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TriggerMode::Internal => "internal",
            TriggerMode::ExternalGate => "external_gate",
            TriggerMode::ExternalTriggerSingle => "external_trigger_single",
        };
        f.write_str(label)
    }
}

impl FromStr for TriggerMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "internal" | "int" => Ok(TriggerMode::Internal),
            "external_gate" | "gate" => Ok(TriggerMode::ExternalGate),
            "external_trigger_single" | "external" | "single" => {
                Ok(TriggerMode::ExternalTriggerSingle)
            }
            other => Err(DaqError::InvalidParameter(format!(
                "unknown trigger mode '{}'",
                other
            ))),
        }
    }
}

/// Pixel depth delivered by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    Bpp8,
    Bpp10,
    Bpp12,
    /// 16 bit container (Basler delivers 12 significant bits in it).
    Bpp16,
}

impl ImageType {
    /// Bytes one pixel occupies in the transferred payload.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ImageType::Bpp8 => 1,
            ImageType::Bpp10 | ImageType::Bpp12 | ImageType::Bpp16 => 2,
        }
    }
}

/// Frame geometry in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Exact byte count of one frame: `width × height × bytes_per_pixel`.
    ///
    /// Returns `None` on overflow.
    pub fn frame_bytes(self, image_type: ImageType) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(image_type.bytes_per_pixel())
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Static identification of the connected detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorInfo {
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    pub ip_address: String,
}

/// Metadata handed to the frame pool with each completed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    /// Acquisition frame number, contiguous from 0 within a run.
    pub frame_nb: u64,
    /// Wall clock time the frame was copied into the pool.
    pub timestamp: DateTime<Utc>,
    /// Time elapsed since the run's start timestamp.
    pub elapsed: Duration,
    pub size: ImageSize,
    pub image_type: ImageType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_edges() {
        use AcquisitionStatus::*;
        assert!(Ready.can_transition_to(Exposure));
        assert!(Exposure.can_transition_to(Readout));
        assert!(Readout.can_transition_to(Ready));
        assert!(Exposure.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Fault));

        assert!(!Ready.can_transition_to(Readout));
        assert!(!Readout.can_transition_to(Exposure));
        assert!(!Ready.can_transition_to(Ready));
        assert!(!Fault.can_transition_to(Ready));
    }

    #[test]
    fn trigger_mode_parsing() {
        assert_eq!("internal".parse::<TriggerMode>().unwrap(), TriggerMode::Internal);
        assert_eq!(
            "External-Gate".parse::<TriggerMode>().unwrap(),
            TriggerMode::ExternalGate
        );
        assert_eq!(
            "external_trigger_single".parse::<TriggerMode>().unwrap(),
            TriggerMode::ExternalTriggerSingle
        );
        assert!("sometimes".parse::<TriggerMode>().is_err());
    }

    #[test]
    fn frame_bytes_uses_pixel_depth() {
        let size = ImageSize::new(1392, 1040);
        assert_eq!(size.frame_bytes(ImageType::Bpp16), Some(1392 * 1040 * 2));
        assert_eq!(size.frame_bytes(ImageType::Bpp8), Some(1392 * 1040));
        assert_eq!(
            ImageSize::new(u32::MAX, u32::MAX).frame_bytes(ImageType::Bpp16),
            None
        );
    }
}

//! Device session: camera lifecycle and GenICam property glue.
//!
//! The acquisition controller talks to the camera through [`DeviceSession`].
//! [`GenicamCamera`] implements it once, on top of the small [`FeatureAccess`]
//! node interface, so the Basler specific mapping (exposure formula, trigger
//! modes, pixel depth) is shared by the pylon transport and the in-memory fake.

use daq_core::{DaqError, DaqResult, DetectorInfo, ImageSize, ImageType, TriggerMode};
use tracing::{debug, info};

/// GenICam node names used by this driver.
pub mod nodes {
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    pub const PIXEL_SIZE: &str = "PixelSize";
    pub const OFFSET_X: &str = "OffsetX";
    pub const OFFSET_Y: &str = "OffsetY";
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const PAYLOAD_SIZE: &str = "PayloadSize";
    pub const TRIGGER_SELECTOR: &str = "TriggerSelector";
    pub const TRIGGER_MODE: &str = "TriggerMode";
    pub const ACQUISITION_MODE: &str = "AcquisitionMode";
    pub const ACQUISITION_FRAME_RATE_ENABLE: &str = "AcquisitionFrameRateEnable";
    pub const EXPOSURE_MODE: &str = "ExposureMode";
    pub const EXPOSURE_TIME_ABS: &str = "ExposureTimeAbs";
    pub const EXPOSURE_TIME_BASE_ABS: &str = "ExposureTimeBaseAbs";
    pub const EXPOSURE_TIME_RAW: &str = "ExposureTimeRaw";
    pub const RESULTING_FRAME_RATE_ABS: &str = "ResultingFrameRateAbs";
    pub const ACQUISITION_START: &str = "AcquisitionStart";
    pub const ACQUISITION_STOP: &str = "AcquisitionStop";
}

/// Longest exposure the GigE protocol allows, in milliseconds.
///
/// Also the bound of every poll: no legitimate transfer takes longer.
pub const MAX_EXPOSURE_MS: f64 = 10_000.0;

/// Smallest exposure time base the camera accepts, in microseconds.
const MIN_EXPOSURE_TIME_BASE_US: f64 = 80.0;

/// Raw exposure step used to split a requested exposure, in milliseconds.
const EXPOSURE_RAW_STEP_MS: f64 = 50.0;

/// Typed access to the camera's GenICam node map.
pub trait FeatureAccess: Send {
    fn integer(&self, name: &str) -> DaqResult<i64>;
    fn integer_max(&self, name: &str) -> DaqResult<i64>;
    fn set_integer(&mut self, name: &str, value: i64) -> DaqResult<()>;

    fn float(&self, name: &str) -> DaqResult<f64>;
    fn set_float(&mut self, name: &str, value: f64) -> DaqResult<()>;

    fn set_boolean(&mut self, name: &str, value: bool) -> DaqResult<()>;

    /// Symbolic value of an enumeration node.
    fn enumeration(&self, name: &str) -> DaqResult<String>;
    fn set_enumeration(&mut self, name: &str, value: &str) -> DaqResult<()>;

    /// Execute a command node.
    fn execute(&mut self, name: &str) -> DaqResult<()>;

    /// Identification captured when the device was opened.
    fn device_info(&self) -> DetectorInfo;

    /// Close the device.
    fn close(&mut self) -> DaqResult<()>;
}

/// Camera operations the acquisition controller consumes.
pub trait DeviceSession: Send {
    fn info(&self) -> DetectorInfo;
    /// Bytes required for one full frame at the current geometry and format.
    fn payload_size(&self) -> DaqResult<usize>;
    fn image_size(&self) -> DaqResult<ImageSize>;
    fn image_type(&self) -> DaqResult<ImageType>;
    fn set_exposure_time(&mut self, exposure_ms: f64) -> DaqResult<()>;
    fn exposure_time(&self) -> DaqResult<f64>;
    fn set_trigger_mode(&mut self, mode: TriggerMode) -> DaqResult<()>;
    fn trigger_mode(&self) -> DaqResult<TriggerMode>;
    fn frame_rate(&self) -> DaqResult<f64>;
    /// Arm the camera for continuous acquisition.
    fn acquisition_start(&mut self) -> DaqResult<()>;
    /// Disarm the camera.
    fn acquisition_stop(&mut self) -> DaqResult<()>;
    fn close(&mut self) -> DaqResult<()>;
}

/// Split an exposure into `(ExposureTimeRaw, ExposureTimeBaseAbs µs)`.
///
/// `raw = ceil(ms / 50)` and `base = 1000 · ms / raw`, so that
/// `raw × base` equals the requested exposure in microseconds.
pub fn exposure_components(exposure_ms: f64) -> DaqResult<(i64, f64)> {
    if !exposure_ms.is_finite() || exposure_ms <= 0.0 {
        return Err(DaqError::InvalidParameter(format!(
            "exposure must be positive, got {} ms",
            exposure_ms
        )));
    }
    if exposure_ms > MAX_EXPOSURE_MS {
        return Err(DaqError::InvalidParameter(format!(
            "exposure {} ms exceeds maximum {} ms",
            exposure_ms, MAX_EXPOSURE_MS
        )));
    }

    let raw = (exposure_ms / EXPOSURE_RAW_STEP_MS).ceil().max(1.0) as i64;
    let base_us = 1e3 * exposure_ms / raw as f64;
    Ok((raw, base_us))
}

/// GenICam values `(TriggerMode, AcquisitionFrameRateEnable, ExposureMode)`
/// for a trigger mode. `None` leaves the node untouched.
pub fn trigger_nodes(mode: TriggerMode) -> (&'static str, Option<bool>, Option<&'static str>) {
    match mode {
        TriggerMode::Internal => ("Off", None, None),
        TriggerMode::ExternalGate => ("On", Some(false), Some("TriggerWidth")),
        TriggerMode::ExternalTriggerSingle => ("On", Some(false), Some("Timed")),
    }
}

/// Inverse of [`trigger_nodes`].
pub fn trigger_mode_from_nodes(trigger_mode: &str, exposure_mode: &str) -> TriggerMode {
    if trigger_mode == "Off" {
        TriggerMode::Internal
    } else if exposure_mode == "TriggerWidth" {
        TriggerMode::ExternalGate
    } else {
        TriggerMode::ExternalTriggerSingle
    }
}

/// Map the `PixelSize` node to an image type.
pub fn image_type_from_pixel_size(pixel_size: &str) -> ImageType {
    match pixel_size {
        "Bpp8" => ImageType::Bpp8,
        "Bpp12" => ImageType::Bpp12,
        "Bpp16" => ImageType::Bpp16,
        _ => ImageType::Bpp10,
    }
}

/// Basler GigE camera driven through its GenICam node map.
pub struct GenicamCamera<F: FeatureAccess> {
    features: F,
}

impl<F: FeatureAccess> GenicamCamera<F> {
    pub fn new(features: F) -> Self {
        Self { features }
    }

    /// Put a freshly opened camera into the acquisition configuration:
    /// Mono16, full sensor AOI, free running continuous acquisition with
    /// timed exposure.
    pub fn configure_defaults(&mut self) -> DaqResult<()> {
        use nodes::*;

        info!("Setting image format and AOI");
        self.features.set_enumeration(PIXEL_FORMAT, "Mono16")?;
        self.features.set_integer(OFFSET_X, 0)?;
        self.features.set_integer(OFFSET_Y, 0)?;
        let width = self.features.integer_max(WIDTH)?;
        self.features.set_integer(WIDTH, width)?;
        let height = self.features.integer_max(HEIGHT)?;
        self.features.set_integer(HEIGHT, height)?;

        info!("Setting continuous frame mode");
        self.features
            .set_enumeration(TRIGGER_SELECTOR, "AcquisitionStart")?;
        self.features.set_enumeration(TRIGGER_MODE, "Off")?;
        self.features.set_enumeration(ACQUISITION_MODE, "Continuous")?;
        self.features.set_enumeration(EXPOSURE_MODE, "Timed")?;
        Ok(())
    }

    /// Node map access, for diagnostics.
    pub fn features(&self) -> &F {
        &self.features
    }
}

impl<F: FeatureAccess> DeviceSession for GenicamCamera<F> {
    fn info(&self) -> DetectorInfo {
        self.features.device_info()
    }

    fn payload_size(&self) -> DaqResult<usize> {
        let size = self.features.integer(nodes::PAYLOAD_SIZE)?;
        usize::try_from(size)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| DaqError::InvalidParameter(format!("invalid payload size {}", size)))
    }

    fn image_size(&self) -> DaqResult<ImageSize> {
        let width = self.features.integer_max(nodes::WIDTH)?;
        let height = self.features.integer_max(nodes::HEIGHT)?;
        match (u32::try_from(width), u32::try_from(height)) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok(ImageSize::new(w, h)),
            _ => Err(DaqError::InvalidParameter(format!(
                "invalid sensor geometry {}x{}",
                width, height
            ))),
        }
    }

    fn image_type(&self) -> DaqResult<ImageType> {
        let pixel_size = self.features.enumeration(nodes::PIXEL_SIZE)?;
        Ok(image_type_from_pixel_size(&pixel_size))
    }

    fn set_exposure_time(&mut self, exposure_ms: f64) -> DaqResult<()> {
        let (raw, _) = exposure_components(exposure_ms)?;
        debug!(exposure_ms, raw, "setting exposure");

        self.features
            .set_float(nodes::EXPOSURE_TIME_BASE_ABS, MIN_EXPOSURE_TIME_BASE_US)?;
        self.features.set_integer(nodes::EXPOSURE_TIME_RAW, raw)?;
        // The camera may round the raw value; derive the base from what it kept
        let kept_raw = self.features.integer(nodes::EXPOSURE_TIME_RAW)?.max(1);
        self.features.set_float(
            nodes::EXPOSURE_TIME_BASE_ABS,
            1e3 * exposure_ms / kept_raw as f64,
        )
    }

    fn exposure_time(&self) -> DaqResult<f64> {
        Ok(1e-3 * self.features.float(nodes::EXPOSURE_TIME_ABS)?)
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> DaqResult<()> {
        let (trigger, frame_rate_enable, exposure_mode) = trigger_nodes(mode);
        debug!(%mode, "setting trigger mode");

        self.features.set_enumeration(nodes::TRIGGER_MODE, trigger)?;
        if let Some(enable) = frame_rate_enable {
            self.features
                .set_boolean(nodes::ACQUISITION_FRAME_RATE_ENABLE, enable)?;
        }
        if let Some(exposure_mode) = exposure_mode {
            self.features
                .set_enumeration(nodes::EXPOSURE_MODE, exposure_mode)?;
        }
        Ok(())
    }

    fn trigger_mode(&self) -> DaqResult<TriggerMode> {
        let trigger = self.features.enumeration(nodes::TRIGGER_MODE)?;
        let exposure_mode = self.features.enumeration(nodes::EXPOSURE_MODE)?;
        Ok(trigger_mode_from_nodes(&trigger, &exposure_mode))
    }

    fn frame_rate(&self) -> DaqResult<f64> {
        self.features.float(nodes::RESULTING_FRAME_RATE_ABS)
    }

    fn acquisition_start(&mut self) -> DaqResult<()> {
        self.features.execute(nodes::ACQUISITION_START)
    }

    fn acquisition_stop(&mut self) -> DaqResult<()> {
        self.features.execute(nodes::ACQUISITION_STOP)
    }

    fn close(&mut self) -> DaqResult<()> {
        self.features.close()
    }
}

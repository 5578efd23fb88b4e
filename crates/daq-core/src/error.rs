//! Error types shared by the acquisition crates.
//!
//! This module defines `DaqError`, the single error type returned by the frame
//! pool, the camera driver and the acquisition controller. It is built with
//! `thiserror` so that every layer can propagate failures with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Driver`**: a structured failure reported by the vendor transport or
//!   the camera itself (SDK return codes, GenICam node errors, missing device).
//!   The [`DriverErrorKind`] tells construction failures from runtime ones.
//! - **`OutOfMemory`**: a grab buffer could not be allocated. Always a hard
//!   failure of the start sequence.
//! - **`AcquisitionBusy`** / **`InvalidStateTransition`**: the request does not
//!   fit the current acquisition state.
//! - **`InvalidParameter`**: a caller supplied value was rejected before it
//!   reached the hardware.
//! - **`TransferProtocol`**: the streaming session was driven outside of its
//!   queue/retrieve protocol (for example deregistering a queued buffer).
//! - **`ShutdownFailed`**: teardown ran to the end but one or more steps failed.
//! - **`ActorGone`**: the acquisition task is no longer running.

use crate::camera::AcquisitionStatus;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Communication,
    Shutdown,
    Hardware,
    Timeout,
    NotFound,
    InvalidParameter,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::NotFound => "not_found",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the acquisition error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for camera acquisition.
///
/// Errors fall into three broad categories:
///
/// 1. **Setup Errors** - `Driver` with kind `Initialization`/`NotFound`
///    - Occur while the transport is created or the device is opened
///    - Recovery: fix the network/device and construct the driver again
///
/// 2. **Start Errors** - `OutOfMemory`, `Driver`, `TransferProtocol`
///    - Occur while buffers are registered or the camera is armed
///    - Partial registrations are rolled back before the error is returned
///
/// 3. **Runtime Errors** - `AcquisitionBusy`, `InvalidParameter`, `ActorGone`
///    - Usually caused by the calling sequence
///    - Recovery: wait for the run to finish or stop it first
#[derive(Error, Debug)]
pub enum DaqError {
    /// Structured driver error with category.
    #[error("{0}")]
    Driver(DriverError),

    /// A grab buffer could not be allocated.
    ///
    /// **Error Type**: Permanent for this start attempt.
    ///
    /// **Recovery Strategy**: Reduce the buffer count or the frame geometry.
    #[error("Out of memory allocating a {bytes} byte grab buffer")]
    OutOfMemory { bytes: usize },

    /// An acquisition is already running.
    ///
    /// Returned by `start()` while the controller is in `Exposure` or
    /// `Readout`, and by setters that must not change during a run. The
    /// running acquisition is left untouched.
    #[error("Acquisition already running (status: {0})")]
    AcquisitionBusy(AcquisitionStatus),

    /// The controller refused a state change that is not an edge of the
    /// acquisition state machine.
    #[error("Invalid acquisition state transition {from} -> {to}")]
    InvalidStateTransition {
        from: AcquisitionStatus,
        to: AcquisitionStatus,
    },

    /// A caller supplied value was rejected.
    ///
    /// # Example
    ///
    /// ```rust
    /// use daq_core::error::DaqError;
    ///
    /// fn validate_exposure(exposure_ms: f64) -> Result<(), DaqError> {
    ///     if exposure_ms <= 0.0 {
    ///         return Err(DaqError::InvalidParameter(
    ///             "exposure_ms must be positive".into()
    ///         ));
    ///     }
    ///     Ok(())
    /// }
    /// ```
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The streaming session was driven outside of its protocol.
    ///
    /// **Error Type**: Permanent - indicates a bug in the caller.
    #[error("Transfer protocol violation: {0}")]
    TransferProtocol(String),

    /// Frame does not fit the destination slot of the frame ring.
    #[error("Frame size {bytes} bytes exceeds slot capacity {max_bytes} bytes")]
    FrameTooLarge { bytes: usize, max_bytes: usize },

    /// Teardown encountered errors.
    ///
    /// Every teardown step was still attempted; this carries all failures in
    /// the order they happened.
    #[error("Shutdown failed with {} error(s): {}", .0.len(), join_errors(.0))]
    ShutdownFailed(Vec<DaqError>),

    /// The acquisition task is not running any more.
    #[error("Acquisition controller is not running")]
    ActorGone,
}

fn join_errors(errors: &[DaqError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DaqError {
    /// Shorthand for a [`DriverError`] wrapped in [`DaqError::Driver`].
    pub fn driver(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        DaqError::Driver(DriverError::new(driver_type, kind, message))
    }

    /// Collapse a list of teardown errors into one result.
    ///
    /// An empty list is success and a single error is returned unchanged.
    pub fn from_teardown(mut errors: Vec<DaqError>) -> DaqResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }
}

impl From<DriverError> for DaqError {
    fn from(err: DriverError) -> Self {
        DaqError::Driver(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DaqError::driver(
            "basler",
            DriverErrorKind::Initialization,
            "failed to create transport layer",
        );
        assert!(err
            .to_string()
            .contains("Driver 'basler' initialization error"));
    }

    #[test]
    fn test_busy_error_mentions_status() {
        let err = DaqError::AcquisitionBusy(AcquisitionStatus::Exposure);
        assert_eq!(err.to_string(), "Acquisition already running (status: Exposure)");
    }

    #[test]
    fn test_shutdown_failed_lists_all_errors() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::TransferProtocol("buffer still queued".into()),
            DaqError::driver("basler", DriverErrorKind::Shutdown, "close failed"),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("Shutdown failed with 2 error(s)"));
        assert!(text.contains("buffer still queued"));
        assert!(text.contains("close failed"));
    }

    #[test]
    fn test_from_teardown() {
        assert!(DaqError::from_teardown(Vec::new()).is_ok());

        let single = DaqError::from_teardown(vec![DaqError::ActorGone]).unwrap_err();
        assert!(matches!(single, DaqError::ActorGone));

        let many =
            DaqError::from_teardown(vec![DaqError::ActorGone, DaqError::ActorGone]).unwrap_err();
        assert!(matches!(many, DaqError::ShutdownFailed(ref v) if v.len() == 2));
    }
}

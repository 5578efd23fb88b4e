//! Basler GigE Camera Driver (Componentized)
//!
//! Components:
//! - Device: GenICam node map glue (geometry, exposure, trigger, pixel depth)
//! - Stream: grab buffer registration and the queue/retrieve protocol
//! - Acquisition: the controller task that owns both and drives a run
//!
//! Callers only hold a [`BaslerCamera`]. Every operation is a message to the
//! controller task, so `start`, `stop` and frame polling never race.
//!
//! ```no_run
//! # #[cfg(feature = "mock")]
//! # async fn demo() -> daq_core::DaqResult<()> {
//! use daq_driver_basler::components::mock::{MockBackend, RecordingSink};
//! use daq_driver_basler::{AcquisitionSettings, BaslerCamera};
//! use std::sync::Arc;
//!
//! let backend = MockBackend::new(640, 480);
//! let sink = Arc::new(RecordingSink::new(640 * 480 * 2));
//! let camera = BaslerCamera::with_backend(
//!     backend.nodes.clone(),
//!     backend.stream.clone(),
//!     sink.clone(),
//!     AcquisitionSettings::default(),
//! )?;
//!
//! camera.set_nb_frames(10).await?;
//! camera.start().await?;
//! camera.wait_until_ready(std::time::Duration::from_secs(5)).await?;
//! assert_eq!(sink.ready_frames().len(), 10);
//! camera.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod components;
pub mod settings;

use daq_core::{
    AcquisitionStatus, DaqError, DaqResult, DetectorInfo, FrameSink, ImageSize, ImageType,
    TriggerMode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use crate::components::acquisition::{
    AcqCommand, AcquisitionController, AcquisitionSnapshot, RunEnd, RunSummary,
};
use crate::components::device::{DeviceSession, FeatureAccess, GenicamCamera};
use crate::components::stream::StreamingSession;
pub use crate::settings::AcquisitionSettings;

/// Handle to one Basler camera and its acquisition controller task.
///
/// Dropping the handle stops any run and closes the camera in the
/// background; call [`shutdown`](Self::shutdown) to observe close errors.
pub struct BaslerCamera {
    commands: mpsc::Sender<AcqCommand>,
    snapshot: watch::Receiver<AcquisitionSnapshot>,
    task: Option<JoinHandle<()>>,
    pixel_size_um: f64,
}

impl BaslerCamera {
    /// Spawn the controller for already opened sessions.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        device: Box<dyn DeviceSession>,
        stream: Box<dyn StreamingSession>,
        sink: Arc<dyn FrameSink>,
        settings: AcquisitionSettings,
    ) -> DaqResult<Self> {
        settings.validate()?;

        let (commands, receiver) = mpsc::channel(settings.command_channel_capacity);
        let pixel_size_um = settings.pixel_size_um;
        let (controller, snapshot) = AcquisitionController::new(device, stream, sink, settings);
        let task = tokio::spawn(controller.run(receiver));

        Ok(Self {
            commands,
            snapshot,
            task: Some(task),
            pixel_size_um,
        })
    }

    /// Configure a freshly opened camera for acquisition and spawn its
    /// controller.
    pub fn with_backend<F, S>(
        features: F,
        stream: S,
        sink: Arc<dyn FrameSink>,
        settings: AcquisitionSettings,
    ) -> DaqResult<Self>
    where
        F: FeatureAccess + 'static,
        S: StreamingSession + 'static,
    {
        let mut camera = GenicamCamera::new(features);
        camera.configure_defaults()?;
        let info = camera.info();
        info!(
            vendor = %info.vendor,
            model = %info.model,
            ip = %info.ip_address,
            "Camera configured"
        );
        Self::spawn(Box::new(camera), Box::new(stream), sink, settings)
    }

    /// Open the GigE camera at `host` (IPv4 address or DNS name).
    #[cfg(feature = "pylon_sdk")]
    pub async fn open(
        host: &str,
        sink: Arc<dyn FrameSink>,
        settings: AcquisitionSettings,
    ) -> DaqResult<Self> {
        let host = host.to_string();
        let (features, stream) =
            tokio::task::spawn_blocking(move || components::pylon::PylonDevice::open(&host))
        .await
        .map_err(|e| {
            DaqError::driver(
                components::pylon::DRIVER,
                daq_core::DriverErrorKind::Initialization,
                format!("open task failed: {}", e),
            )
        })??;
        Self::with_backend(features, stream, sink, settings)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> AcqCommand,
    ) -> DaqResult<T> {
        let (response, reply) = oneshot::channel();
        self.commands
            .send(command(response))
            .await
            .map_err(|_| DaqError::ActorGone)?;
        reply.await.map_err(|_| DaqError::ActorGone)
    }

    /// Start a run of [`nb_frames`](Self::nb_frames) frames.
    ///
    /// Returns once the camera is armed. Rejected with
    /// [`DaqError::AcquisitionBusy`] while a run is in progress.
    pub async fn start(&self) -> DaqResult<()> {
        self.request(|response| AcqCommand::Start { response })
            .await?
    }

    /// Stop the current run. A no-op when no run is in progress.
    pub async fn stop(&self) -> DaqResult<()> {
        self.request(|response| AcqCommand::Stop { response })
            .await?
    }

    pub async fn set_nb_frames(&self, nb_frames: u64) -> DaqResult<()> {
        self.request(|response| AcqCommand::SetNbFrames {
            nb_frames,
            response,
        })
        .await?
    }

    pub async fn nb_frames(&self) -> DaqResult<u64> {
        self.request(|response| AcqCommand::GetNbFrames { response })
            .await
    }

    /// Set the exposure in milliseconds, `0 < exposure_ms <= 10000`.
    pub async fn set_exposure_time(&self, exposure_ms: f64) -> DaqResult<()> {
        self.request(|response| AcqCommand::SetExposureTime {
            exposure_ms,
            response,
        })
        .await?
    }

    /// Exposure in milliseconds as reported by the camera.
    pub async fn exposure_time(&self) -> DaqResult<f64> {
        self.request(|response| AcqCommand::GetExposureTime { response })
            .await?
    }

    pub async fn set_trigger_mode(&self, mode: TriggerMode) -> DaqResult<()> {
        self.request(|response| AcqCommand::SetTriggerMode { mode, response })
            .await?
    }

    pub async fn trigger_mode(&self) -> DaqResult<TriggerMode> {
        self.request(|response| AcqCommand::GetTriggerMode { response })
            .await?
    }

    /// Full sensor geometry.
    pub async fn image_size(&self) -> DaqResult<ImageSize> {
        self.request(|response| AcqCommand::GetImageSize { response })
            .await?
    }

    pub async fn image_type(&self) -> DaqResult<ImageType> {
        self.request(|response| AcqCommand::GetImageType { response })
            .await?
    }

    /// Frame rate the camera achieves with the current settings, in Hz.
    pub async fn frame_rate(&self) -> DaqResult<f64> {
        self.request(|response| AcqCommand::GetFrameRate { response })
            .await?
    }

    pub async fn detector_info(&self) -> DaqResult<DetectorInfo> {
        self.request(|response| AcqCommand::GetDetectorInfo { response })
            .await
    }

    /// Vendor name.
    pub async fn detector_type(&self) -> DaqResult<String> {
        Ok(self.detector_info().await?.vendor)
    }

    /// Model name.
    pub async fn detector_model(&self) -> DaqResult<String> {
        Ok(self.detector_info().await?.model)
    }

    /// Physical pixel pitch `(x, y)` in micrometres.
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.pixel_size_um, self.pixel_size_um)
    }

    pub fn status(&self) -> AcquisitionStatus {
        self.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> AcquisitionSnapshot {
        *self.snapshot.borrow()
    }

    /// Receiver notified on every state or frame counter change.
    pub fn subscribe(&self) -> watch::Receiver<AcquisitionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until no run is in progress and return the final snapshot.
    pub async fn wait_until_ready(&self, timeout: Duration) -> DaqResult<AcquisitionSnapshot> {
        let mut snapshot = self.snapshot.clone();
        // Copy the value out while the watch borrow is still alive
        let wait = async {
            snapshot
                .wait_for(|s| !s.status.is_running())
                .await
                .map(|current| *current)
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(current)) => Ok(current),
            Ok(Err(_)) => Err(DaqError::ActorGone),
            Err(_) => Err(DaqError::driver(
                "basler",
                daq_core::DriverErrorKind::Timeout,
                format!("acquisition still running after {:?}", timeout),
            )),
        }
    }

    /// Stop any run, close the stream grabber and the camera, and wait for
    /// the controller task to exit.
    pub async fn shutdown(mut self) -> DaqResult<()> {
        let result = self
            .request(|response| AcqCommand::Shutdown { response })
            .await;
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "Acquisition controller task ended abnormally");
            }
        }
        result?
    }
}

impl Drop for BaslerCamera {
    fn drop(&mut self) {
        if self.task.is_some() {
            // Closing the channel makes the controller stop and close in the
            // background.
            info!("BaslerCamera dropped without shutdown()");
        }
    }
}

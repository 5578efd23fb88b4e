//! Opening the configured camera.
//!
//! With the `pylon_sdk` feature the camera at `camera.ip` is opened through
//! the pylon transport. Without it an in-memory camera with the sensor of a
//! scA640-74gm stands in, so the whole pipeline can run without hardware.

use crate::config::AppConfig;
use anyhow::Context;
use daq_driver_basler::{AcquisitionSnapshot, BaslerCamera};
use daq_pool::FrameRing;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Sensor of the in-memory camera.
#[cfg(all(feature = "mock", not(feature = "pylon_sdk")))]
pub const MOCK_SENSOR: (u32, u32) = (659, 494);

/// Allocate the frame ring described by the configuration.
pub fn frame_ring(config: &AppConfig) -> FrameRing {
    FrameRing::new(
        config.frame_ring.nb_buffers,
        config.frame_ring.max_frame_bytes,
    )
}

/// Open the camera and spawn its acquisition controller writing into `ring`.
#[cfg(feature = "pylon_sdk")]
pub async fn open(config: &AppConfig, ring: &FrameRing) -> anyhow::Result<BaslerCamera> {
    info!(ip = %config.camera.ip, "Opening Basler camera");
    BaslerCamera::open(
        &config.camera.ip,
        Arc::new(ring.clone()),
        config.acquisition.clone(),
    )
    .await
    .with_context(|| format!("failed to open camera at {}", config.camera.ip))
}

/// Open the in-memory camera and spawn its acquisition controller writing
/// into `ring`.
#[cfg(all(feature = "mock", not(feature = "pylon_sdk")))]
pub async fn open(config: &AppConfig, ring: &FrameRing) -> anyhow::Result<BaslerCamera> {
    use daq_driver_basler::components::mock::MockBackend;

    let (width, height) = MOCK_SENSOR;
    info!(ip = %config.camera.ip, width, height, "Opening simulated camera");
    let backend = MockBackend::new(width, height);
    backend.nodes.set_ip_address(&config.camera.ip);
    BaslerCamera::with_backend(
        backend.nodes,
        backend.stream,
        Arc::new(ring.clone()),
        config.acquisition.clone(),
    )
    .context("failed to configure simulated camera")
}

/// Built without a camera backend.
#[cfg(not(any(feature = "mock", feature = "pylon_sdk")))]
pub async fn open(_config: &AppConfig, _ring: &FrameRing) -> anyhow::Result<BaslerCamera> {
    anyhow::bail!("built without a camera backend; enable the `mock` or `pylon_sdk` feature")
}

/// Wait for the running acquisition to end.
///
/// Every transfer the camera hands back publishes a snapshot, so the wait is
/// bounded by progress rather than by the frame count: it fails only when no
/// snapshot arrives for `stall`.
pub async fn wait_for_run_end(
    cam: &BaslerCamera,
    stall: Duration,
) -> anyhow::Result<AcquisitionSnapshot> {
    let mut updates = cam.subscribe();
    loop {
        let current = *updates.borrow_and_update();
        if !current.status.is_running() {
            return Ok(current);
        }
        match tokio::time::timeout(stall, updates.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => anyhow::bail!("camera controller exited during the run"),
            Err(_) => anyhow::bail!(
                "camera stalled: no transfer for {:?} at frame {}",
                stall,
                current.frame_counter
            ),
        }
    }
}

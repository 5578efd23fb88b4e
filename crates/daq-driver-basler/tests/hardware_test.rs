#![cfg(all(feature = "pylon_sdk", feature = "hardware_tests"))]

//! Basler hardware smoke test.
//!
//! Run with:
//! `BASLER_CAMERA_IP=192.168.0.10 cargo test -p daq-driver-basler --test hardware_test --features pylon_sdk,hardware_tests -- --nocapture`

use daq_core::{AcquisitionStatus, DaqResult, FrameSink, ImageType};
use daq_driver_basler::{AcquisitionSettings, BaslerCamera, RunEnd};
use daq_pool::FrameRing;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn basler_hardware_smoke() -> DaqResult<()> {
    let Ok(ip) = std::env::var("BASLER_CAMERA_IP") else {
        eprintln!("Skipping basler_hardware_smoke (set BASLER_CAMERA_IP to enable real camera check)");
        return Ok(());
    };

    // Largest Basler GigE sensor this driver targets, Mono16
    let ring = FrameRing::new(4, 1392 * 1040 * 2);
    let camera = BaslerCamera::open(
        &ip,
        Arc::new(ring.clone()),
        AcquisitionSettings {
            buffer_count: 2,
            ..Default::default()
        },
    )
    .await?;

    let info = camera.detector_info().await?;
    eprintln!("Connected to {} {} ({})", info.vendor, info.model, info.serial_number);
    assert_eq!(camera.image_type().await?, ImageType::Bpp16);

    camera.set_exposure_time(10.0).await?;
    let exposure = camera.exposure_time().await?;
    assert!((exposure - 10.0).abs() < 0.1, "exposure read back {}", exposure);

    camera.set_nb_frames(5).await?;
    camera.start().await?;
    let snapshot = camera.wait_until_ready(Duration::from_secs(30)).await?;

    assert_eq!(snapshot.status, AcquisitionStatus::Ready);
    let run = snapshot.last_run.expect("run summary after wait");
    assert_eq!(run.end, RunEnd::Completed);
    assert_eq!(ring.last_frame_ready(), Some(4));
    assert!(ring.start_timestamp().is_some());

    camera.shutdown().await
}

//! End-to-end run of the application wiring against the simulated camera.

#![cfg(all(feature = "mock", not(feature = "pylon_sdk")))]

use basler_daq::camera::{self, MOCK_SENSOR};
use basler_daq::config::{AppConfig, ApplicationConfig, CameraConfig, FrameRingConfig};
use daq_core::{AcquisitionStatus, FrameSink, ImageSize};
use daq_driver_basler::components::mock::{MockBackend, MockTransfer};
use daq_driver_basler::{AcquisitionSettings, BaslerCamera, RunEnd};
use daq_pool::FrameRing;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn config(max_frame_bytes: usize) -> AppConfig {
    AppConfig {
        application: ApplicationConfig::default(),
        camera: CameraConfig {
            ip: "10.1.2.3".to_string(),
        },
        acquisition: AcquisitionSettings {
            buffer_count: 2,
            poll_timeout: Duration::from_millis(500),
            ..Default::default()
        },
        frame_ring: FrameRingConfig {
            nb_buffers: 4,
            max_frame_bytes,
        },
    }
}

#[tokio::test]
async fn grab_into_configured_ring() {
    let config = config(FrameRingConfig::default().max_frame_bytes);
    let ring = camera::frame_ring(&config);
    assert_eq!(ring.nb_buffers(), 4);

    let cam = assert_ok!(camera::open(&config, &ring).await);
    let (width, height) = MOCK_SENSOR;
    assert_eq!(cam.image_size().await.unwrap(), ImageSize::new(width, height));
    assert_eq!(cam.detector_info().await.unwrap().ip_address, "10.1.2.3");

    cam.set_nb_frames(6).await.unwrap();
    cam.start().await.unwrap();
    let snapshot = cam.wait_until_ready(Duration::from_secs(10)).await.unwrap();

    let run = snapshot.last_run.unwrap();
    assert_eq!(run.end, RunEnd::Completed);
    assert_eq!(run.frames_acquired, 6);
    assert_eq!(ring.last_frame_ready(), Some(5));
    let (_, data) = ring.read_frame(5).unwrap();
    assert_eq!(data.len(), (width * height * 2) as usize);
    assert!(ring.start_timestamp().is_some());

    assert_ok!(cam.shutdown().await);
}

#[tokio::test]
async fn undersized_ring_is_reported_at_start() {
    let config = config(1024);
    let ring = camera::frame_ring(&config);
    let cam = camera::open(&config, &ring).await.unwrap();

    let err = assert_err!(cam.start().await);
    assert!(err.to_string().contains("exceeds slot capacity"), "{}", err);
    assert_eq!(ring.total_ready(), 0);

    assert_ok!(cam.shutdown().await);
}

fn simulated(backend: &MockBackend, poll_timeout: Duration) -> (BaslerCamera, FrameRing) {
    let ring = FrameRing::new(4, 16 * 8 * 2);
    let cam = BaslerCamera::with_backend(
        backend.nodes.clone(),
        backend.stream.clone(),
        Arc::new(ring.clone()),
        AcquisitionSettings {
            buffer_count: 1,
            poll_timeout,
            ..Default::default()
        },
    )
    .unwrap();
    (cam, ring)
}

#[tokio::test]
async fn run_wait_outlasts_many_failed_transfers() {
    let backend = MockBackend::new(16, 8);
    backend.stream.set_frame_interval(Duration::from_millis(50));
    let failures = (0..10).map(|code| MockTransfer::Fail {
        code,
        description: "resend limit".to_string(),
    });
    backend.stream.push_transfers(failures);
    let poll_timeout = Duration::from_millis(150);
    let (cam, ring) = simulated(&backend, poll_timeout);

    // Twelve transfers of 50 ms outlast poll_timeout * (frames + 1)
    cam.set_nb_frames(2).await.unwrap();
    cam.start().await.unwrap();
    let snapshot = assert_ok!(camera::wait_for_run_end(&cam, poll_timeout * 2).await);

    let run = snapshot.last_run.unwrap();
    assert_eq!(run.end, RunEnd::Completed);
    assert_eq!(run.frames_acquired, 2);
    assert_eq!(run.failed_transfers, 10);
    assert_eq!(ring.last_frame_ready(), Some(1));

    assert_ok!(cam.shutdown().await);
}

#[tokio::test]
async fn run_wait_reports_stalled_camera() {
    let backend = MockBackend::new(16, 8);
    backend.stream.push_transfers([MockTransfer::Timeout]);
    let (cam, _ring) = simulated(&backend, Duration::from_secs(2));

    cam.set_nb_frames(1).await.unwrap();
    cam.start().await.unwrap();
    let err = assert_err!(camera::wait_for_run_end(&cam, Duration::from_millis(100)).await);
    assert!(err.to_string().contains("stalled"), "{}", err);
    assert!(cam.status().is_running());

    assert_ok!(cam.stop().await);
    assert_eq!(cam.status(), AcquisitionStatus::Ready);
    assert_ok!(cam.shutdown().await);
}

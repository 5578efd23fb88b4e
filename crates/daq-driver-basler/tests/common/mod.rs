//! Shared test utilities for the Basler driver integration tests.
//!
//! - `TestRig`: camera handle wired to a mock backend and a recording sink
//! - `describe`: compact rendering of the mock event log for sequence asserts

#![allow(dead_code)] // Utilities may not all be used in every test file

use daq_driver_basler::components::mock::{MockBackend, MockEvent, RecordingSink};
use daq_driver_basler::components::stream::GrabStatus;
use daq_driver_basler::{AcquisitionSettings, BaslerCamera};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const WIDTH: u32 = 16;
pub const HEIGHT: u32 = 8;
/// Mono16 full frame.
pub const FRAME_BYTES: usize = (WIDTH * HEIGHT * 2) as usize;

pub const POLL_TIMEOUT: Duration = Duration::from_millis(200);
/// Upper bound for any run in these tests.
pub const RUN_DEADLINE: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn settings(buffer_count: usize) -> AcquisitionSettings {
    AcquisitionSettings {
        buffer_count,
        poll_timeout: POLL_TIMEOUT,
        ..Default::default()
    }
}

pub struct TestRig {
    pub camera: BaslerCamera,
    pub backend: MockBackend,
    pub sink: Arc<RecordingSink>,
}

impl TestRig {
    pub fn new(buffer_count: usize) -> Self {
        Self::with_settings(settings(buffer_count))
    }

    pub fn with_settings(settings: AcquisitionSettings) -> Self {
        init_tracing();
        let backend = MockBackend::new(WIDTH, HEIGHT);
        let sink = Arc::new(RecordingSink::new(FRAME_BYTES));
        let camera = BaslerCamera::with_backend(
            backend.nodes.clone(),
            backend.stream.clone(),
            sink.clone(),
            settings,
        )
        .expect("mock camera should open");
        Self {
            camera,
            backend,
            sink,
        }
    }

    /// Run `nb_frames` frames to the end and return the final snapshot.
    pub async fn run(&self, nb_frames: u64) -> daq_driver_basler::AcquisitionSnapshot {
        self.camera.set_nb_frames(nb_frames).await.unwrap();
        self.camera.start().await.unwrap();
        self.camera.wait_until_ready(RUN_DEADLINE).await.unwrap()
    }

    pub fn events(&self) -> Vec<String> {
        describe(&self.backend.events())
    }
}

/// Render events as short strings, e.g. `queue#0` or `exec:AcquisitionStart`.
pub fn describe(events: &[MockEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            MockEvent::Prepare {
                max_buffer_size,
                max_buffer_count,
            } => format!("prepare({},{})", max_buffer_size, max_buffer_count),
            MockEvent::Register(h) => format!("register#{}", h.index()),
            MockEvent::Queue(h) => format!("queue#{}", h.index()),
            MockEvent::Retrieve(h, GrabStatus::Grabbed { .. }) => {
                format!("grabbed#{}", h.index())
            }
            MockEvent::Retrieve(h, GrabStatus::Failed { .. }) => format!("failed#{}", h.index()),
            MockEvent::Retrieve(h, GrabStatus::Canceled) => format!("canceled#{}", h.index()),
            MockEvent::Timeout => "timeout".to_string(),
            MockEvent::Cancel => "cancel".to_string(),
            MockEvent::Drain(h) => format!("drain#{}", h.index()),
            MockEvent::Deregister(h) => format!("deregister#{}", h.index()),
            MockEvent::Finish => "finish".to_string(),
            MockEvent::CloseStream => "close_stream".to_string(),
            MockEvent::Execute(node) => format!("exec:{}", node),
            MockEvent::CloseDevice => "close_device".to_string(),
        })
        .collect()
}

pub fn count(events: &[String], name: &str) -> usize {
    events.iter().filter(|e| e.as_str() == name).count()
}

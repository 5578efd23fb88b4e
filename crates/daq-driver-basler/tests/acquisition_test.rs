//! Integration tests for the acquisition controller lifecycle.
//!
//! Drives full start/poll/stop sequences against the mock transport and
//! checks frame accounting, the buffer queue protocol and state transitions.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p daq-driver-basler --test acquisition_test
//! ```

mod common;

use common::{count, TestRig, FRAME_BYTES, POLL_TIMEOUT, RUN_DEADLINE};
use daq_core::{AcquisitionStatus, DaqError, DriverErrorKind};
use daq_driver_basler::components::device::nodes;
use daq_driver_basler::components::mock::{frame_sequence, MockTransfer};
use daq_driver_basler::RunEnd;
use std::time::Duration;

// =============================================================================
// Complete runs
// =============================================================================

#[tokio::test]
async fn three_frames_single_buffer_event_sequence() {
    let rig = TestRig::new(1);
    let snapshot = rig.run(3).await;

    assert_eq!(
        rig.events(),
        vec![
            format!("prepare({},1)", FRAME_BYTES),
            "register#0".to_string(),
            "queue#0".to_string(),
            "exec:AcquisitionStart".to_string(),
            "grabbed#0".to_string(),
            "queue#0".to_string(),
            "grabbed#0".to_string(),
            "queue#0".to_string(),
            "grabbed#0".to_string(),
            "cancel".to_string(),
            "exec:AcquisitionStop".to_string(),
            "deregister#0".to_string(),
            "finish".to_string(),
        ]
    );

    assert_eq!(snapshot.status, AcquisitionStatus::Ready);
    assert_eq!(snapshot.frame_counter, 0, "counter resets after stop");
    let run = snapshot.last_run.expect("run summary");
    assert_eq!(run.end, RunEnd::Completed);
    assert_eq!(run.frames_acquired, 3);
    assert_eq!(run.failed_transfers, 0);
    assert!(rig.backend.stream.violations().is_empty());
}

#[tokio::test]
async fn frames_are_contiguous_from_zero() {
    for (buffer_count, nb_frames) in [(1, 1), (1, 7), (3, 20), (4, 2)] {
        let rig = TestRig::new(buffer_count);
        let snapshot = rig.run(nb_frames).await;

        let expected: Vec<u64> = (0..nb_frames).collect();
        assert_eq!(
            rig.sink.ready_frames(),
            expected,
            "pool {} target {}",
            buffer_count,
            nb_frames
        );
        assert_eq!(snapshot.last_run.map(|r| r.frames_acquired), Some(nb_frames));

        // Each payload is the frame the transport produced for that index
        for (frame_nb, payload) in rig.sink.written() {
            assert_eq!(payload.len(), FRAME_BYTES);
            assert_eq!(frame_sequence(&payload), Some(frame_nb as u16));
        }

        let stream = &rig.backend.stream;
        assert!(stream.max_queued() <= buffer_count);
        assert!(stream.max_queued() as u64 <= nb_frames);
        assert_eq!(stream.registered_count(), 0);
        assert_eq!(stream.queued_count(), 0);
        assert!(stream.violations().is_empty());
    }
}

#[tokio::test]
async fn consecutive_runs_restart_counting() {
    let rig = TestRig::new(2);
    rig.run(4).await;
    rig.sink.clear();

    let snapshot = rig.run(3).await;
    assert_eq!(rig.sink.ready_frames(), vec![0, 1, 2]);
    assert_eq!(snapshot.runs, 2);
    assert!(rig.backend.stream.violations().is_empty());
}

#[tokio::test]
async fn frame_info_carries_geometry_and_elapsed_time() {
    let rig = TestRig::new(1);
    rig.backend
        .stream
        .set_frame_interval(Duration::from_millis(5));
    rig.run(3).await;

    let infos = rig.sink.ready_infos();
    assert_eq!(infos.len(), 3);
    for pair in infos.windows(2) {
        assert!(pair[1].elapsed >= pair[0].elapsed);
    }
    assert_eq!(infos[0].size.width, common::WIDTH);
    assert_eq!(infos[0].size.height, common::HEIGHT);
}

// =============================================================================
// Per-transfer failures
// =============================================================================

#[tokio::test]
async fn failed_transfer_is_requeued_and_not_counted() {
    let rig = TestRig::new(1);
    rig.backend.stream.push_transfers([
        MockTransfer::Grab,
        MockTransfer::Fail {
            code: 0xE100_0014,
            description: "packet lost".into(),
        },
    ]);

    let snapshot = rig.run(3).await;

    assert_eq!(rig.sink.ready_frames(), vec![0, 1, 2]);
    let run = snapshot.last_run.unwrap();
    assert_eq!(run.end, RunEnd::Completed);
    assert_eq!(run.frames_acquired, 3);
    assert_eq!(run.failed_transfers, 1);

    let events = rig.events();
    let failed = events.iter().position(|e| e == "failed#0").unwrap();
    assert_eq!(events[failed + 1], "queue#0", "failed buffer goes back");
    assert!(rig.backend.stream.violations().is_empty());
}

#[tokio::test]
async fn short_payload_is_dropped() {
    let rig = TestRig::new(1);
    rig.backend
        .stream
        .push_transfers([MockTransfer::Short(FRAME_BYTES / 2)]);

    let snapshot = rig.run(1).await;

    assert_eq!(rig.sink.ready_frames(), vec![0]);
    assert_eq!(snapshot.last_run.unwrap().failed_transfers, 1);
    // Only complete frames reach the sink
    assert!(rig.sink.written().iter().all(|(_, p)| p.len() == FRAME_BYTES));
}

// =============================================================================
// Timeout
// =============================================================================

#[tokio::test]
async fn timeout_stops_run_exactly_once() {
    let rig = TestRig::new(1);
    rig.backend
        .stream
        .push_transfers([MockTransfer::Grab, MockTransfer::Timeout]);

    let snapshot = rig.run(3).await;

    assert_eq!(snapshot.status, AcquisitionStatus::Ready);
    let run = snapshot.last_run.unwrap();
    assert_eq!(run.end, RunEnd::Timeout);
    assert_eq!(run.frames_acquired, 1);
    assert_eq!(rig.sink.ready_frames(), vec![0]);

    let events = rig.events();
    assert_eq!(count(&events, "timeout"), 1);
    assert_eq!(count(&events, "cancel"), 1);
    assert_eq!(count(&events, "exec:AcquisitionStop"), 1);
    assert_eq!(count(&events, "finish"), 1);
    // The buffer left queued by the timed out wait is drained first
    assert_eq!(
        &events[events.len() - 5..],
        ["cancel", "drain#0", "exec:AcquisitionStop", "deregister#0", "finish"]
    );
    assert_eq!(rig.backend.stream.registered_count(), 0);
    assert!(rig.backend.stream.violations().is_empty());

    // A later stop has nothing left to do
    rig.camera.stop().await.unwrap();
    assert_eq!(rig.events().len(), events.len());
}

#[tokio::test]
async fn canceled_transfer_is_not_requeued() {
    let rig = TestRig::new(1);
    rig.backend
        .stream
        .push_transfers([MockTransfer::Grab, MockTransfer::Cancel]);

    let snapshot = rig.run(3).await;

    // Frame 0 lands, then the camera aborts the next transfer. With nothing
    // queued the following wait runs into its timeout and ends the run.
    assert_eq!(
        rig.events(),
        vec![
            format!("prepare({},1)", FRAME_BYTES),
            "register#0".to_string(),
            "queue#0".to_string(),
            "exec:AcquisitionStart".to_string(),
            "grabbed#0".to_string(),
            "queue#0".to_string(),
            "canceled#0".to_string(),
            "timeout".to_string(),
            "cancel".to_string(),
            "exec:AcquisitionStop".to_string(),
            "deregister#0".to_string(),
            "finish".to_string(),
        ]
    );

    let run = snapshot.last_run.unwrap();
    assert_eq!(run.end, RunEnd::Timeout);
    assert_eq!(run.frames_acquired, 1);
    assert_eq!(run.failed_transfers, 0);
    assert_eq!(rig.sink.ready_frames(), vec![0]);
    assert_eq!(snapshot.status, AcquisitionStatus::Ready);
    assert_eq!(rig.backend.stream.registered_count(), 0);
    assert!(rig.backend.stream.violations().is_empty());
}

#[tokio::test]
async fn status_holds_readout_between_frames() {
    let rig = TestRig::new(1);
    rig.backend
        .stream
        .set_frame_interval(Duration::from_millis(100));
    let mut updates = rig.camera.subscribe();

    rig.camera.set_nb_frames(3).await.unwrap();
    rig.camera.start().await.unwrap();
    assert_eq!(rig.camera.status(), AcquisitionStatus::Exposure);

    for delivered in 1..=2 {
        let snapshot = *tokio::time::timeout(
            RUN_DEADLINE,
            updates.wait_for(|s| s.frame_counter >= delivered),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            snapshot.status,
            AcquisitionStatus::Readout,
            "after frame {}",
            delivered
        );
    }

    let snapshot = rig.camera.wait_until_ready(RUN_DEADLINE).await.unwrap();
    assert_eq!(snapshot.status, AcquisitionStatus::Ready);
    assert_eq!(snapshot.last_run.unwrap().frames_acquired, 3);
}

#[tokio::test]
async fn transport_error_aborts_run() {
    let rig = TestRig::new(2);
    rig.backend.stream.push_transfers([
        MockTransfer::Grab,
        MockTransfer::Error("link down".into()),
    ]);

    let snapshot = rig.run(10).await;

    let run = snapshot.last_run.unwrap();
    assert_eq!(run.end, RunEnd::Aborted);
    assert_eq!(run.frames_acquired, 1);
    assert_eq!(snapshot.status, AcquisitionStatus::Ready);
    assert_eq!(rig.backend.stream.registered_count(), 0);
    assert!(rig.backend.stream.violations().is_empty());
}

#[tokio::test]
async fn sink_failure_aborts_run() {
    let rig = TestRig::new(1);
    rig.sink.fail_write_at(2);

    let snapshot = rig.run(5).await;

    let run = snapshot.last_run.unwrap();
    assert_eq!(run.end, RunEnd::Aborted);
    assert_eq!(run.frames_acquired, 2);
    assert_eq!(rig.sink.ready_frames(), vec![0, 1]);
    assert_eq!(snapshot.status, AcquisitionStatus::Ready);
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test]
async fn stop_is_idempotent() {
    let rig = TestRig::new(1);

    rig.camera.stop().await.unwrap();
    assert_eq!(rig.camera.status(), AcquisitionStatus::Ready);
    rig.camera.stop().await.unwrap();
    assert_eq!(rig.camera.status(), AcquisitionStatus::Ready);
    assert!(rig.events().is_empty(), "stop while Ready touches nothing");
}

#[tokio::test]
async fn stop_during_run_waits_for_in_flight_poll() {
    let rig = TestRig::new(2);
    rig.backend
        .stream
        .set_frame_interval(Duration::from_millis(10));
    rig.camera.set_nb_frames(1_000).await.unwrap();
    rig.camera.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    rig.camera.stop().await.unwrap();
    rig.camera.stop().await.unwrap();

    let snapshot = rig.camera.snapshot();
    assert_eq!(snapshot.status, AcquisitionStatus::Ready);
    let run = snapshot.last_run.unwrap();
    assert_eq!(run.end, RunEnd::Stopped);
    assert!(run.frames_acquired > 0);

    let frames = rig.sink.ready_frames();
    let expected: Vec<u64> = (0..frames.len() as u64).collect();
    assert_eq!(frames, expected);
    assert_eq!(frames.len() as u64, run.frames_acquired);

    let events = rig.events();
    assert_eq!(count(&events, "cancel"), 1);
    assert_eq!(count(&events, "deregister#0"), 1);
    assert_eq!(count(&events, "deregister#1"), 1);
    assert_eq!(rig.backend.stream.registered_count(), 0);
    assert!(rig.backend.stream.violations().is_empty());
}

#[tokio::test]
async fn start_while_running_is_rejected() {
    let rig = TestRig::new(1);
    rig.backend
        .stream
        .set_frame_interval(Duration::from_millis(5));
    rig.camera.set_nb_frames(1_000).await.unwrap();
    rig.camera.start().await.unwrap();

    let err = rig.camera.start().await.unwrap_err();
    assert!(matches!(err, DaqError::AcquisitionBusy(status) if status.is_running()));
    assert!(rig.camera.status().is_running(), "existing run unaffected");

    rig.camera.stop().await.unwrap();
    let frames = rig.sink.ready_frames();
    let expected: Vec<u64> = (0..frames.len() as u64).collect();
    assert_eq!(frames, expected);
    assert_eq!(count(&rig.events(), &format!("prepare({},1)", FRAME_BYTES)), 1);
}

#[tokio::test]
async fn settings_locked_while_running() {
    let rig = TestRig::new(1);
    rig.backend
        .stream
        .set_frame_interval(Duration::from_millis(5));
    rig.camera.set_nb_frames(1_000).await.unwrap();
    rig.camera.start().await.unwrap();

    assert!(matches!(
        rig.camera.set_nb_frames(5).await,
        Err(DaqError::AcquisitionBusy(_))
    ));
    assert!(matches!(
        rig.camera
            .set_trigger_mode(daq_core::TriggerMode::ExternalGate)
            .await,
        Err(DaqError::AcquisitionBusy(_))
    ));

    rig.camera.stop().await.unwrap();
    rig.camera.set_nb_frames(5).await.unwrap();
}

// =============================================================================
// Start failures
// =============================================================================

#[tokio::test]
async fn registration_failure_rolls_back() {
    let rig = TestRig::new(2);
    rig.backend.stream.fail_register_after(Some(1));
    rig.camera.set_nb_frames(3).await.unwrap();

    let err = rig.camera.start().await.unwrap_err();
    assert!(matches!(err, DaqError::Driver(ref e) if e.kind == DriverErrorKind::Hardware));
    assert_eq!(rig.camera.status(), AcquisitionStatus::Ready);
    assert_eq!(
        rig.events(),
        vec![
            format!("prepare({},2)", FRAME_BYTES),
            "register#0".to_string(),
            "cancel".to_string(),
            "deregister#0".to_string(),
            "finish".to_string(),
        ]
    );
    assert_eq!(rig.backend.stream.registered_count(), 0);
    assert!(!rig.backend.stream.is_prepared());

    // The controller is usable again once the transport recovers
    rig.backend.stream.fail_register_after(None);
    rig.backend.clear_events();
    rig.camera.start().await.unwrap();
    rig.camera.wait_until_ready(RUN_DEADLINE).await.unwrap();
    assert_eq!(rig.sink.ready_frames(), vec![0, 1, 2]);
}

#[tokio::test]
async fn arming_failure_rolls_back() {
    let rig = TestRig::new(1);
    rig.backend.nodes.fail_node(nodes::ACQUISITION_START);

    assert!(rig.camera.start().await.is_err());
    assert_eq!(rig.camera.status(), AcquisitionStatus::Ready);
    assert_eq!(
        rig.events(),
        vec![
            format!("prepare({},1)", FRAME_BYTES),
            "register#0".to_string(),
            "queue#0".to_string(),
            "cancel".to_string(),
            "drain#0".to_string(),
            "deregister#0".to_string(),
            "finish".to_string(),
        ]
    );
    assert!(rig.backend.stream.violations().is_empty());

    rig.backend.nodes.heal_node(nodes::ACQUISITION_START);
    rig.camera.start().await.unwrap();
    rig.camera.wait_until_ready(RUN_DEADLINE).await.unwrap();
    assert_eq!(rig.sink.ready_frames(), vec![0]);
}

#[tokio::test]
async fn payload_query_failure_touches_no_buffer() {
    let rig = TestRig::new(1);
    rig.backend.nodes.fail_node(nodes::PAYLOAD_SIZE);

    assert!(rig.camera.start().await.is_err());
    assert!(rig.events().is_empty(), "nothing was registered");
    assert_eq!(rig.camera.status(), AcquisitionStatus::Ready);
}

#[tokio::test]
async fn poll_timeout_bounds_each_wait() {
    let mut settings = common::settings(1);
    settings.poll_timeout = Duration::from_millis(20);
    let rig = TestRig::with_settings(settings);
    // Transfers slower than the bound never complete
    rig.backend
        .stream
        .set_frame_interval(POLL_TIMEOUT);

    let snapshot = rig.run(2).await;
    assert_eq!(snapshot.last_run.unwrap().end, RunEnd::Timeout);
    assert!(rig.sink.ready_frames().is_empty());
}

// =============================================================================
// Teardown failures
// =============================================================================

#[tokio::test]
async fn buffer_still_queued_after_cancel_is_never_deregistered() {
    let rig = TestRig::new(1);
    rig.backend
        .stream
        .set_frame_interval(Duration::from_millis(5));
    rig.backend.stream.ignore_cancel(true);
    rig.camera.set_nb_frames(1_000).await.unwrap();
    rig.camera.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(rig.camera.stop().await.is_err());
    assert_eq!(rig.camera.status(), AcquisitionStatus::Fault);
    assert!(rig
        .backend
        .stream
        .violations()
        .iter()
        .all(|v| !v.contains("deregistered while queued")));
    assert_eq!(rig.backend.stream.registered_count(), 1);

    // Fault is absorbing
    assert!(matches!(
        rig.camera.start().await,
        Err(DaqError::InvalidStateTransition { .. })
    ));

    // Once the transport releases the buffer a further stop reclaims it
    rig.backend.stream.ignore_cancel(false);
    rig.camera.stop().await.unwrap();
    assert_eq!(rig.backend.stream.registered_count(), 0);
    assert!(!rig.backend.stream.is_prepared());
    assert_eq!(rig.camera.status(), AcquisitionStatus::Fault);
}

#[tokio::test]
async fn deregister_failure_enters_fault() {
    let rig = TestRig::new(1);
    rig.backend.stream.fail_deregister(true);

    let snapshot = rig.run(2).await;
    assert_eq!(snapshot.status, AcquisitionStatus::Fault);
    assert_eq!(snapshot.last_run.unwrap().frames_acquired, 2);
    assert!(rig.camera.start().await.is_err());

    rig.backend.stream.fail_deregister(false);
    rig.camera.stop().await.unwrap();
    assert_eq!(rig.backend.stream.registered_count(), 0);
}

//! Acquisition controller: state machine and grab buffer lifecycle.
//!
//! # Architecture
//!
//! The [`AcquisitionController`] is the single owner of the device session,
//! the stream grabber session, the grab buffer list and the acquisition
//! state. It runs as one Tokio task and processes [`AcqCommand`] messages
//! strictly one at a time, so none of that state needs a lock.
//!
//! ```text
//! BaslerCamera (caller)                 Controller task
//! ---------------------                 ---------------
//! start()  ── AcqCommand::Start ──────> prepare, register, queue, arm
//!                                       poll_pending = true
//!                                       ┌─> drain queued commands
//!                                       │   wait_and_retrieve(poll_timeout)
//!                                       │   copy frame into FrameSink
//!                                       └── re-queue, poll_pending = true
//! stop()   ── AcqCommand::Stop ───────> handled once the in-flight poll returns
//! ```
//!
//! The next poll is a flag rather than a self-posted message: commands already
//! waiting in the channel are always handled before the next poll starts, and
//! a poll is never interrupted by one.
//!
//! # Headroom rule
//!
//! A completed buffer is re-queued only while fewer buffers are queued than
//! frames remain to be collected. With a pool of `k` buffers this keeps `k`
//! buffers in flight until the last `k` frames, then lets the pool drain, so
//! no buffer is ever queued for a frame that will not be collected.

use chrono::{DateTime, Utc};
use daq_core::{
    AcquisitionStatus, DaqError, DaqResult, DetectorInfo, FrameInfo, FrameSink, ImageSize,
    ImageType, TriggerMode,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::device::DeviceSession;
use super::grab_buffer::GrabBuffer;
use super::stream::{BufferHandle, Completion, GrabResult, GrabStatus, StreamingSession};
use crate::settings::AcquisitionSettings;

/// Commands accepted by the controller task.
///
/// Each variant carries the oneshot sender its reply goes to.
#[derive(Debug)]
pub enum AcqCommand {
    Start {
        response: oneshot::Sender<DaqResult<()>>,
    },
    Stop {
        response: oneshot::Sender<DaqResult<()>>,
    },
    SetNbFrames {
        nb_frames: u64,
        response: oneshot::Sender<DaqResult<()>>,
    },
    GetNbFrames {
        response: oneshot::Sender<u64>,
    },
    SetExposureTime {
        exposure_ms: f64,
        response: oneshot::Sender<DaqResult<()>>,
    },
    GetExposureTime {
        response: oneshot::Sender<DaqResult<f64>>,
    },
    SetTriggerMode {
        mode: TriggerMode,
        response: oneshot::Sender<DaqResult<()>>,
    },
    GetTriggerMode {
        response: oneshot::Sender<DaqResult<TriggerMode>>,
    },
    GetImageSize {
        response: oneshot::Sender<DaqResult<ImageSize>>,
    },
    GetImageType {
        response: oneshot::Sender<DaqResult<ImageType>>,
    },
    GetFrameRate {
        response: oneshot::Sender<DaqResult<f64>>,
    },
    GetDetectorInfo {
        response: oneshot::Sender<DetectorInfo>,
    },
    /// Stop any run, close the stream grabber and the device, then exit.
    Shutdown {
        response: oneshot::Sender<DaqResult<()>>,
    },
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// FrameTarget frames were delivered.
    Completed,
    /// No transfer completed within the poll timeout.
    Timeout,
    /// A caller requested `stop()` (or shutdown).
    Stopped,
    /// The transport or the frame sink failed mid-run.
    Aborted,
}

/// Accounting of the last finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub end: RunEnd,
    /// FrameCounter value when the run ended.
    pub frames_acquired: u64,
    pub nb_frames: u64,
    pub failed_transfers: u64,
}

/// Read-only view of the controller state, published after every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquisitionSnapshot {
    pub status: AcquisitionStatus,
    /// Frames delivered in the current run.
    pub frame_counter: u64,
    pub nb_frames: u64,
    /// Completed runs since the controller started.
    pub runs: u64,
    pub last_run: Option<RunSummary>,
}

/// Geometry captured at start; fixed for the whole run.
#[derive(Debug, Clone, Copy)]
struct FrameGeometry {
    size: ImageSize,
    image_type: ImageType,
    frame_bytes: usize,
}

/// Headroom rule: re-queue a completed buffer only while the other queued
/// buffers cannot cover the frames still to collect.
pub fn should_requeue(queued_elsewhere: usize, nb_frames: u64, frame_counter: u64) -> bool {
    (queued_elsewhere as u64) < nb_frames.saturating_sub(frame_counter)
}

/// Sequential owner of the acquisition pipeline.
pub struct AcquisitionController {
    device: Box<dyn DeviceSession>,
    stream: Box<dyn StreamingSession>,
    sink: Arc<dyn FrameSink>,
    settings: AcquisitionSettings,

    status: AcquisitionStatus,
    buffers: Vec<GrabBuffer>,
    /// Handles currently queued with the stream grabber.
    queued: BTreeSet<BufferHandle>,
    /// Buffers whose deregistration failed. Kept alive so the transport can
    /// never write into freed memory.
    stranded: Vec<GrabBuffer>,
    frame_counter: u64,
    nb_frames: u64,
    failed_transfers: u64,
    geometry: Option<FrameGeometry>,
    prepared: bool,
    armed: bool,
    poll_pending: bool,
    run_start: Option<(DateTime<Utc>, Instant)>,

    runs: u64,
    last_run: Option<RunSummary>,
    snapshot_tx: watch::Sender<AcquisitionSnapshot>,
}

impl AcquisitionController {
    /// Create a controller and the receiver its snapshots are published to.
    pub fn new(
        device: Box<dyn DeviceSession>,
        stream: Box<dyn StreamingSession>,
        sink: Arc<dyn FrameSink>,
        settings: AcquisitionSettings,
    ) -> (Self, watch::Receiver<AcquisitionSnapshot>) {
        let nb_frames = settings.nb_frames;
        let (snapshot_tx, snapshot_rx) = watch::channel(AcquisitionSnapshot {
            nb_frames,
            ..Default::default()
        });

        let controller = Self {
            device,
            stream,
            sink,
            settings,
            status: AcquisitionStatus::Ready,
            buffers: Vec::new(),
            queued: BTreeSet::new(),
            stranded: Vec::new(),
            frame_counter: 0,
            nb_frames,
            failed_transfers: 0,
            geometry: None,
            prepared: false,
            armed: false,
            poll_pending: false,
            run_start: None,
            runs: 0,
            last_run: None,
            snapshot_tx,
        };
        (controller, snapshot_rx)
    }

    /// Event loop. Returns after `Shutdown` or when every sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<AcqCommand>) {
        info!("Acquisition controller started");

        loop {
            let command = if self.poll_pending {
                match commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match commands.recv().await {
                    Some(command) => Some(command),
                    None => break,
                }
            };

            match command {
                Some(AcqCommand::Shutdown { response }) => {
                    let result = self.shutdown();
                    let _ = response.send(result);
                    info!("Acquisition controller stopped");
                    return;
                }
                Some(command) => self.handle_command(command),
                None => {
                    self.poll_pending = false;
                    self.poll_step().await;
                    // Let callers in between two polls
                    tokio::task::yield_now().await;
                }
            }
        }

        info!("All camera handles dropped, shutting down");
        if let Err(err) = self.shutdown() {
            error!(error = %err, "Shutdown after handle drop failed");
        }
    }

    fn handle_command(&mut self, command: AcqCommand) {
        match command {
            AcqCommand::Start { response } => {
                let _ = response.send(self.start());
            }
            AcqCommand::Stop { response } => {
                let _ = response.send(self.stop(RunEnd::Stopped));
            }
            AcqCommand::SetNbFrames {
                nb_frames,
                response,
            } => {
                let _ = response.send(self.set_nb_frames(nb_frames));
            }
            AcqCommand::GetNbFrames { response } => {
                let _ = response.send(self.nb_frames);
            }
            AcqCommand::SetExposureTime {
                exposure_ms,
                response,
            } => {
                let _ = response.send(self.device.set_exposure_time(exposure_ms));
            }
            AcqCommand::GetExposureTime { response } => {
                let _ = response.send(self.device.exposure_time());
            }
            AcqCommand::SetTriggerMode { mode, response } => {
                let result = if self.status.is_running() {
                    Err(DaqError::AcquisitionBusy(self.status))
                } else {
                    self.device.set_trigger_mode(mode)
                };
                let _ = response.send(result);
            }
            AcqCommand::GetTriggerMode { response } => {
                let _ = response.send(self.device.trigger_mode());
            }
            AcqCommand::GetImageSize { response } => {
                let _ = response.send(self.device.image_size());
            }
            AcqCommand::GetImageType { response } => {
                let _ = response.send(self.device.image_type());
            }
            AcqCommand::GetFrameRate { response } => {
                let _ = response.send(self.device.frame_rate());
            }
            AcqCommand::GetDetectorInfo { response } => {
                let _ = response.send(self.device.info());
            }
            AcqCommand::Shutdown { response } => {
                // Handled by the event loop
                let _ = response.send(Err(DaqError::ActorGone));
            }
        }
    }

    // =========================================================================
    // Start
    // =========================================================================

    fn start(&mut self) -> DaqResult<()> {
        match self.status {
            AcquisitionStatus::Ready => {}
            AcquisitionStatus::Fault => {
                return Err(DaqError::InvalidStateTransition {
                    from: AcquisitionStatus::Fault,
                    to: AcquisitionStatus::Exposure,
                })
            }
            running => {
                warn!(status = %running, "start() ignored, acquisition already running");
                return Err(DaqError::AcquisitionBusy(running));
            }
        }

        info!(nb_frames = self.nb_frames, "Starting acquisition");
        self.frame_counter = 0;
        self.failed_transfers = 0;

        if let Err(err) = self.arm() {
            error!(error = %err, "Start sequence failed, rolling back");
            if let Err(teardown_err) = self.teardown() {
                error!(error = %teardown_err, "Rollback incomplete");
                self.enter_fault();
            }
            self.publish();
            return Err(err);
        }
        Ok(())
    }

    fn arm(&mut self) -> DaqResult<()> {
        let size = self.device.image_size()?;
        let image_type = self.device.image_type()?;
        let frame_bytes = size.frame_bytes(image_type).ok_or_else(|| {
            DaqError::InvalidParameter(format!("frame size {} overflows", size))
        })?;
        let payload_size = self.device.payload_size()?;

        if payload_size < frame_bytes {
            return Err(DaqError::InvalidParameter(format!(
                "payload size {} smaller than a {} {:?} frame ({} bytes)",
                payload_size, size, image_type, frame_bytes
            )));
        }
        if frame_bytes > self.sink.slot_capacity() {
            return Err(DaqError::FrameTooLarge {
                bytes: frame_bytes,
                max_bytes: self.sink.slot_capacity(),
            });
        }
        self.geometry = Some(FrameGeometry {
            size,
            image_type,
            frame_bytes,
        });

        // Buffer sizes must not change until finish()
        let buffer_count = self.settings.buffer_count;
        debug!(payload_size, buffer_count, "Preparing grab");
        self.stream.prepare(payload_size, buffer_count)?;
        self.prepared = true;

        for _ in 0..buffer_count {
            let mut buffer = GrabBuffer::allocate(payload_size)?;
            let handle = self.stream.register_buffer(&mut buffer)?;
            buffer.set_handle(Some(handle));
            debug!(%handle, "Registered grab buffer");
            self.buffers.push(buffer);
        }

        // Never queue a buffer for a frame that will not be collected
        let initial = buffer_count.min(usize::try_from(self.nb_frames).unwrap_or(usize::MAX));
        let handles: Vec<BufferHandle> = self
            .buffers
            .iter()
            .filter_map(GrabBuffer::handle)
            .take(initial)
            .collect();
        for handle in handles {
            self.stream.queue(handle)?;
            self.queued.insert(handle);
        }

        let started_at = Utc::now();
        self.sink.set_start_timestamp(started_at);
        self.run_start = Some((started_at, Instant::now()));

        info!("Arming camera for continuous acquisition");
        self.device.acquisition_start()?;
        self.armed = true;

        self.transition(AcquisitionStatus::Exposure)?;
        self.poll_pending = true;
        Ok(())
    }

    // =========================================================================
    // Poll
    // =========================================================================

    async fn poll_step(&mut self) {
        if !self.status.is_running() {
            // A stop was handled after this poll was scheduled
            return;
        }

        match self
            .stream
            .wait_and_retrieve(self.settings.poll_timeout)
            .await
        {
            Ok(Completion::Ready(result)) => self.on_transfer(result),
            Ok(Completion::Timeout) => {
                warn!(
                    timeout_ms = self.settings.poll_timeout.as_millis() as u64,
                    frame_counter = self.frame_counter,
                    "Timeout occurred, stopping acquisition"
                );
                self.end_run(RunEnd::Timeout);
            }
            Err(err) => {
                error!(error = %err, "Retrieving transfer failed, stopping acquisition");
                self.end_run(RunEnd::Aborted);
            }
        }
    }

    fn on_transfer(&mut self, result: GrabResult) {
        let handle = result.handle;
        self.queued.remove(&handle);

        match result.status {
            GrabStatus::Grabbed { payload_size } => match self.check_payload(payload_size) {
                Ok(()) => {
                    if let Err(err) = self.deliver(handle) {
                        error!(error = %err, %handle, "Delivering frame failed, stopping acquisition");
                        self.end_run(RunEnd::Aborted);
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, %handle, "Incomplete frame dropped");
                    self.failed_transfers += 1;
                    self.requeue_if_needed(handle);
                }
            },
            GrabStatus::Failed { code, description } => {
                warn!(
                    code = format_args!("{:#x}", code),
                    %description,
                    %handle,
                    frame_counter = self.frame_counter,
                    "No image acquired"
                );
                self.failed_transfers += 1;
                self.requeue_if_needed(handle);
            }
            GrabStatus::Canceled => {
                warn!(%handle, "Transfer canceled by the camera");
            }
        }

        if self.frame_counter >= self.nb_frames {
            info!(frames = self.frame_counter, "All frames acquired");
            self.end_run(RunEnd::Completed);
        } else {
            self.publish();
            self.poll_pending = true;
        }
    }

    fn check_payload(&self, payload_size: usize) -> DaqResult<()> {
        let geometry = self
            .geometry
            .ok_or_else(|| DaqError::TransferProtocol("no frame geometry".into()))?;
        if payload_size < geometry.frame_bytes {
            return Err(DaqError::TransferProtocol(format!(
                "payload of {} bytes, expected {}",
                payload_size, geometry.frame_bytes
            )));
        }
        Ok(())
    }

    /// Copy a grabbed frame into the sink and advance the counter.
    fn deliver(&mut self, handle: BufferHandle) -> DaqResult<()> {
        let geometry = self
            .geometry
            .ok_or_else(|| DaqError::TransferProtocol("no frame geometry".into()))?;
        // Readout holds from the first frame until the run stops
        if self.status == AcquisitionStatus::Exposure {
            self.transition(AcquisitionStatus::Readout)?;
        }

        let frame_nb = self.frame_counter;
        let buffer = self
            .buffers
            .iter()
            .find(|b| b.handle() == Some(handle))
            .ok_or_else(|| DaqError::TransferProtocol(format!("unknown buffer {}", handle)))?;
        let payload = buffer
            .payload(geometry.frame_bytes)
            .ok_or_else(|| DaqError::TransferProtocol(format!("{} too small", handle)))?;
        self.sink.write_frame(frame_nb, payload)?;

        let elapsed = self
            .run_start
            .map(|(_, started)| started.elapsed())
            .unwrap_or_default();
        self.sink.notify_frame_ready(FrameInfo {
            frame_nb,
            timestamp: Utc::now(),
            elapsed,
            size: geometry.size,
            image_type: geometry.image_type,
        });
        debug!(frame_nb, %handle, "image acquired");

        self.frame_counter += 1;
        self.requeue_if_needed(handle);
        Ok(())
    }

    fn requeue_if_needed(&mut self, handle: BufferHandle) {
        if !should_requeue(self.queued.len(), self.nb_frames, self.frame_counter) {
            debug!(%handle, frame_counter = self.frame_counter, "Buffer not re-queued, no frame left for it");
            return;
        }

        match self.stream.queue(handle) {
            Ok(()) => {
                self.queued.insert(handle);
            }
            Err(err) => error!(error = %err, %handle, "Re-queuing buffer failed"),
        }
    }

    // =========================================================================
    // Stop
    // =========================================================================

    fn end_run(&mut self, end: RunEnd) {
        if let Err(err) = self.stop(end) {
            error!(error = %err, ?end, "Stopping acquisition failed");
        }
    }

    fn stop(&mut self, end: RunEnd) -> DaqResult<()> {
        match self.status {
            AcquisitionStatus::Ready => {
                debug!("stop() with no acquisition running");
                return Ok(());
            }
            AcquisitionStatus::Fault => {
                // Release whatever is left; the controller stays faulted
                return self.teardown();
            }
            AcquisitionStatus::Exposure | AcquisitionStatus::Readout => {}
        }

        info!(?end, frames = self.frame_counter, "Stopping acquisition");
        self.poll_pending = false;
        let summary = RunSummary {
            end,
            frames_acquired: self.frame_counter,
            nb_frames: self.nb_frames,
            failed_transfers: self.failed_transfers,
        };

        let result = self.teardown();
        self.runs += 1;
        self.last_run = Some(summary);
        match &result {
            Ok(()) => {
                if let Err(err) = self.transition(AcquisitionStatus::Ready) {
                    error!(error = %err, "Unexpected state after teardown");
                }
            }
            Err(_) => self.enter_fault(),
        }
        self.publish();
        result
    }

    /// Release everything the start sequence acquired, in protocol order.
    ///
    /// Every step runs even when an earlier one failed.
    fn teardown(&mut self) -> DaqResult<()> {
        let mut errors = Vec::new();
        self.poll_pending = false;

        if self.prepared {
            // Queued buffers must come back before they can be deregistered
            if let Err(err) = self.stream.cancel() {
                errors.push(err);
            }
            loop {
                match self.stream.retrieve_ready() {
                    Ok(Some(result)) => {
                        self.queued.remove(&result.handle);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        errors.push(err);
                        break;
                    }
                }
            }
        }

        if self.armed {
            info!("Stop acquisition");
            if let Err(err) = self.device.acquisition_stop() {
                errors.push(err);
            }
            self.armed = false;
        }

        // Stranded buffers from an earlier teardown get another chance
        let buffers: Vec<GrabBuffer> = std::mem::take(&mut self.buffers)
            .into_iter()
            .chain(std::mem::take(&mut self.stranded))
            .collect();
        for mut buffer in buffers {
            let Some(handle) = buffer.handle() else {
                buffer.release();
                continue;
            };
            if self.queued.contains(&handle) {
                errors.push(DaqError::TransferProtocol(format!(
                    "{} still queued after cancel, not deregistered",
                    handle
                )));
                self.stranded.push(buffer);
                continue;
            }
            match self.stream.deregister_buffer(handle) {
                Ok(()) => {
                    buffer.set_handle(None);
                    buffer.release();
                }
                Err(err) => {
                    errors.push(err);
                    self.stranded.push(buffer);
                }
            }
        }

        if self.prepared {
            match self.stream.finish() {
                Ok(()) => self.prepared = false,
                Err(err) => errors.push(err),
            }
        }

        self.frame_counter = 0;
        self.geometry = None;
        self.run_start = None;
        DaqError::from_teardown(errors)
    }

    fn shutdown(&mut self) -> DaqResult<()> {
        let mut errors = Vec::new();
        if self.status.is_running() {
            if let Err(err) = self.stop(RunEnd::Stopped) {
                errors.push(err);
            }
        } else if self.prepared || !self.buffers.is_empty() || !self.stranded.is_empty() {
            if let Err(err) = self.teardown() {
                errors.push(err);
            }
        }

        info!("Closing stream grabber and camera");
        if let Err(err) = self.stream.close() {
            errors.push(err);
        }
        if let Err(err) = self.device.close() {
            errors.push(err);
        }
        DaqError::from_teardown(errors)
    }

    // =========================================================================
    // State
    // =========================================================================

    fn set_nb_frames(&mut self, nb_frames: u64) -> DaqResult<()> {
        if self.status.is_running() {
            return Err(DaqError::AcquisitionBusy(self.status));
        }
        if nb_frames == 0 {
            return Err(DaqError::InvalidParameter(
                "nb_frames must be at least 1".into(),
            ));
        }
        self.nb_frames = nb_frames;
        self.publish();
        Ok(())
    }

    fn transition(&mut self, next: AcquisitionStatus) -> DaqResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DaqError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        debug!(from = %self.status, to = %next, "status");
        self.status = next;
        self.publish();
        Ok(())
    }

    fn enter_fault(&mut self) {
        if self.status != AcquisitionStatus::Fault {
            error!(from = %self.status, "Entering Fault state");
            self.status = AcquisitionStatus::Fault;
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(AcquisitionSnapshot {
            status: self.status,
            frame_counter: self.frame_counter,
            nb_frames: self.nb_frames,
            runs: self.runs,
            last_run: self.last_run,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_buffer_requeues_until_last_frame() {
        // FrameTarget 3, one buffer: requeue after frames 0 and 1, not after 2
        assert!(should_requeue(0, 3, 1));
        assert!(should_requeue(0, 3, 2));
        assert!(!should_requeue(0, 3, 3));
    }

    #[test]
    fn test_pool_drains_over_last_frames() {
        // FrameTarget 10, pool of 3: two others stay queued
        assert!(should_requeue(2, 10, 7));
        assert!(!should_requeue(2, 10, 8));
        assert!(should_requeue(1, 10, 8));
        assert!(!should_requeue(1, 10, 9));
        assert!(should_requeue(0, 10, 9));
    }

    #[test]
    fn test_failed_transfer_keeps_headroom() {
        // Counter unchanged after a failure, so the buffer goes back
        assert!(should_requeue(0, 1, 0));
        assert!(!should_requeue(1, 1, 0));
    }

    #[test]
    fn test_counter_past_target_never_requeues() {
        assert!(!should_requeue(0, 3, 5));
    }
}

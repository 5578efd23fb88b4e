//! Fixed ring of frame slots addressed by acquisition frame number.
//!
//! # Design
//!
//! The ring owns `nb_buffers` slots of `slot_capacity` bytes, allocated once.
//! Frame `n` lands in slot `n % nb_buffers`, so a consumer that keeps up with
//! the producer always finds the last `nb_buffers` frames in the ring.
//!
//! ```text
//! frame_nb:  0   1   2   3   4   5 ...
//! slot:      0   1   2   0   1   2        (nb_buffers = 3)
//! ```
//!
//! Each slot carries its own lock, so copying frame `n + 1` never waits for a
//! reader of frame `n`. Frame-ready announcements are broadcast to any number
//! of subscribers; a lagging subscriber loses announcements, never frames
//! still present in the ring.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use daq_core::{DaqError, DaqResult, FrameInfo, FrameSink};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the frame-ready broadcast channel.
const READY_CHANNEL_CAPACITY: usize = 64;

struct Slot {
    data: Vec<u8>,
    /// Bytes written for the frame currently held.
    len: usize,
    /// Frame currently held, `None` until the first write.
    frame_nb: Option<u64>,
    /// Set once the frame was announced ready.
    info: Option<FrameInfo>,
}

struct FrameRingInner {
    slots: Vec<Mutex<Slot>>,
    slot_capacity: usize,
    start_timestamp: RwLock<Option<DateTime<Utc>>>,
    ready_tx: broadcast::Sender<FrameInfo>,
    /// Last frame announced ready, -1 before the first one.
    last_frame_ready: AtomicI64,
    /// Metrics: frames announced since creation.
    total_ready: AtomicU64,
}

/// Ring of pre-allocated frame slots implementing [`FrameSink`].
///
/// Cheap to clone; all clones share the same slots.
#[derive(Clone)]
pub struct FrameRing {
    inner: Arc<FrameRingInner>,
}

impl FrameRing {
    /// Create a ring with `nb_buffers` slots of `slot_capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `nb_buffers` is 0 or `slot_capacity` is 0.
    #[must_use]
    pub fn new(nb_buffers: usize, slot_capacity: usize) -> Self {
        assert!(nb_buffers > 0, "nb_buffers must be > 0");
        assert!(slot_capacity > 0, "slot_capacity must be > 0");

        let slots = (0..nb_buffers)
            .map(|_| {
                Mutex::new(Slot {
                    data: vec![0u8; slot_capacity],
                    len: 0,
                    frame_nb: None,
                    info: None,
                })
            })
            .collect();

        info!(
            nb_buffers,
            slot_capacity_mb = slot_capacity as f64 / (1024.0 * 1024.0),
            total_mb = (nb_buffers * slot_capacity) as f64 / (1024.0 * 1024.0),
            "FrameRing created"
        );

        let (ready_tx, _) = broadcast::channel(READY_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(FrameRingInner {
                slots,
                slot_capacity,
                start_timestamp: RwLock::new(None),
                ready_tx,
                last_frame_ready: AtomicI64::new(-1),
                total_ready: AtomicU64::new(0),
            }),
        }
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn nb_buffers(&self) -> usize {
        self.inner.slots.len()
    }

    /// Slot index holding `frame_nb`.
    #[inline]
    #[must_use]
    pub fn slot_index(&self, frame_nb: u64) -> usize {
        (frame_nb % self.inner.slots.len() as u64) as usize
    }

    /// Subscribe to frame-ready announcements.
    pub fn subscribe(&self) -> broadcast::Receiver<FrameInfo> {
        self.inner.ready_tx.subscribe()
    }

    /// Last frame announced ready, `None` before the first.
    #[must_use]
    pub fn last_frame_ready(&self) -> Option<u64> {
        let last = self.inner.last_frame_ready.load(Ordering::Acquire);
        u64::try_from(last).ok()
    }

    /// Frames announced ready since the ring was created.
    #[must_use]
    pub fn total_ready(&self) -> u64 {
        self.inner.total_ready.load(Ordering::Relaxed)
    }

    /// Copy out a ready frame.
    ///
    /// Returns `None` when the slot has since been reused by a later frame or
    /// the frame was never announced.
    #[must_use]
    pub fn read_frame(&self, frame_nb: u64) -> Option<(FrameInfo, Bytes)> {
        let slot = self.inner.slots[self.slot_index(frame_nb)].lock();
        match (&slot.info, slot.frame_nb) {
            (Some(info), Some(held)) if held == frame_nb => Some((
                info.clone(),
                Bytes::copy_from_slice(&slot.data[..slot.len]),
            )),
            _ => None,
        }
    }

    /// Forget all frames and the start timestamp.
    pub fn reset(&self) {
        for slot in &self.inner.slots {
            let mut slot = slot.lock();
            slot.len = 0;
            slot.frame_nb = None;
            slot.info = None;
        }
        *self.inner.start_timestamp.write() = None;
        self.inner.last_frame_ready.store(-1, Ordering::Release);
    }
}

impl FrameSink for FrameRing {
    fn slot_capacity(&self) -> usize {
        self.inner.slot_capacity
    }

    fn set_start_timestamp(&self, at: DateTime<Utc>) {
        *self.inner.start_timestamp.write() = Some(at);
        self.inner.last_frame_ready.store(-1, Ordering::Release);
    }

    fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        *self.inner.start_timestamp.read()
    }

    fn write_frame(&self, frame_nb: u64, payload: &[u8]) -> DaqResult<()> {
        if payload.len() > self.inner.slot_capacity {
            return Err(DaqError::FrameTooLarge {
                bytes: payload.len(),
                max_bytes: self.inner.slot_capacity,
            });
        }

        let mut slot = self.inner.slots[self.slot_index(frame_nb)].lock();
        slot.data[..payload.len()].copy_from_slice(payload);
        slot.len = payload.len();
        slot.frame_nb = Some(frame_nb);
        slot.info = None;
        Ok(())
    }

    fn notify_frame_ready(&self, info: FrameInfo) {
        let frame_nb = info.frame_nb;
        {
            let mut slot = self.inner.slots[self.slot_index(frame_nb)].lock();
            if slot.frame_nb == Some(frame_nb) {
                slot.info = Some(info.clone());
            }
        }
        self.inner
            .last_frame_ready
            .store(i64::try_from(frame_nb).unwrap_or(i64::MAX), Ordering::Release);
        self.inner.total_ready.fetch_add(1, Ordering::Relaxed);
        debug!(frame_nb, "frame ready");

        // No subscribers is fine
        let _ = self.inner.ready_tx.send(info);
    }
}

//! In-memory Basler camera for tests and hardware-free runs.
//!
//! [`MockBackend`] bundles a GenICam node map ([`MockNodeMap`]) and a stream
//! grabber ([`MockStream`]) sharing one event log, so tests can assert the
//! exact order of queue, arm and retrieve operations across both sessions.
//!
//! Both halves are cheap handles over shared state: clone them before
//! handing them to the driver to keep a view for assertions and failure
//! injection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use daq_core::{
    DaqError, DaqResult, DetectorInfo, DriverErrorKind, FrameInfo, FrameSink,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::device::nodes;
use super::grab_buffer::GrabBuffer;
use super::stream::{BufferHandle, Completion, GrabResult, GrabStatus, StreamingSession};

const DRIVER: &str = "basler-mock";

/// Largest value the mock sensor delivers (12 significant bits).
const PIXEL_MASK: u16 = 0x0FFF;

/// One observable operation of the mock transport or camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Prepare {
        max_buffer_size: usize,
        max_buffer_count: usize,
    },
    Register(BufferHandle),
    Queue(BufferHandle),
    Retrieve(BufferHandle, GrabStatus),
    Timeout,
    Cancel,
    Drain(BufferHandle),
    Deregister(BufferHandle),
    Finish,
    CloseStream,
    /// A GenICam command node was executed (`AcquisitionStart`, ...).
    Execute(String),
    CloseDevice,
}

type EventLog = Arc<Mutex<Vec<MockEvent>>>;

// =============================================================================
// Node map
// =============================================================================

#[derive(Debug)]
struct NodeState {
    integers: HashMap<&'static str, i64>,
    integer_max: HashMap<&'static str, i64>,
    floats: HashMap<&'static str, f64>,
    booleans: HashMap<&'static str, bool>,
    enumerations: HashMap<&'static str, String>,
    failing: HashSet<String>,
    info: DetectorInfo,
    max_frame_rate: f64,
    closed: bool,
}

/// GenICam node map of a simulated monochrome GigE camera.
///
/// `PayloadSize`, `PixelSize`, `ExposureTimeAbs` and `ResultingFrameRateAbs`
/// are derived from the writable nodes, like on the real device.
#[derive(Debug, Clone)]
pub struct MockNodeMap {
    state: Arc<Mutex<NodeState>>,
    log: EventLog,
}

impl MockNodeMap {
    fn with_log(width: u32, height: u32, log: EventLog) -> Self {
        let width = i64::from(width);
        let height = i64::from(height);

        let integers = HashMap::from([
            (nodes::WIDTH, width / 2),
            (nodes::HEIGHT, height / 2),
            (nodes::OFFSET_X, 8),
            (nodes::OFFSET_Y, 8),
            (nodes::EXPOSURE_TIME_RAW, 100),
        ]);
        let integer_max = HashMap::from([(nodes::WIDTH, width), (nodes::HEIGHT, height)]);
        let floats = HashMap::from([(nodes::EXPOSURE_TIME_BASE_ABS, 100.0)]);
        let booleans = HashMap::from([(nodes::ACQUISITION_FRAME_RATE_ENABLE, true)]);
        let enumerations = HashMap::from([
            (nodes::PIXEL_FORMAT, "Mono8".to_string()),
            (nodes::TRIGGER_SELECTOR, "FrameStart".to_string()),
            (nodes::TRIGGER_MODE, "Off".to_string()),
            (nodes::ACQUISITION_MODE, "SingleFrame".to_string()),
            (nodes::EXPOSURE_MODE, "Timed".to_string()),
        ]);

        Self {
            state: Arc::new(Mutex::new(NodeState {
                integers,
                integer_max,
                floats,
                booleans,
                enumerations,
                failing: HashSet::new(),
                info: DetectorInfo {
                    vendor: "Basler".into(),
                    model: "scA640-74gm".into(),
                    serial_number: "21000001".into(),
                    ip_address: "127.0.0.1".into(),
                },
                max_frame_rate: 74.0,
                closed: false,
            })),
            log,
        }
    }

    /// Make every access to `node` fail with a hardware error.
    pub fn fail_node(&self, node: &str) {
        self.state.lock().failing.insert(node.to_string());
    }

    /// Undo [`fail_node`](Self::fail_node).
    pub fn heal_node(&self, node: &str) {
        self.state.lock().failing.remove(node);
    }

    pub fn set_ip_address(&self, ip: &str) {
        self.state.lock().info.ip_address = ip.to_string();
    }

    /// Current value of a writable integer node, for assertions.
    pub fn integer_value(&self, node: &str) -> Option<i64> {
        self.state.lock().integers.get(node).copied()
    }

    /// Current value of an enumeration node, for assertions.
    pub fn enumeration_value(&self, node: &str) -> Option<String> {
        self.state.lock().enumerations.get(node).cloned()
    }

    pub fn boolean_value(&self, node: &str) -> Option<bool> {
        self.state.lock().booleans.get(node).copied()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check(state: &NodeState, node: &str) -> DaqResult<()> {
        if state.closed {
            return Err(DaqError::driver(
                DRIVER,
                DriverErrorKind::Communication,
                "device is closed",
            ));
        }
        if state.failing.contains(node) {
            return Err(DaqError::driver(
                DRIVER,
                DriverErrorKind::Hardware,
                format!("access to node {} failed", node),
            ));
        }
        Ok(())
    }

    fn not_found(node: &str) -> DaqError {
        DaqError::driver(
            DRIVER,
            DriverErrorKind::NotFound,
            format!("node {} not found", node),
        )
    }

    fn static_name(node: &str) -> DaqResult<&'static str> {
        const KNOWN: &[&str] = &[
            nodes::PIXEL_FORMAT,
            nodes::PIXEL_SIZE,
            nodes::OFFSET_X,
            nodes::OFFSET_Y,
            nodes::WIDTH,
            nodes::HEIGHT,
            nodes::PAYLOAD_SIZE,
            nodes::TRIGGER_SELECTOR,
            nodes::TRIGGER_MODE,
            nodes::ACQUISITION_MODE,
            nodes::ACQUISITION_FRAME_RATE_ENABLE,
            nodes::EXPOSURE_MODE,
            nodes::EXPOSURE_TIME_ABS,
            nodes::EXPOSURE_TIME_BASE_ABS,
            nodes::EXPOSURE_TIME_RAW,
            nodes::RESULTING_FRAME_RATE_ABS,
            nodes::ACQUISITION_START,
            nodes::ACQUISITION_STOP,
        ];
        KNOWN
            .iter()
            .copied()
            .find(|known| *known == node)
            .ok_or_else(|| Self::not_found(node))
    }

    fn bytes_per_pixel(state: &NodeState) -> i64 {
        match state.enumerations.get(nodes::PIXEL_FORMAT).map(String::as_str) {
            Some("Mono8") => 1,
            _ => 2,
        }
    }

    fn exposure_us(state: &NodeState) -> f64 {
        let raw = state
            .integers
            .get(nodes::EXPOSURE_TIME_RAW)
            .copied()
            .unwrap_or(1);
        let base = state
            .floats
            .get(nodes::EXPOSURE_TIME_BASE_ABS)
            .copied()
            .unwrap_or(0.0);
        raw as f64 * base
    }
}

impl super::device::FeatureAccess for MockNodeMap {
    fn integer(&self, name: &str) -> DaqResult<i64> {
        let state = self.state.lock();
        Self::check(&state, name)?;
        if name == nodes::PAYLOAD_SIZE {
            let width = state.integers.get(nodes::WIDTH).copied().unwrap_or(0);
            let height = state.integers.get(nodes::HEIGHT).copied().unwrap_or(0);
            return Ok(width * height * Self::bytes_per_pixel(&state));
        }
        state
            .integers
            .get(name)
            .copied()
            .ok_or_else(|| Self::not_found(name))
    }

    fn integer_max(&self, name: &str) -> DaqResult<i64> {
        let state = self.state.lock();
        Self::check(&state, name)?;
        state
            .integer_max
            .get(name)
            .copied()
            .ok_or_else(|| Self::not_found(name))
    }

    fn set_integer(&mut self, name: &str, value: i64) -> DaqResult<()> {
        let key = Self::static_name(name)?;
        let mut state = self.state.lock();
        Self::check(&state, name)?;
        if !state.integers.contains_key(key) {
            return Err(Self::not_found(name));
        }
        if let Some(max) = state.integer_max.get(key) {
            if value > *max || value < 0 {
                return Err(DaqError::driver(
                    DRIVER,
                    DriverErrorKind::InvalidParameter,
                    format!("{} = {} out of range [0, {}]", name, value, max),
                ));
            }
        }
        trace!(node = name, value, "set integer");
        state.integers.insert(key, value);
        Ok(())
    }

    fn float(&self, name: &str) -> DaqResult<f64> {
        let state = self.state.lock();
        Self::check(&state, name)?;
        match name {
            nodes::EXPOSURE_TIME_ABS => Ok(Self::exposure_us(&state)),
            nodes::RESULTING_FRAME_RATE_ABS => {
                let exposure_s = Self::exposure_us(&state) * 1e-6;
                if exposure_s <= 0.0 {
                    Ok(state.max_frame_rate)
                } else {
                    Ok(state.max_frame_rate.min(1.0 / exposure_s))
                }
            }
            _ => state
                .floats
                .get(name)
                .copied()
                .ok_or_else(|| Self::not_found(name)),
        }
    }

    fn set_float(&mut self, name: &str, value: f64) -> DaqResult<()> {
        let key = Self::static_name(name)?;
        let mut state = self.state.lock();
        Self::check(&state, name)?;
        if !state.floats.contains_key(key) {
            return Err(Self::not_found(name));
        }
        state.floats.insert(key, value);
        Ok(())
    }

    fn set_boolean(&mut self, name: &str, value: bool) -> DaqResult<()> {
        let key = Self::static_name(name)?;
        let mut state = self.state.lock();
        Self::check(&state, name)?;
        state.booleans.insert(key, value);
        Ok(())
    }

    fn enumeration(&self, name: &str) -> DaqResult<String> {
        let state = self.state.lock();
        Self::check(&state, name)?;
        if name == nodes::PIXEL_SIZE {
            let format = state
                .enumerations
                .get(nodes::PIXEL_FORMAT)
                .map(String::as_str)
                .unwrap_or_default();
            let size = match format {
                "Mono8" => "Bpp8",
                "Mono12" | "Mono12Packed" => "Bpp12",
                "Mono16" => "Bpp16",
                _ => "Bpp10",
            };
            return Ok(size.to_string());
        }
        state
            .enumerations
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found(name))
    }

    fn set_enumeration(&mut self, name: &str, value: &str) -> DaqResult<()> {
        let key = Self::static_name(name)?;
        let mut state = self.state.lock();
        Self::check(&state, name)?;
        trace!(node = name, value, "set enumeration");
        state.enumerations.insert(key, value.to_string());
        Ok(())
    }

    fn execute(&mut self, name: &str) -> DaqResult<()> {
        let state = self.state.lock();
        Self::check(&state, name)?;
        Self::static_name(name)?;
        self.log.lock().push(MockEvent::Execute(name.to_string()));
        Ok(())
    }

    fn device_info(&self) -> DetectorInfo {
        self.state.lock().info.clone()
    }

    fn close(&mut self) -> DaqResult<()> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            self.log.lock().push(MockEvent::CloseDevice);
        }
        Ok(())
    }
}

// =============================================================================
// Stream grabber
// =============================================================================

/// Scripted outcome of one `wait_and_retrieve` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockTransfer {
    /// Full frame written into the oldest queued buffer.
    Grab,
    /// Transfer completes with only `len` payload bytes.
    Short(usize),
    /// Transfer completes with failure status.
    Fail { code: u32, description: String },
    /// The camera aborts the transfer; the buffer comes back `Canceled`.
    Cancel,
    /// Nothing arrives within the timeout.
    Timeout,
    /// The wait itself fails.
    Error(String),
}

/// Outcome of a wait that hands a buffer back.
#[derive(Debug)]
enum Delivery {
    /// Frame written; `Some(len)` truncates the reported payload.
    Frame(Option<usize>),
    Fail { code: u32, description: String },
    Cancel,
}

/// Memory region registered by the controller.
#[derive(Debug, Clone, Copy)]
struct Region {
    addr: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct StreamState {
    prepared: bool,
    max_buffer_size: usize,
    max_buffer_count: usize,
    registered: BTreeMap<BufferHandle, Region>,
    next_handle: usize,
    queued: VecDeque<BufferHandle>,
    canceled: VecDeque<GrabResult>,
    script: VecDeque<MockTransfer>,
    frame_interval: Duration,
    sequence: u64,
    max_queued: usize,
    violations: Vec<String>,
    fail_register_after: Option<usize>,
    fail_deregister: bool,
    ignore_cancel: bool,
    closed: bool,
}

/// Stream grabber that "transfers" synthetic frames into registered buffers.
///
/// Each grabbed frame is a 16 bit little-endian ramp whose first pixel is the
/// transfer sequence number, so tests can tell frames apart.
#[derive(Debug, Clone)]
pub struct MockStream {
    state: Arc<Mutex<StreamState>>,
    log: EventLog,
}

impl MockStream {
    fn with_log(log: EventLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState {
                frame_interval: Duration::from_millis(1),
                ..Default::default()
            })),
            log,
        }
    }

    /// Append outcomes for the next `wait_and_retrieve` calls.
    ///
    /// Once the script is exhausted every wait grabs a full frame.
    pub fn push_transfers(&self, transfers: impl IntoIterator<Item = MockTransfer>) {
        self.state.lock().script.extend(transfers);
    }

    /// Simulated readout time of one frame.
    pub fn set_frame_interval(&self, interval: Duration) {
        self.state.lock().frame_interval = interval;
    }

    /// Fail registration once `count` buffers are registered; `None` heals.
    pub fn fail_register_after(&self, count: Option<usize>) {
        self.state.lock().fail_register_after = count;
    }

    pub fn fail_deregister(&self, fail: bool) {
        self.state.lock().fail_deregister = fail;
    }

    /// Make `cancel()` leave queued buffers queued, like a wedged transport.
    pub fn ignore_cancel(&self, ignore: bool) {
        self.state.lock().ignore_cancel = ignore;
    }

    /// Protocol violations observed so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn registered_count(&self) -> usize {
        self.state.lock().registered.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Highest number of simultaneously queued buffers.
    pub fn max_queued(&self) -> usize {
        self.state.lock().max_queued
    }

    pub fn is_prepared(&self) -> bool {
        self.state.lock().prepared
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn record(&self, event: MockEvent) {
        self.log.lock().push(event);
    }

    fn violation(state: &mut StreamState, message: String) -> DaqError {
        debug!(%message, "mock transport protocol violation");
        state.violations.push(message.clone());
        DaqError::TransferProtocol(message)
    }

    /// Write a frame into the oldest queued buffer and return its result.
    fn complete(&self, delivery: Delivery) -> Option<GrabResult> {
        let mut state = self.state.lock();
        let handle = state.queued.pop_front()?;
        let Some(region) = state.registered.get(&handle).copied() else {
            let err = Self::violation(&mut state, format!("{} queued but not registered", handle));
            return Some(GrabResult {
                handle,
                status: GrabStatus::Failed {
                    code: 0xE100_0014,
                    description: err.to_string(),
                },
            });
        };

        let status = match delivery {
            Delivery::Frame(short) => {
                let sequence = state.sequence;
                state.sequence += 1;
                // SAFETY: the region belongs to a GrabBuffer that is registered
                // and queued. The controller keeps it alive and does not read it
                // until this transfer has been retrieved.
                let data = unsafe {
                    std::slice::from_raw_parts_mut(region.addr as *mut u8, region.len)
                };
                fill_pattern(data, sequence);
                let payload_size = short.map_or(region.len, |len| len.min(region.len));
                GrabStatus::Grabbed { payload_size }
            }
            Delivery::Fail { code, description } => GrabStatus::Failed { code, description },
            Delivery::Cancel => GrabStatus::Canceled,
        };
        Some(GrabResult { handle, status })
    }
}

fn fill_pattern(data: &mut [u8], sequence: u64) {
    let first = (sequence as u16) & PIXEL_MASK;
    for (i, pixel) in data.chunks_exact_mut(2).enumerate() {
        let value = first.wrapping_add(i as u16) & PIXEL_MASK;
        pixel.copy_from_slice(&value.to_le_bytes());
    }
}

/// Sequence number encoded in a frame produced by [`MockStream`].
pub fn frame_sequence(frame: &[u8]) -> Option<u16> {
    let bytes = frame.get(..2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[async_trait]
impl StreamingSession for MockStream {
    fn prepare(&mut self, max_buffer_size: usize, max_buffer_count: usize) -> DaqResult<()> {
        let mut state = self.state.lock();
        if state.prepared {
            return Err(Self::violation(&mut state, "prepare while prepared".into()));
        }
        state.prepared = true;
        state.max_buffer_size = max_buffer_size;
        state.max_buffer_count = max_buffer_count;
        drop(state);
        self.record(MockEvent::Prepare {
            max_buffer_size,
            max_buffer_count,
        });
        Ok(())
    }

    fn register_buffer(&mut self, buffer: &mut GrabBuffer) -> DaqResult<BufferHandle> {
        let mut state = self.state.lock();
        if !state.prepared {
            return Err(Self::violation(&mut state, "register before prepare".into()));
        }
        let max_buffer_size = state.max_buffer_size;
        if buffer.capacity() > max_buffer_size {
            return Err(Self::violation(
                &mut state,
                format!(
                    "buffer of {} bytes exceeds max buffer size {}",
                    buffer.capacity(),
                    max_buffer_size
                ),
            ));
        }
        if state.registered.len() >= state.max_buffer_count {
            return Err(Self::violation(&mut state, "too many buffers registered".into()));
        }
        if state.fail_register_after == Some(state.registered.len()) {
            return Err(DaqError::driver(
                DRIVER,
                DriverErrorKind::Hardware,
                "buffer registration refused",
            ));
        }

        let handle = BufferHandle(state.next_handle);
        state.next_handle += 1;
        state.registered.insert(
            handle,
            Region {
                addr: buffer.as_mut_ptr() as usize,
                len: buffer.capacity(),
            },
        );
        drop(state);
        self.record(MockEvent::Register(handle));
        Ok(handle)
    }

    fn queue(&mut self, handle: BufferHandle) -> DaqResult<()> {
        let mut state = self.state.lock();
        if !state.registered.contains_key(&handle) {
            return Err(Self::violation(&mut state, format!("queue of unregistered {}", handle)));
        }
        if state.queued.contains(&handle) {
            return Err(Self::violation(&mut state, format!("{} queued twice", handle)));
        }
        state.queued.push_back(handle);
        state.max_queued = state.max_queued.max(state.queued.len());
        drop(state);
        self.record(MockEvent::Queue(handle));
        Ok(())
    }

    async fn wait_and_retrieve(&mut self, timeout: Duration) -> DaqResult<Completion> {
        let (transfer, interval, has_queued) = {
            let mut state = self.state.lock();
            let transfer = state.script.pop_front().unwrap_or(MockTransfer::Grab);
            (transfer, state.frame_interval, !state.queued.is_empty())
        };

        let delivery = match transfer {
            MockTransfer::Error(message) => {
                return Err(DaqError::driver(
                    DRIVER,
                    DriverErrorKind::Communication,
                    message,
                ))
            }
            MockTransfer::Timeout => None,
            _ if !has_queued || interval > timeout => None,
            MockTransfer::Grab => Some(Delivery::Frame(None)),
            MockTransfer::Short(len) => Some(Delivery::Frame(Some(len))),
            MockTransfer::Fail { code, description } => Some(Delivery::Fail { code, description }),
            MockTransfer::Cancel => Some(Delivery::Cancel),
        };
        let Some(delivery) = delivery else {
            tokio::time::sleep(timeout).await;
            self.record(MockEvent::Timeout);
            return Ok(Completion::Timeout);
        };

        tokio::time::sleep(interval).await;
        match self.complete(delivery) {
            Some(result) => {
                self.record(MockEvent::Retrieve(result.handle, result.status.clone()));
                Ok(Completion::Ready(result))
            }
            None => {
                self.record(MockEvent::Timeout);
                Ok(Completion::Timeout)
            }
        }
    }

    fn retrieve_ready(&mut self) -> DaqResult<Option<GrabResult>> {
        let result = self.state.lock().canceled.pop_front();
        if let Some(result) = &result {
            self.record(MockEvent::Drain(result.handle));
        }
        Ok(result)
    }

    fn deregister_buffer(&mut self, handle: BufferHandle) -> DaqResult<()> {
        let mut state = self.state.lock();
        if state.queued.contains(&handle) {
            return Err(Self::violation(
                &mut state,
                format!("{} deregistered while queued", handle),
            ));
        }
        if state.fail_deregister {
            return Err(DaqError::driver(
                DRIVER,
                DriverErrorKind::Hardware,
                format!("deregistering {} failed", handle),
            ));
        }
        if state.registered.remove(&handle).is_none() {
            return Err(Self::violation(
                &mut state,
                format!("deregister of unknown {}", handle),
            ));
        }
        drop(state);
        self.record(MockEvent::Deregister(handle));
        Ok(())
    }

    fn cancel(&mut self) -> DaqResult<()> {
        let mut state = self.state.lock();
        if !state.ignore_cancel {
            while let Some(handle) = state.queued.pop_front() {
                state.canceled.push_back(GrabResult {
                    handle,
                    status: GrabStatus::Canceled,
                });
            }
        }
        drop(state);
        self.record(MockEvent::Cancel);
        Ok(())
    }

    fn finish(&mut self) -> DaqResult<()> {
        let mut state = self.state.lock();
        if !state.prepared {
            return Ok(());
        }
        if !state.registered.is_empty() {
            let count = state.registered.len();
            return Err(Self::violation(
                &mut state,
                format!("finish with {} buffer(s) still registered", count),
            ));
        }
        state.prepared = false;
        state.canceled.clear();
        drop(state);
        self.record(MockEvent::Finish);
        Ok(())
    }

    fn close(&mut self) -> DaqResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        drop(state);
        self.record(MockEvent::CloseStream);
        Ok(())
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Node map and stream grabber of one simulated camera.
#[derive(Debug, Clone)]
pub struct MockBackend {
    pub nodes: MockNodeMap,
    pub stream: MockStream,
    log: EventLog,
}

impl MockBackend {
    /// Simulated camera with a `width` x `height` sensor.
    pub fn new(width: u32, height: u32) -> Self {
        let log = EventLog::default();
        Self {
            nodes: MockNodeMap::with_log(width, height, log.clone()),
            stream: MockStream::with_log(log.clone()),
            log,
        }
    }

    /// All events recorded so far, in order.
    pub fn events(&self) -> Vec<MockEvent> {
        self.log.lock().clone()
    }

    pub fn clear_events(&self) {
        self.log.lock().clear();
    }
}

// =============================================================================
// Frame sink
// =============================================================================

#[derive(Debug, Default)]
struct SinkState {
    start_timestamp: Option<DateTime<Utc>>,
    written: Vec<(u64, Vec<u8>)>,
    ready: Vec<FrameInfo>,
    fail_write_at: Option<u64>,
}

/// [`FrameSink`] that keeps every frame and notification for inspection.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    slot_capacity: usize,
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn new(slot_capacity: usize) -> Self {
        Self {
            slot_capacity,
            state: Arc::default(),
        }
    }

    /// Make `write_frame` fail for `frame_nb`.
    pub fn fail_write_at(&self, frame_nb: u64) {
        self.state.lock().fail_write_at = Some(frame_nb);
    }

    /// Frame numbers passed to `notify_frame_ready`, in call order.
    pub fn ready_frames(&self) -> Vec<u64> {
        self.state.lock().ready.iter().map(|i| i.frame_nb).collect()
    }

    pub fn ready_infos(&self) -> Vec<FrameInfo> {
        self.state.lock().ready.clone()
    }

    /// Payloads written, in call order.
    pub fn written(&self) -> Vec<(u64, Vec<u8>)> {
        self.state.lock().written.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.written.clear();
        state.ready.clear();
    }
}

impl FrameSink for RecordingSink {
    fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    fn set_start_timestamp(&self, at: DateTime<Utc>) {
        self.state.lock().start_timestamp = Some(at);
    }

    fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.state.lock().start_timestamp
    }

    fn write_frame(&self, frame_nb: u64, payload: &[u8]) -> DaqResult<()> {
        if payload.len() > self.slot_capacity {
            return Err(DaqError::FrameTooLarge {
                bytes: payload.len(),
                max_bytes: self.slot_capacity,
            });
        }
        let mut state = self.state.lock();
        if state.fail_write_at == Some(frame_nb) {
            return Err(DaqError::InvalidParameter(format!(
                "slot for frame {} unavailable",
                frame_nb
            )));
        }
        state.written.push((frame_nb, payload.to_vec()));
        Ok(())
    }

    fn notify_frame_ready(&self, info: FrameInfo) {
        self.state.lock().ready.push(info);
    }
}

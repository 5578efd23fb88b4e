//! Stream grabber session: the queue/retrieve protocol with the transport.
//!
//! Protocol, in order:
//!
//! 1. `prepare(max_buffer_size, max_buffer_count)`
//! 2. `register_buffer` for every grab buffer
//! 3. `queue` buffers, then repeatedly `wait_and_retrieve` and re-`queue`
//! 4. `cancel`, drain with `retrieve_ready` until it returns `None`
//! 5. `deregister_buffer` for every buffer (never while queued)
//! 6. `finish`

use async_trait::async_trait;
use daq_core::DaqResult;
use std::fmt;
use std::time::Duration;

use super::grab_buffer::GrabBuffer;

/// Opaque transport registration handle of one grab buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) usize);

impl BufferHandle {
    /// Raw index, for logging.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Outcome of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrabStatus {
    /// A frame was written into the buffer.
    Grabbed { payload_size: usize },
    /// The transfer failed; the buffer content is undefined.
    Failed { code: u32, description: String },
    /// The buffer was returned unused by `cancel()`.
    Canceled,
}

/// A completed transfer together with the buffer it used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabResult {
    pub handle: BufferHandle,
    pub status: GrabStatus,
}

/// Result of one bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Ready(GrabResult),
    Timeout,
}

/// Transport-layer stream of one camera.
///
/// Implementations are owned by exactly one acquisition controller, which
/// guarantees that at most one `wait_and_retrieve` is outstanding.
#[async_trait]
pub trait StreamingSession: Send {
    /// Reserve transport resources for up to `max_buffer_count` buffers of at
    /// most `max_buffer_size` bytes. Errors if already prepared.
    fn prepare(&mut self, max_buffer_size: usize, max_buffer_count: usize) -> DaqResult<()>;

    /// Register a buffer's memory; the returned handle is used for queuing.
    fn register_buffer(&mut self, buffer: &mut GrabBuffer) -> DaqResult<BufferHandle>;

    /// Submit a registered buffer for the next frame. Non-blocking.
    fn queue(&mut self, handle: BufferHandle) -> DaqResult<()>;

    /// Wait up to `timeout` for the next completed transfer.
    async fn wait_and_retrieve(&mut self, timeout: Duration) -> DaqResult<Completion>;

    /// Retrieve an already completed transfer without waiting.
    fn retrieve_ready(&mut self) -> DaqResult<Option<GrabResult>>;

    /// Drop the transport association. The handle must not be queued.
    fn deregister_buffer(&mut self, handle: BufferHandle) -> DaqResult<()>;

    /// Abort all queued buffers, making them retrievable as `Canceled`.
    fn cancel(&mut self) -> DaqResult<()>;

    /// Release grab resources. Idempotent.
    fn finish(&mut self) -> DaqResult<()>;

    /// Close the stream grabber for good.
    fn close(&mut self) -> DaqResult<()>;
}

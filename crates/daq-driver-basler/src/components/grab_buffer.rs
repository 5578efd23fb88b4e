//! Grab buffers: the unit of DMA transfer.
//!
//! A `GrabBuffer` owns one fixed-size, heap allocated block. Once registered
//! with a [`StreamingSession`](super::stream::StreamingSession), the transport
//! writes frames into it directly; the controller only reads it back after
//! the transfer was retrieved.
//!
//! The block is never resized, so the base pointer handed to the transport
//! stays valid until [`GrabBuffer::release`] or drop.

use daq_core::{DaqError, DaqResult};

use super::stream::BufferHandle;

#[derive(Debug)]
pub struct GrabBuffer {
    data: Vec<u8>,
    capacity: usize,
    handle: Option<BufferHandle>,
}

impl GrabBuffer {
    /// Allocate a zeroed buffer of `size` bytes.
    ///
    /// Allocation failure is reported as [`DaqError::OutOfMemory`] instead of
    /// aborting the process.
    pub fn allocate(size: usize) -> DaqResult<Self> {
        if size == 0 {
            return Err(DaqError::InvalidParameter(
                "grab buffer size must be > 0".into(),
            ));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| DaqError::OutOfMemory { bytes: size })?;
        data.resize(size, 0);

        Ok(Self {
            data,
            capacity: size,
            handle: None,
        })
    }

    /// Byte capacity requested at allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the memory has been released.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.data.is_empty()
    }

    /// Base pointer for registration with the transport.
    ///
    /// The pointer is valid for [`capacity`](Self::capacity) bytes until
    /// [`release`](Self::release) is called or the buffer is dropped.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    /// First `len` bytes of a completed transfer.
    ///
    /// Returns `None` if `len` exceeds the buffer or the memory was released.
    pub fn payload(&self, len: usize) -> Option<&[u8]> {
        self.data.get(..len)
    }

    /// Transport handle, set once registered.
    #[inline]
    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: Option<BufferHandle>) {
        self.handle = handle;
    }

    /// Free the memory. Idempotent.
    ///
    /// Must only be called after the buffer was deregistered.
    pub fn release(&mut self) {
        if !self.is_released() {
            tracing::trace!(bytes = self.capacity, "releasing grab buffer");
            self.data = Vec::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zeroed() {
        let buf = GrabBuffer::allocate(64).unwrap();
        assert_eq!(buf.capacity(), 64);
        assert!(!buf.is_released());
        assert_eq!(buf.payload(64).unwrap(), &[0u8; 64][..]);
        assert!(buf.handle().is_none());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            GrabBuffer::allocate(0),
            Err(DaqError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_huge_allocation_surfaces_out_of_memory() {
        let err = GrabBuffer::allocate(usize::MAX).unwrap_err();
        assert!(matches!(err, DaqError::OutOfMemory { bytes } if bytes == usize::MAX));
    }

    #[test]
    fn test_payload_bounds() {
        let buf = GrabBuffer::allocate(16).unwrap();
        assert_eq!(buf.payload(8).map(<[u8]>::len), Some(8));
        assert!(buf.payload(17).is_none());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut buf = GrabBuffer::allocate(16).unwrap();
        buf.release();
        assert!(buf.is_released());
        assert!(buf.payload(1).is_none());
        buf.release();
        assert!(buf.is_released());
        // Capacity is remembered for diagnostics
        assert_eq!(buf.capacity(), 16);
    }
}

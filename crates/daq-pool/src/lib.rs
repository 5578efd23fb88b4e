//! Frame buffer pool receiving completed camera frames.
//!
//! The acquisition framework owns the memory frames are delivered into. This
//! crate provides its in-process implementation, [`FrameRing`]: a fixed ring of
//! pre-allocated slots addressed by acquisition frame number, implementing the
//! [`daq_core::FrameSink`] seam the camera driver writes through.
//!
//! # Example
//!
//! ```
//! use daq_core::FrameSink;
//! use daq_pool::FrameRing;
//!
//! // 4 slots of one 16-bit 640x480 frame each
//! let ring = FrameRing::new(4, 640 * 480 * 2);
//! ring.write_frame(0, &vec![0u8; 640 * 480 * 2]).unwrap();
//! assert_eq!(ring.slot_index(5), 1);
//! ```

pub mod frame_ring;

pub use frame_ring::FrameRing;

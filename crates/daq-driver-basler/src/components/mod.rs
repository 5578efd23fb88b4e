pub mod acquisition;
pub mod device;
pub mod grab_buffer;
#[cfg(feature = "mock")]
pub mod mock;
#[cfg(feature = "pylon_sdk")]
pub mod pylon;
pub mod stream;

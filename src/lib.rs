//! Headless acquisition from Basler GigE cameras.
//!
//! Wires the pieces of the workspace into an application:
//! - [`config`]: Figment-backed configuration (TOML file + environment)
//! - [`logging`]: tracing subscriber setup
//! - [`camera`]: opening the configured camera with a [`daq_pool::FrameRing`]
//!   as frame destination
//!
//! The driver itself lives in `daq-driver-basler`; this crate only decides
//! which backend to open and where frames go.

pub mod camera;
pub mod config;
pub mod logging;

pub use config::AppConfig;

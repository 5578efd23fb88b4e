//! Basler pylon C transport.
//!
//! Implements [`FeatureAccess`] and [`StreamingSession`] on top of the pylon C
//! SDK (`pylonc-sys`). Only compiled with the `pylon_sdk` feature.
//!
//! ## SDK Reference Counting
//!
//! `PylonInitialize()` and `PylonTerminate()` act on the whole process. Every
//! open device holds an [`SdkGuard`]; the SDK is terminated when the last one
//! is dropped.

use async_trait::async_trait;
use daq_core::{DaqError, DaqResult, DetectorInfo, DriverErrorKind};
use pylonc_sys::*;
use std::ffi::{c_char, c_void, CStr, CString};
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::device::FeatureAccess;
use super::grab_buffer::GrabBuffer;
use super::stream::{BufferHandle, Completion, GrabResult, GrabStatus, StreamingSession};

pub const DRIVER: &str = "basler";

/// String properties are read into buffers of this size.
const STRING_BUFFER_LEN: usize = 256;

static SDK_REF_COUNT: AtomicU32 = AtomicU32::new(0);
static SDK_INIT_MUTEX: Mutex<()> = Mutex::new(());

/// Text of the last GenApi error of the calling thread.
fn last_error_message() -> String {
    let mut buf = vec![0 as c_char; STRING_BUFFER_LEN];
    let mut len = buf.len();
    // SAFETY: buf is valid for len bytes; the SDK writes a NUL terminated string.
    unsafe {
        if GenApiGetLastErrorMessage(buf.as_mut_ptr(), &mut len) != GENAPI_E_OK {
            return "unknown pylon error".into();
        }
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}

fn check(result: GENAPIC_RESULT, kind: DriverErrorKind, context: &str) -> DaqResult<()> {
    if result == GENAPI_E_OK {
        return Ok(());
    }
    Err(DaqError::driver(
        DRIVER,
        kind,
        format!(
            "{} failed: {} (0x{:08x})",
            context,
            last_error_message(),
            result as u32
        ),
    ))
}

fn c_name(name: &str) -> DaqResult<CString> {
    CString::new(name)
        .map_err(|_| DaqError::InvalidParameter(format!("invalid node name {:?}", name)))
}

/// Keeps the pylon runtime initialized while alive.
struct SdkGuard;

impl SdkGuard {
    fn acquire() -> DaqResult<Self> {
        let _guard = SDK_INIT_MUTEX
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if SDK_REF_COUNT.load(Ordering::SeqCst) == 0 {
            info!("Initializing pylon runtime");
            // SAFETY: serialized by SDK_INIT_MUTEX.
            check(
                unsafe { PylonInitialize() },
                DriverErrorKind::Initialization,
                "PylonInitialize",
            )?;
        }
        SDK_REF_COUNT.fetch_add(1, Ordering::SeqCst);
        Ok(Self)
    }
}

impl Drop for SdkGuard {
    fn drop(&mut self) {
        let _guard = SDK_INIT_MUTEX
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if SDK_REF_COUNT.fetch_sub(1, Ordering::SeqCst) == 1 {
            info!("Terminating pylon runtime");
            // SAFETY: last user of the runtime, serialized by SDK_INIT_MUTEX.
            unsafe {
                PylonTerminate();
            }
        }
    }
}

/// Opened pylon device, shared by the node map and the stream grabber.
struct DeviceHandle {
    handle: PYLON_DEVICE_HANDLE,
    open: AtomicBool,
    // Dropped after the device is destroyed
    _sdk: SdkGuard,
}

// SAFETY: pylon device handles may be used from any thread. All calls on one
// device are serialized by the acquisition controller task.
unsafe impl Send for DeviceHandle {}
unsafe impl Sync for DeviceHandle {}

impl DeviceHandle {
    fn close(&self) -> DaqResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Closing camera");
            // SAFETY: handle is valid until drop; closed at most once.
            check(
                unsafe { PylonDeviceClose(self.handle) },
                DriverErrorKind::Shutdown,
                "PylonDeviceClose",
            )?;
        }
        Ok(())
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "Closing camera on drop failed");
        }
        // SAFETY: no other reference to the handle remains.
        let result = unsafe { PylonDestroyDevice(self.handle) };
        if result != GENAPI_E_OK {
            warn!(error = %last_error_message(), "PylonDestroyDevice failed");
        }
    }
}

/// Resolve an IPv4 address or DNS name.
pub fn resolve_ipv4(host: &str) -> DaqResult<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = (host, 0).to_socket_addrs().map_err(|e| {
        DaqError::driver(
            DRIVER,
            DriverErrorKind::NotFound,
            format!("cannot resolve camera host {}: {}", host, e),
        )
    })?;
    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| {
            DaqError::driver(
                DRIVER,
                DriverErrorKind::NotFound,
                format!("camera host {} has no IPv4 address", host),
            )
        })
}

fn device_info_property(info: PYLON_DEVICE_INFO_HANDLE, name: &str) -> DaqResult<String> {
    let name = c_name(name)?;
    let mut buf = vec![0 as c_char; STRING_BUFFER_LEN];
    let mut len = buf.len();
    // SAFETY: info handle comes from PylonGetDeviceInfoHandle; buf is valid for len.
    check(
        unsafe {
            PylonDeviceInfoGetPropertyValueByName(info, name.as_ptr(), buf.as_mut_ptr(), &mut len)
        },
        DriverErrorKind::Communication,
        "PylonDeviceInfoGetPropertyValueByName",
    )?;
    // SAFETY: the SDK wrote a NUL terminated string.
    Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned())
}

/// Entry point: find and open a camera.
pub struct PylonDevice;

impl PylonDevice {
    /// Open the GigE camera at `host` for control and streaming.
    ///
    /// Blocking; call from a blocking context.
    pub fn open(host: &str) -> DaqResult<(PylonNodeMap, PylonStream)> {
        let ip = resolve_ipv4(host)?.to_string();
        let sdk = SdkGuard::acquire()?;

        let mut device_count = 0usize;
        // SAFETY: runtime initialized by `sdk`.
        check(
            unsafe { PylonEnumerateDevices(&mut device_count) },
            DriverErrorKind::Initialization,
            "PylonEnumerateDevices",
        )?;
        info!(device_count, %ip, "Looking for camera");

        let mut found = None;
        for index in 0..device_count {
            let mut info_handle: PYLON_DEVICE_INFO_HANDLE = std::ptr::null_mut();
            // SAFETY: index < device_count from the enumeration above.
            check(
                unsafe { PylonGetDeviceInfoHandle(index, &mut info_handle) },
                DriverErrorKind::Initialization,
                "PylonGetDeviceInfoHandle",
            )?;
            // Non-GigE devices have no IpAddress property
            let Ok(device_ip) = device_info_property(info_handle, "IpAddress") else {
                continue;
            };
            if device_ip == ip {
                let info = DetectorInfo {
                    vendor: device_info_property(info_handle, "VendorName")?,
                    model: device_info_property(info_handle, "ModelName")?,
                    serial_number: device_info_property(info_handle, "SerialNumber")?,
                    ip_address: device_ip,
                };
                found = Some((index, info));
                break;
            }
        }

        let (index, info) = found.ok_or_else(|| {
            DaqError::driver(
                DRIVER,
                DriverErrorKind::NotFound,
                format!("no camera found at {}", ip),
            )
        })?;

        let mut raw_device: PYLON_DEVICE_HANDLE = std::ptr::null_mut();
        // SAFETY: index refers to an enumerated device.
        check(
            unsafe { PylonCreateDeviceByIndex(index, &mut raw_device) },
            DriverErrorKind::Initialization,
            "PylonCreateDeviceByIndex",
        )?;
        let access = (PYLONC_ACCESS_MODE_CONTROL | PYLONC_ACCESS_MODE_STREAM) as i32;
        // SAFETY: freshly created device handle.
        if let Err(err) = check(
            unsafe { PylonDeviceOpen(raw_device, access) },
            DriverErrorKind::Initialization,
            "PylonDeviceOpen",
        ) {
            // SAFETY: the device was created above and never opened.
            unsafe {
                PylonDestroyDevice(raw_device);
            }
            return Err(err);
        }
        let device = Arc::new(DeviceHandle {
            handle: raw_device,
            open: AtomicBool::new(true),
            _sdk: sdk,
        });
        info!(vendor = %info.vendor, model = %info.model, serial = %info.serial_number, "Camera opened");

        let stream = PylonStream::open(device.clone())?;
        Ok((PylonNodeMap { device, info }, stream))
    }
}

// =============================================================================
// Node map
// =============================================================================

/// GenICam node map of an open pylon device.
pub struct PylonNodeMap {
    device: Arc<DeviceHandle>,
    info: DetectorInfo,
}

impl PylonNodeMap {
    fn handle(&self) -> PYLON_DEVICE_HANDLE {
        self.device.handle
    }
}

impl FeatureAccess for PylonNodeMap {
    fn integer(&self, name: &str) -> DaqResult<i64> {
        let node = c_name(name)?;
        let mut value = 0i64;
        // SAFETY: valid device handle and NUL terminated node name.
        check(
            unsafe { PylonDeviceGetIntegerFeature(self.handle(), node.as_ptr(), &mut value) },
            DriverErrorKind::Communication,
            name,
        )?;
        Ok(value)
    }

    fn integer_max(&self, name: &str) -> DaqResult<i64> {
        let node = c_name(name)?;
        let mut value = 0i64;
        // SAFETY: as above.
        check(
            unsafe { PylonDeviceGetIntegerFeatureMax(self.handle(), node.as_ptr(), &mut value) },
            DriverErrorKind::Communication,
            name,
        )?;
        Ok(value)
    }

    fn set_integer(&mut self, name: &str, value: i64) -> DaqResult<()> {
        let node = c_name(name)?;
        debug!(node = name, value, "set integer");
        // SAFETY: as above.
        check(
            unsafe { PylonDeviceSetIntegerFeature(self.handle(), node.as_ptr(), value) },
            DriverErrorKind::Configuration,
            name,
        )
    }

    fn float(&self, name: &str) -> DaqResult<f64> {
        let node = c_name(name)?;
        let mut value = 0f64;
        // SAFETY: as above.
        check(
            unsafe { PylonDeviceGetFloatFeature(self.handle(), node.as_ptr(), &mut value) },
            DriverErrorKind::Communication,
            name,
        )?;
        Ok(value)
    }

    fn set_float(&mut self, name: &str, value: f64) -> DaqResult<()> {
        let node = c_name(name)?;
        debug!(node = name, value, "set float");
        // SAFETY: as above.
        check(
            unsafe { PylonDeviceSetFloatFeature(self.handle(), node.as_ptr(), value) },
            DriverErrorKind::Configuration,
            name,
        )
    }

    fn set_boolean(&mut self, name: &str, value: bool) -> DaqResult<()> {
        let node = c_name(name)?;
        // SAFETY: as above.
        check(
            unsafe { PylonDeviceSetBooleanFeature(self.handle(), node.as_ptr(), value) },
            DriverErrorKind::Configuration,
            name,
        )
    }

    fn enumeration(&self, name: &str) -> DaqResult<String> {
        let node = c_name(name)?;
        let mut buf = vec![0 as c_char; STRING_BUFFER_LEN];
        let mut len = buf.len();
        // SAFETY: buf is valid for len bytes.
        check(
            unsafe {
                PylonDeviceFeatureToString(self.handle(), node.as_ptr(), buf.as_mut_ptr(), &mut len)
            },
            DriverErrorKind::Communication,
            name,
        )?;
        // SAFETY: the SDK wrote a NUL terminated string.
        Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned())
    }

    fn set_enumeration(&mut self, name: &str, value: &str) -> DaqResult<()> {
        let node = c_name(name)?;
        let symbol = c_name(value)?;
        debug!(node = name, value, "set enumeration");
        // SAFETY: as above.
        check(
            unsafe { PylonDeviceFeatureFromString(self.handle(), node.as_ptr(), symbol.as_ptr()) },
            DriverErrorKind::Configuration,
            name,
        )
    }

    fn execute(&mut self, name: &str) -> DaqResult<()> {
        let node = c_name(name)?;
        // SAFETY: as above.
        check(
            unsafe { PylonDeviceExecuteCommandFeature(self.handle(), node.as_ptr()) },
            DriverErrorKind::Hardware,
            name,
        )
    }

    fn device_info(&self) -> DetectorInfo {
        self.info.clone()
    }

    fn close(&mut self) -> DaqResult<()> {
        self.device.close()
    }
}

// =============================================================================
// Stream grabber
// =============================================================================

/// Wait object handle that can be moved onto a blocking thread.
#[derive(Clone, Copy)]
struct WaitObject(PYLON_WAITOBJECT_HANDLE);

// SAFETY: pylon wait objects may be waited on from any thread.
unsafe impl Send for WaitObject {}

impl WaitObject {
    fn wait(&self, timeout_ms: u32) -> DaqResult<bool> {
        let mut ready = false;
        // SAFETY: the wait object belongs to an open stream grabber that
        // outlives this call (the controller awaits it before any teardown).
        check(
            unsafe { PylonWaitObjectWait(self.0, timeout_ms, &mut ready) },
            DriverErrorKind::Communication,
            "PylonWaitObjectWait",
        )?;
        Ok(ready)
    }
}

/// Stream grabber channel 0 of a pylon device.
pub struct PylonStream {
    device: Arc<DeviceHandle>,
    grabber: PYLON_STREAMGRABBER_HANDLE,
    wait_object: WaitObject,
    /// Registered buffers, indexed by [`BufferHandle`].
    buffers: Vec<Option<PYLON_STREAMBUFFER_HANDLE>>,
    prepared: bool,
    open: bool,
}

// SAFETY: owned by the acquisition controller; never used concurrently.
unsafe impl Send for PylonStream {}

impl PylonStream {
    fn open(device: Arc<DeviceHandle>) -> DaqResult<Self> {
        let mut channels = 0usize;
        // SAFETY: device is open.
        check(
            unsafe { PylonDeviceGetNumStreamGrabberChannels(device.handle, &mut channels) },
            DriverErrorKind::Initialization,
            "PylonDeviceGetNumStreamGrabberChannels",
        )?;
        if channels == 0 {
            return Err(DaqError::driver(
                DRIVER,
                DriverErrorKind::Initialization,
                "camera has no stream grabber channel",
            ));
        }

        let mut grabber: PYLON_STREAMGRABBER_HANDLE = std::ptr::null_mut();
        // SAFETY: channel 0 exists.
        check(
            unsafe { PylonDeviceGetStreamGrabber(device.handle, 0, &mut grabber) },
            DriverErrorKind::Initialization,
            "PylonDeviceGetStreamGrabber",
        )?;
        // SAFETY: grabber handle returned above.
        check(
            unsafe { PylonStreamGrabberOpen(grabber) },
            DriverErrorKind::Initialization,
            "PylonStreamGrabberOpen",
        )?;
        let mut wait_object: PYLON_WAITOBJECT_HANDLE = std::ptr::null_mut();
        // SAFETY: grabber is open.
        check(
            unsafe { PylonStreamGrabberGetWaitObject(grabber, &mut wait_object) },
            DriverErrorKind::Initialization,
            "PylonStreamGrabberGetWaitObject",
        )?;

        Ok(Self {
            device,
            grabber,
            wait_object: WaitObject(wait_object),
            buffers: Vec::new(),
            prepared: false,
            open: true,
        })
    }

    fn buffer(&self, handle: BufferHandle) -> DaqResult<PYLON_STREAMBUFFER_HANDLE> {
        self.buffers
            .get(handle.index())
            .copied()
            .flatten()
            .ok_or_else(|| DaqError::TransferProtocol(format!("{} is not registered", handle)))
    }

    /// Retrieve one completed transfer if the grabber has one.
    fn retrieve(&mut self) -> DaqResult<Option<GrabResult>> {
        // SAFETY: PylonGrabResult_t is a plain C struct; all-zero is valid.
        let mut result: PylonGrabResult_t = unsafe { std::mem::zeroed() };
        let mut ready = false;
        // SAFETY: grabber is open; result and ready are valid out pointers.
        check(
            unsafe { PylonStreamGrabberRetrieveResult(self.grabber, &mut result, &mut ready) },
            DriverErrorKind::Communication,
            "PylonStreamGrabberRetrieveResult",
        )?;
        if !ready {
            return Ok(None);
        }

        let index = self
            .buffers
            .iter()
            .position(|b| *b == Some(result.hBuffer))
            .ok_or_else(|| DaqError::TransferProtocol("result for unknown buffer".into()))?;
        let status = match result.Status {
            EPylonGrabStatus::Grabbed => GrabStatus::Grabbed {
                payload_size: result.PayloadSize as usize,
            },
            EPylonGrabStatus::Canceled => GrabStatus::Canceled,
            _ => GrabStatus::Failed {
                code: result.ErrorCode,
                description: format!("grab status {:?}", result.Status),
            },
        };
        Ok(Some(GrabResult {
            handle: BufferHandle(index),
            status,
        }))
    }
}

#[async_trait]
impl StreamingSession for PylonStream {
    fn prepare(&mut self, max_buffer_size: usize, max_buffer_count: usize) -> DaqResult<()> {
        if self.prepared {
            return Err(DaqError::TransferProtocol("grab already prepared".into()));
        }
        // SAFETY: grabber is open and not prepared.
        unsafe {
            check(
                PylonStreamGrabberSetMaxNumBuffer(self.grabber, max_buffer_count),
                DriverErrorKind::Configuration,
                "PylonStreamGrabberSetMaxNumBuffer",
            )?;
            check(
                PylonStreamGrabberSetMaxBufferSize(self.grabber, max_buffer_size),
                DriverErrorKind::Configuration,
                "PylonStreamGrabberSetMaxBufferSize",
            )?;
            check(
                PylonStreamGrabberPrepareGrab(self.grabber),
                DriverErrorKind::Configuration,
                "PylonStreamGrabberPrepareGrab",
            )?;
        }
        self.prepared = true;
        Ok(())
    }

    fn register_buffer(&mut self, buffer: &mut GrabBuffer) -> DaqResult<BufferHandle> {
        let mut raw: PYLON_STREAMBUFFER_HANDLE = std::ptr::null_mut();
        // SAFETY: the buffer memory stays valid and unmoved until it is
        // deregistered; the controller never frees a registered buffer.
        check(
            unsafe {
                PylonStreamGrabberRegisterBuffer(
                    self.grabber,
                    buffer.as_mut_ptr() as *mut c_void,
                    buffer.capacity(),
                    &mut raw,
                )
            },
            DriverErrorKind::Hardware,
            "PylonStreamGrabberRegisterBuffer",
        )?;
        self.buffers.push(Some(raw));
        Ok(BufferHandle(self.buffers.len() - 1))
    }

    fn queue(&mut self, handle: BufferHandle) -> DaqResult<()> {
        let raw = self.buffer(handle)?;
        // SAFETY: raw is registered with this grabber.
        check(
            unsafe {
                PylonStreamGrabberQueueBuffer(self.grabber, raw, handle.index() as *const c_void)
            },
            DriverErrorKind::Hardware,
            "PylonStreamGrabberQueueBuffer",
        )
    }

    async fn wait_and_retrieve(&mut self, timeout: Duration) -> DaqResult<Completion> {
        let wait_object = self.wait_object;
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let ready = tokio::task::spawn_blocking(move || wait_object.wait(timeout_ms))
            .await
            .map_err(|e| {
                DaqError::driver(
                    DRIVER,
                    DriverErrorKind::Communication,
                    format!("wait task failed: {}", e),
                )
            })??;
        if !ready {
            return Ok(Completion::Timeout);
        }
        match self.retrieve()? {
            Some(result) => Ok(Completion::Ready(result)),
            None => Ok(Completion::Timeout),
        }
    }

    fn retrieve_ready(&mut self) -> DaqResult<Option<GrabResult>> {
        self.retrieve()
    }

    fn deregister_buffer(&mut self, handle: BufferHandle) -> DaqResult<()> {
        let raw = self.buffer(handle)?;
        // SAFETY: raw is registered and, per the protocol, not queued.
        check(
            unsafe { PylonStreamGrabberDeregisterBuffer(self.grabber, raw) },
            DriverErrorKind::Shutdown,
            "PylonStreamGrabberDeregisterBuffer",
        )?;
        if let Some(slot) = self.buffers.get_mut(handle.index()) {
            *slot = None;
        }
        Ok(())
    }

    fn cancel(&mut self) -> DaqResult<()> {
        // SAFETY: grabber is open.
        check(
            unsafe { PylonStreamGrabberCancelGrab(self.grabber) },
            DriverErrorKind::Shutdown,
            "PylonStreamGrabberCancelGrab",
        )
    }

    fn finish(&mut self) -> DaqResult<()> {
        if !self.prepared {
            return Ok(());
        }
        // SAFETY: grabber is prepared.
        check(
            unsafe { PylonStreamGrabberFinishGrab(self.grabber) },
            DriverErrorKind::Shutdown,
            "PylonStreamGrabberFinishGrab",
        )?;
        self.prepared = false;
        self.buffers.clear();
        Ok(())
    }

    fn close(&mut self) -> DaqResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        // SAFETY: grabber is open; the device outlives it through `self.device`.
        check(
            unsafe { PylonStreamGrabberClose(self.grabber) },
            DriverErrorKind::Shutdown,
            "PylonStreamGrabberClose",
        )?;
        debug!(device_open = self.device.open.load(Ordering::SeqCst), "Stream grabber closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_ip() {
        assert_eq!(
            resolve_ipv4("192.168.0.10").unwrap(),
            Ipv4Addr::new(192, 168, 0, 10)
        );
    }

    #[test]
    fn test_resolve_localhost() {
        assert_eq!(resolve_ipv4("localhost").unwrap(), Ipv4Addr::LOCALHOST);
    }
}

//! Camera frame sources.
//!
//! This module provides the FrameSource side of the live pipeline:
//! - Camera drivers (V4L2 device nodes behind `ingest-v4l2`, synthetic `stub` devices)
//! - Device discovery across a bounded set of indices and capture backends
//! - Best-effort device configuration (resolution, rate, buffering, focus/exposure hints)
//! - The capture loop that feeds the single-slot `FrameSlot`
//!
//! Discovery tries every (index x backend) combination in order and keeps the first
//! device that opens. Property configuration is advisory: a device that rejects a
//! property is still used.

mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::Result;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::frame::{Frame, FrameSlot};

pub use normalize::{normalize_to_rgb, PixelFormat};
pub use synthetic::{SyntheticCamera, SyntheticDriver};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Driver;

/// Default device indices probed during discovery.
pub const DEFAULT_CAMERA_INDICES: [u32; 6] = [0, 1, 2, 3, 4, 5];

/// Consecutive read failures before the capture loop escalates from debug to warn.
const READ_FAILURE_WARN_AFTER: u32 = 50;

// ----------------------------------------------------------------------------
// Backends and properties
// ----------------------------------------------------------------------------

/// Capture API used to open a device index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureBackend {
    /// Linux V4L2 device nodes (`/dev/video{index}`).
    V4l2,
    /// In-process synthetic camera.
    Stub,
    /// Any registered driver, in registration order.
    Any,
}

impl CaptureBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureBackend::V4l2 => "v4l2",
            CaptureBackend::Stub => "stub",
            CaptureBackend::Any => "any",
        }
    }

    /// True when a driver of backend `driver` may serve a request for `self`.
    pub fn accepts(&self, driver: CaptureBackend) -> bool {
        *self == CaptureBackend::Any || *self == driver
    }
}

impl fmt::Display for CaptureBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v4l2" => Ok(CaptureBackend::V4l2),
            "stub" => Ok(CaptureBackend::Stub),
            "any" => Ok(CaptureBackend::Any),
            other => Err(anyhow::anyhow!("unknown capture backend '{}'", other)),
        }
    }
}

/// Device configuration hints applied after a successful open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraProperty {
    Resolution { width: u32, height: u32 },
    FrameRate(u32),
    BufferDepth(u32),
    Autofocus(bool),
    AutoExposure(bool),
    Exposure(i32),
    Gain(i32),
    AutoWhiteBalance(bool),
}

/// Requested capture configuration.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_depth: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            buffer_depth: 1,
        }
    }
}

impl CaptureSettings {
    /// Properties applied to a freshly opened device, in order.
    ///
    /// Fixed focus, manual exposure at a middle value, no gain and automatic white
    /// balance keep frames stable for the detector under indoor lighting.
    pub fn properties(&self) -> Vec<CameraProperty> {
        vec![
            CameraProperty::Resolution {
                width: self.width,
                height: self.height,
            },
            CameraProperty::FrameRate(self.fps),
            CameraProperty::BufferDepth(self.buffer_depth),
            CameraProperty::Autofocus(false),
            CameraProperty::AutoExposure(false),
            CameraProperty::Exposure(-6),
            CameraProperty::Gain(0),
            CameraProperty::AutoWhiteBalance(true),
        ]
    }
}

// ----------------------------------------------------------------------------
// Driver and device traits
// ----------------------------------------------------------------------------

type Interrupt = Arc<dyn Fn() + Send + Sync>;

/// Releases a device from a thread other than the one reading it.
///
/// Once raised, a read blocked in the driver must return an error and every
/// later read fails. Devices hand out clones sharing one flag; raising is idempotent.
#[derive(Clone, Default)]
pub struct ReleaseHandle {
    released: Arc<AtomicBool>,
    interrupt: Option<Interrupt>,
}

impl ReleaseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `interrupt` once when the handle is first raised, to wake a blocked read.
    pub fn with_interrupt(interrupt: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            released: Arc::new(AtomicBool::new(false)),
            interrupt: Some(Arc::new(interrupt)),
        }
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(interrupt) = &self.interrupt {
            interrupt();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

/// An opened camera handle.
pub trait CameraDevice: Send {
    /// Human-readable device description for logs.
    fn describe(&self) -> String;

    /// Apply one configuration hint. Failures are tolerated by callers.
    fn set_property(&mut self, property: CameraProperty) -> Result<()>;

    /// Block until the next frame arrives or the device reports an error.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Release the underlying handle. Must be idempotent.
    fn release(&mut self);

    /// Handle that releases this device from another thread.
    fn release_handle(&self) -> ReleaseHandle;

    fn is_open(&self) -> bool;
}

/// Opens camera devices for one capture backend.
pub trait CameraDriver: Send + Sync {
    fn backend(&self) -> CaptureBackend;

    fn open(&self, index: u32) -> Result<Box<dyn CameraDevice>>;
}

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

/// The set of drivers and the search order used to find a camera.
#[derive(Clone)]
pub struct CameraDiscovery {
    drivers: Vec<Arc<dyn CameraDriver>>,
    pub indices: Vec<u32>,
    pub backends: Vec<CaptureBackend>,
    pub settings: CaptureSettings,
}

impl CameraDiscovery {
    pub fn new(indices: Vec<u32>, backends: Vec<CaptureBackend>, settings: CaptureSettings) -> Self {
        Self {
            drivers: Vec::new(),
            indices,
            backends,
            settings,
        }
    }

    /// Register a driver. Drivers are tried in registration order for `Any`.
    pub fn with_driver(mut self, driver: Arc<dyn CameraDriver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Discovery over every driver compiled into this build.
    pub fn with_platform_drivers(self) -> Self {
        #[cfg(feature = "ingest-v4l2")]
        let this = self.with_driver(Arc::new(V4l2Driver::new()));
        #[cfg(not(feature = "ingest-v4l2"))]
        let this = self;
        this
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    /// Try every (index x backend) combination and return the first device that opens.
    pub fn open(&self) -> Result<FrameSource, PipelineError> {
        let mut attempts = 0usize;
        let mut last_error: Option<String> = None;

        for &index in &self.indices {
            for &backend in &self.backends {
                for driver in self.drivers.iter().filter(|d| backend.accepts(d.backend())) {
                    attempts += 1;
                    log::debug!(
                        "camera: trying index {} via {} (requested {})",
                        index,
                        driver.backend(),
                        backend
                    );
                    match driver.open(index) {
                        Ok(mut device) if device.is_open() => {
                            self.configure(device.as_mut());
                            log::info!(
                                "camera: opened index {} via {} ({})",
                                index,
                                driver.backend(),
                                device.describe()
                            );
                            return Ok(FrameSource {
                                release: device.release_handle(),
                                device: Some(device),
                                index,
                                backend: driver.backend(),
                            });
                        }
                        Ok(mut device) => {
                            device.release();
                            last_error = Some(format!(
                                "index {} via {}: device reported closed after open",
                                index,
                                driver.backend()
                            ));
                        }
                        Err(err) => {
                            last_error =
                                Some(format!("index {} via {}: {:#}", index, driver.backend(), err));
                        }
                    }
                }
            }
        }

        log::warn!(
            "camera: no device opened after {} attempts ({})",
            attempts,
            last_error.as_deref().unwrap_or("no drivers matched")
        );
        Err(PipelineError::CameraUnavailable {
            attempts,
            last_error,
        })
    }

    fn configure(&self, device: &mut dyn CameraDevice) {
        for property in self.settings.properties() {
            if let Err(err) = device.set_property(property) {
                log::debug!(
                    "camera: ignoring unsupported property {:?} on {}: {}",
                    property,
                    device.describe(),
                    err
                );
            }
        }
    }
}

// ----------------------------------------------------------------------------
// FrameSource: opened device + capture loop
// ----------------------------------------------------------------------------

/// An opened camera and the discovery outcome that produced it.
pub struct FrameSource {
    device: Option<Box<dyn CameraDevice>>,
    release: ReleaseHandle,
    pub index: u32,
    pub backend: CaptureBackend,
}

impl FrameSource {
    /// Read one frame from the device.
    pub fn read(&mut self) -> Result<Frame> {
        match self.device.as_mut() {
            Some(_) if self.release.is_released() => Err(anyhow::anyhow!("camera released")),
            Some(device) => device.read_frame(),
            None => Err(anyhow::anyhow!("camera released")),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.release.is_released() && self.device.as_ref().is_some_and(|d| d.is_open())
    }

    /// Handle that releases this camera while another thread owns the source.
    pub fn release_handle(&self) -> ReleaseHandle {
        self.release.clone()
    }

    /// Release the device handle. Safe to call more than once.
    pub fn close(&mut self) {
        self.release.release();
        if let Some(mut device) = self.device.take() {
            device.release();
            log::info!("camera: released index {} via {}", self.index, self.backend);
        }
    }

    /// Capture loop: read frames into `slot` until `stop` is raised.
    ///
    /// Read failures back off for `retry_interval` and retry; they never end the
    /// loop. The device is released before returning.
    pub fn run_capture(mut self, slot: Arc<FrameSlot>, stop: Arc<AtomicBool>, retry_interval: Duration) {
        let mut consecutive_failures = 0u32;
        while !stop.load(Ordering::SeqCst) {
            match self.read() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    slot.push(frame);
                }
                Err(err) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    if consecutive_failures == READ_FAILURE_WARN_AFTER {
                        log::warn!(
                            "camera: {} consecutive read failures on index {}: {:#}",
                            consecutive_failures,
                            self.index,
                            err
                        );
                    } else {
                        log::debug!("camera: frame read failed: {:#}", err);
                    }
                    std::thread::sleep(retry_interval);
                }
            }
        }
        self.close();
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::synthetic::SyntheticDriver;

    fn discovery(driver: SyntheticDriver, indices: Vec<u32>, backends: Vec<CaptureBackend>) -> CameraDiscovery {
        CameraDiscovery::new(indices, backends, CaptureSettings::default())
            .with_driver(Arc::new(driver))
    }

    #[test]
    fn opens_first_available_index() -> Result<()> {
        let driver = SyntheticDriver::new(64, 48).with_available_indices(vec![2]);
        let source = discovery(driver, vec![0, 1, 2, 3], vec![CaptureBackend::Any])
            .open()
            .map_err(anyhow::Error::new)?;
        assert_eq!(source.index, 2);
        assert_eq!(source.backend, CaptureBackend::Stub);
        Ok(())
    }

    #[test]
    fn backend_filter_skips_other_drivers() {
        let driver = SyntheticDriver::new(64, 48);
        let err = discovery(driver, vec![0], vec![CaptureBackend::V4l2])
            .open()
            .err()
            .expect("no v4l2 driver registered");
        match err {
            PipelineError::CameraUnavailable { attempts, .. } => assert_eq!(attempts, 0),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn exhausted_discovery_reports_last_failure() {
        let driver = SyntheticDriver::new(64, 48).with_available_indices(vec![]);
        let err = discovery(driver, vec![0, 1], vec![CaptureBackend::Stub, CaptureBackend::Any])
            .open()
            .err()
            .expect("no index available");
        match err {
            PipelineError::CameraUnavailable {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 4);
                assert!(last_error.unwrap_or_default().contains("index 1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejected_properties_do_not_abort_open() -> Result<()> {
        let driver = SyntheticDriver::new(64, 48).rejecting_all_properties();
        let mut source = discovery(driver, vec![0], vec![CaptureBackend::Any])
            .open()
            .map_err(anyhow::Error::new)?;
        let frame = source.read()?;
        assert_eq!(frame.shape(), (48, 64));
        Ok(())
    }

    #[test]
    fn close_is_idempotent() -> Result<()> {
        let mut source = discovery(SyntheticDriver::new(8, 8), vec![0], vec![CaptureBackend::Any])
            .open()
            .map_err(anyhow::Error::new)?;
        assert!(source.is_open());
        source.close();
        source.close();
        assert!(!source.is_open());
        assert!(source.read().is_err());
        Ok(())
    }

    #[test]
    fn release_handle_fails_reads_from_another_thread() -> Result<()> {
        let mut source = discovery(SyntheticDriver::new(8, 8), vec![0], vec![CaptureBackend::Any])
            .open()
            .map_err(anyhow::Error::new)?;
        let handle = source.release_handle();
        std::thread::spawn(move || handle.release()).join().ok();
        assert!(!source.is_open());
        assert!(source.read().is_err());
        Ok(())
    }

    #[test]
    fn capture_loop_recovers_from_read_failures() -> Result<()> {
        let driver = SyntheticDriver::new(8, 8).with_read_failures(5);
        let source = discovery(driver, vec![0], vec![CaptureBackend::Any])
            .open()
            .map_err(anyhow::Error::new)?;
        let release = source.release_handle();
        let slot = Arc::new(FrameSlot::new());
        let stop = Arc::new(AtomicBool::new(false));

        let capture = {
            let (slot, stop) = (slot.clone(), stop.clone());
            std::thread::spawn(move || source.run_capture(slot, stop, Duration::from_millis(2)))
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut frame = None;
        while frame.is_none() && std::time::Instant::now() < deadline {
            frame = slot.take();
            std::thread::sleep(Duration::from_millis(1));
        }
        stop.store(true, Ordering::SeqCst);
        capture.join().ok();

        let frame = frame.ok_or_else(|| anyhow::anyhow!("slot never filled after failed reads"))?;
        assert!(frame.sequence >= 1);
        assert!(release.is_released());
        Ok(())
    }

    #[test]
    fn backend_names_parse() -> Result<()> {
        assert_eq!("V4L2".parse::<CaptureBackend>()?, CaptureBackend::V4l2);
        assert_eq!(" any ".parse::<CaptureBackend>()?, CaptureBackend::Any);
        assert!("dshow".parse::<CaptureBackend>().is_err());
        Ok(())
    }
}

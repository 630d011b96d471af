use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use binwise::ingest::{CameraDevice, CameraDriver, CameraProperty};
use binwise::{
    CameraDiscovery, CaptureBackend, CaptureSettings, Frame, PipelineConfig, PipelineController,
    PipelineError, PipelineState, ReleaseHandle, SharedBackend, StubBackend,
};

const READ_LIMIT: Duration = Duration::from_secs(3);

/// A camera that delivers one frame and then blocks in `read_frame`.
#[derive(Clone, Default)]
struct HangingDriver {
    /// When false, a blocked read ignores the release handle, like a wedged driver.
    wakes_on_release: bool,
    blocked: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
}

struct HangingCamera {
    driver: HangingDriver,
    release: ReleaseHandle,
    delivered: bool,
}

impl CameraDriver for HangingDriver {
    fn backend(&self) -> CaptureBackend {
        CaptureBackend::Stub
    }

    fn open(&self, _index: u32) -> Result<Box<dyn CameraDevice>> {
        Ok(Box::new(HangingCamera {
            driver: self.clone(),
            release: ReleaseHandle::new(),
            delivered: false,
        }))
    }
}

impl CameraDevice for HangingCamera {
    fn describe(&self) -> String {
        "hanging://camera0".into()
    }

    fn set_property(&mut self, _property: CameraProperty) -> Result<()> {
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.delivered {
            self.delivered = true;
            return Ok(Frame::filled(64, 48, [40, 40, 40], 1));
        }
        self.driver.blocked.store(true, Ordering::SeqCst);
        let started = Instant::now();
        while started.elapsed() < READ_LIMIT {
            if self.driver.wakes_on_release && self.release.is_released() {
                anyhow::bail!("read interrupted by release");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        anyhow::bail!("read timed out")
    }

    fn release(&mut self) {
        self.release.release();
        self.driver.released.store(true, Ordering::SeqCst);
    }

    fn release_handle(&self) -> ReleaseHandle {
        self.release.clone()
    }

    fn is_open(&self) -> bool {
        !self.release.is_released()
    }
}

fn pipeline(driver: &HangingDriver) -> PipelineController {
    let config = PipelineConfig {
        stop_timeout: Duration::from_millis(300),
        ..PipelineConfig::default()
    };
    let discovery = CameraDiscovery::new(vec![0], vec![CaptureBackend::Any], CaptureSettings::default())
        .with_driver(Arc::new(driver.clone()));
    let mut pipeline = PipelineController::new(config, discovery);
    let backend: SharedBackend = Arc::new(Mutex::new(StubBackend::new(vec!["bottle".into()])));
    pipeline.attach_detector(backend);
    pipeline
}

fn wait_until_blocked(driver: &HangingDriver) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !driver.blocked.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(driver.blocked.load(Ordering::SeqCst), "capture never reached a blocking read");
}

#[test]
fn stop_releases_a_camera_blocked_in_read() -> Result<()> {
    let driver = HangingDriver {
        wakes_on_release: true,
        ..HangingDriver::default()
    };
    let mut pipeline = pipeline(&driver);
    pipeline.start()?;
    wait_until_blocked(&driver);

    let started = Instant::now();
    pipeline.stop()?;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(driver.released.load(Ordering::SeqCst));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    Ok(())
}

#[test]
fn wedged_read_reports_stop_timeout() -> Result<()> {
    let driver = HangingDriver::default();
    let mut pipeline = pipeline(&driver);
    pipeline.start()?;
    wait_until_blocked(&driver);

    match pipeline.stop() {
        Err(PipelineError::StopTimeout {
            timeout_ms,
            activities,
        }) => {
            assert_eq!(timeout_ms, 300);
            assert_eq!(activities, vec!["capture"]);
        }
        other => panic!("expected StopTimeout, got {other:?}"),
    }
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    Ok(())
}

//! Synthetic camera driver (`stub` backend).
//!
//! Produces generated frames without hardware so the live pipeline can run in tests,
//! demos and CI. Frames are either a drifting gradient pattern or come from a
//! caller-supplied scene function.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CameraDevice, CameraDriver, CameraProperty, CaptureBackend, ReleaseHandle};
use crate::frame::Frame;

/// Scene generator: frame sequence number in, frame out.
pub type SceneFn = Arc<dyn Fn(u64) -> Frame + Send + Sync>;

/// Driver handing out `SyntheticCamera` devices.
#[derive(Clone)]
pub struct SyntheticDriver {
    width: u32,
    height: u32,
    fps: u32,
    available: Option<Vec<u32>>,
    reject_properties: bool,
    read_failures: u32,
    noise: u8,
    scene: Option<SceneFn>,
}

impl SyntheticDriver {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fps: 0,
            available: None,
            reject_properties: false,
            read_failures: 0,
            noise: 0,
            scene: None,
        }
    }

    /// Pace reads to `fps` frames per second (0 = as fast as polled).
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Only these indices open; every other index fails like a missing device.
    pub fn with_available_indices(mut self, indices: Vec<u32>) -> Self {
        self.available = Some(indices);
        self
    }

    /// Every `set_property` call fails, like a camera with a minimal driver.
    pub fn rejecting_all_properties(mut self) -> Self {
        self.reject_properties = true;
        self
    }

    /// The first `count` reads of every opened device fail.
    pub fn with_read_failures(mut self, count: u32) -> Self {
        self.read_failures = count;
        self
    }

    /// Add uniform sensor noise of up to +/-`amplitude` to every channel of the
    /// built-in pattern.
    pub fn with_noise(mut self, amplitude: u8) -> Self {
        self.noise = amplitude;
        self
    }

    /// Generate frames with `scene` instead of the built-in pattern.
    pub fn with_scene(mut self, scene: SceneFn) -> Self {
        self.scene = Some(scene);
        self
    }
}

impl CameraDriver for SyntheticDriver {
    fn backend(&self) -> CaptureBackend {
        CaptureBackend::Stub
    }

    fn open(&self, index: u32) -> Result<Box<dyn CameraDevice>> {
        if let Some(available) = &self.available {
            if !available.contains(&index) {
                return Err(anyhow!("synthetic camera {} not present", index));
            }
        }
        log::info!("SyntheticCamera: connected to stub://camera{}", index);
        Ok(Box::new(SyntheticCamera {
            index,
            width: self.width,
            height: self.height,
            fps: self.fps,
            reject_properties: self.reject_properties,
            failures_left: self.read_failures,
            noise: self.noise,
            scene: self.scene.clone(),
            frame_count: 0,
            scene_state: 0,
            last_read: None,
            open: true,
            release: ReleaseHandle::new(),
        }))
    }
}

/// One synthetic device.
pub struct SyntheticCamera {
    index: u32,
    width: u32,
    height: u32,
    fps: u32,
    reject_properties: bool,
    failures_left: u32,
    noise: u8,
    scene: Option<SceneFn>,
    frame_count: u64,
    /// Simulated scene state, bumped occasionally to mimic movement.
    scene_state: u8,
    last_read: Option<Instant>,
    open: bool,
    release: ReleaseHandle,
}

impl SyntheticCamera {
    fn pace(&mut self) {
        if self.fps == 0 {
            return;
        }
        let interval = Duration::from_millis(1000 / self.fps as u64);
        if let Some(last) = self.last_read {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_read = Some(Instant::now());
    }

    fn generate_pattern(&mut self) -> Frame {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        if self.noise > 0 {
            let amplitude = self.noise as i16;
            let mut rng = rand::thread_rng();
            for pixel in pixels.iter_mut() {
                let jitter = rng.gen_range(-amplitude..=amplitude);
                *pixel = (*pixel as i16 + jitter).clamp(0, 255) as u8;
            }
        }
        let image = image::RgbImage::from_raw(self.width, self.height, pixels)
            .unwrap_or_else(|| image::RgbImage::new(self.width, self.height));
        Frame::from_rgb_image(image, self.frame_count)
    }
}

impl CameraDevice for SyntheticCamera {
    fn describe(&self) -> String {
        format!("stub://camera{} ({}x{})", self.index, self.width, self.height)
    }

    fn set_property(&mut self, property: CameraProperty) -> Result<()> {
        if self.reject_properties {
            return Err(anyhow!("property {:?} not supported", property));
        }
        match property {
            CameraProperty::Resolution { width, height } if width > 0 && height > 0 => {
                self.width = width;
                self.height = height;
            }
            CameraProperty::FrameRate(fps) => self.fps = fps,
            _ => {}
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.is_open() {
            return Err(anyhow!("synthetic camera {} released", self.index));
        }
        self.pace();
        if self.release.is_released() {
            return Err(anyhow!("synthetic camera {} released", self.index));
        }
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(anyhow!("synthetic read failure"));
        }
        self.frame_count += 1;
        let frame = match &self.scene {
            Some(scene) => scene(self.frame_count),
            None => self.generate_pattern(),
        };
        Ok(frame)
    }

    fn release(&mut self) {
        self.open = false;
        self.release.release();
    }

    fn release_handle(&self) -> ReleaseHandle {
        self.release.clone()
    }

    fn is_open(&self) -> bool {
        self.open && !self.release.is_released()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_camera_produces_frames() -> Result<()> {
        let driver = SyntheticDriver::new(32, 24);
        let mut cam = driver.open(0)?;
        let frame = cam.read_frame()?;
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 24);
        assert_eq!(frame.sequence, 1);
        Ok(())
    }

    #[test]
    fn resolution_property_resizes_output() -> Result<()> {
        let driver = SyntheticDriver::new(32, 24);
        let mut cam = driver.open(0)?;
        cam.set_property(CameraProperty::Resolution {
            width: 16,
            height: 8,
        })?;
        assert_eq!(cam.read_frame()?.shape(), (8, 16));
        Ok(())
    }

    #[test]
    fn noise_stays_within_amplitude() -> Result<()> {
        let clean = SyntheticDriver::new(16, 16).open(0)?.read_frame()?;
        let noisy = SyntheticDriver::new(16, 16).with_noise(3).open(0)?.read_frame()?;
        for (a, b) in clean.data().iter().zip(noisy.data()) {
            assert!((*a as i16 - *b as i16).abs() <= 3);
        }
        Ok(())
    }

    #[test]
    fn scripted_failures_precede_frames() -> Result<()> {
        let driver = SyntheticDriver::new(4, 4).with_read_failures(2);
        let mut cam = driver.open(0)?;
        assert!(cam.read_frame().is_err());
        assert!(cam.read_frame().is_err());
        assert!(cam.read_frame().is_ok());
        Ok(())
    }

    #[test]
    fn released_camera_stops_reading() -> Result<()> {
        let mut cam = SyntheticDriver::new(4, 4).open(3)?;
        cam.release();
        cam.release();
        assert!(!cam.is_open());
        assert!(cam.read_frame().is_err());
        Ok(())
    }

    #[test]
    fn remote_release_closes_the_camera() -> Result<()> {
        let mut cam = SyntheticDriver::new(4, 4).open(0)?;
        let handle = cam.release_handle();
        assert!(cam.read_frame().is_ok());
        handle.release();
        assert!(!cam.is_open());
        assert!(cam.read_frame().is_err());
        Ok(())
    }
}

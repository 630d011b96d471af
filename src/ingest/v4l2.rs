//! V4L2 camera driver.
//!
//! Opens `/dev/video{index}` nodes with libv4l, negotiates a pixel format the
//! pipeline can normalize, and streams frames through memory-mapped buffers.
//! Property hints map onto V4L2 format, stream parameters and user controls.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CameraDevice, CameraDriver, CameraProperty, CaptureBackend, ReleaseHandle};
use crate::frame::{Frame, PixelLayout};

const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_GAIN: u32 = 0x0098_0913;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_FOCUS_AUTO: u32 = 0x009a_090c;

const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// Formats requested in preference order.
const PREFERRED_FOURCCS: [&[u8; 4]; 3] = [b"RGB3", b"YUYV", b"MJPG"];

/// Driver for local V4L2 device nodes.
#[derive(Clone, Debug, Default)]
pub struct V4l2Driver;

impl V4l2Driver {
    pub fn new() -> Self {
        Self
    }
}

impl CameraDriver for V4l2Driver {
    fn backend(&self) -> CaptureBackend {
        CaptureBackend::V4l2
    }

    fn open(&self, index: u32) -> Result<Box<dyn CameraDevice>> {
        let path = format!("/dev/video{}", index);
        let device =
            v4l::Device::with_path(&path).with_context(|| format!("open v4l2 device {}", path))?;
        let handle = device.handle();
        let release = {
            let path = path.clone();
            ReleaseHandle::with_interrupt(move || {
                if let Err(err) = stream_off(&handle) {
                    log::debug!("V4l2Camera: STREAMOFF on {} failed: {}", path, err);
                }
            })
        };
        let mut camera = V4l2Camera {
            path,
            release,
            device: Some(device),
            stream: None,
            width: 0,
            height: 0,
            format: PixelFormat::Rgb24,
            buffer_depth: 4,
            frame_count: 0,
        };
        camera.negotiate_format(None)?;
        Ok(Box::new(camera))
    }
}

#[self_referencing]
struct V4l2Stream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// An opened V4L2 device. Streaming starts lazily on the first read so that
/// configuration hints can still change the format.
pub struct V4l2Camera {
    path: String,
    release: ReleaseHandle,
    device: Option<v4l::Device>,
    stream: Option<V4l2Stream>,
    width: u32,
    height: u32,
    format: PixelFormat,
    buffer_depth: u32,
    frame_count: u64,
}

impl V4l2Camera {
    fn idle_device(&self) -> Result<&v4l::Device> {
        if self.stream.is_some() {
            return Err(anyhow!("{} is already streaming", self.path));
        }
        self.device
            .as_ref()
            .ok_or_else(|| anyhow!("{} released", self.path))
    }

    fn negotiate_format(&mut self, size: Option<(u32, u32)>) -> Result<()> {
        use v4l::video::Capture;

        let device = self.idle_device()?;
        let mut requested = device.format().context("read v4l2 format")?;
        if let Some((width, height)) = size {
            requested.width = width;
            requested.height = height;
        }

        let mut negotiated = None;
        for fourcc in PREFERRED_FOURCCS {
            requested.fourcc = v4l::FourCC::new(fourcc);
            match device.set_format(&requested) {
                Ok(actual) => {
                    if let Some(format) = PixelFormat::from_fourcc(&actual.fourcc.repr) {
                        negotiated = Some((actual.width, actual.height, format));
                        break;
                    }
                }
                Err(err) => {
                    log::debug!("V4l2Camera: {} rejected {:?}: {}", self.path, fourcc, err);
                }
            }
        }

        let (width, height, format) = match negotiated {
            Some(found) => found,
            None => {
                let current = device.format().context("read v4l2 format")?;
                let format = PixelFormat::from_fourcc(&current.fourcc.repr).ok_or_else(|| {
                    anyhow!("{} offers no supported pixel format", self.path)
                })?;
                (current.width, current.height, format)
            }
        };
        self.width = width;
        self.height = height;
        self.format = format;
        Ok(())
    }

    fn set_control(&self, id: u32, value: i64) -> Result<()> {
        let device = self.idle_device()?;
        device
            .set_control(v4l::control::Control {
                id,
                value: v4l::control::Value::Integer(value),
            })
            .with_context(|| format!("set control {:#x} on {}", id, self.path))
    }

    fn start_stream(&mut self) -> Result<()> {
        use v4l::buffer::Type;

        let device = self
            .device
            .take()
            .ok_or_else(|| anyhow!("{} released", self.path))?;
        let buffers = self.buffer_depth.max(1);
        let stream = V4l2StreamTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, buffers)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.stream = Some(stream);
        log::info!(
            "V4l2Camera: streaming {} ({}x{} {:?}, {} buffers)",
            self.path,
            self.width,
            self.height,
            self.format,
            buffers
        );
        Ok(())
    }
}

impl CameraDevice for V4l2Camera {
    fn describe(&self) -> String {
        format!("{} ({}x{} {:?})", self.path, self.width, self.height, self.format)
    }

    fn set_property(&mut self, property: CameraProperty) -> Result<()> {
        use v4l::video::Capture;

        match property {
            CameraProperty::Resolution { width, height } => self.negotiate_format(Some((width, height))),
            CameraProperty::FrameRate(fps) => {
                let params = v4l::video::capture::Parameters::with_fps(fps);
                self.idle_device()?
                    .set_params(&params)
                    .with_context(|| format!("set {} fps on {}", fps, self.path))?;
                Ok(())
            }
            CameraProperty::BufferDepth(depth) => {
                self.buffer_depth = depth;
                Ok(())
            }
            CameraProperty::Autofocus(on) => self.set_control(CID_FOCUS_AUTO, on as i64),
            CameraProperty::AutoExposure(on) => self.set_control(
                CID_EXPOSURE_AUTO,
                if on { EXPOSURE_APERTURE_PRIORITY } else { EXPOSURE_MANUAL },
            ),
            // Exposure hints are log2 seconds; V4L2 wants 100us units.
            CameraProperty::Exposure(log2_secs) => {
                let units = (2f64.powi(log2_secs) * 10_000.0).round().max(1.0) as i64;
                self.set_control(CID_EXPOSURE_ABSOLUTE, units)
            }
            CameraProperty::Gain(gain) => self.set_control(CID_GAIN, gain as i64),
            CameraProperty::AutoWhiteBalance(on) => self.set_control(CID_AUTO_WHITE_BALANCE, on as i64),
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        if self.release.is_released() {
            return Err(anyhow!("{} released", self.path));
        }
        if self.stream.is_none() {
            self.start_stream()?;
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("{} released", self.path))?;
        let buf = stream
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;

        let rgb = normalize_to_rgb(&buf, self.width, self.height, self.format)?;
        self.frame_count += 1;
        Frame::new(rgb, self.width, self.height, PixelLayout::Rgb, self.frame_count)
    }

    fn release(&mut self) {
        self.release.release();
        self.stream = None;
        self.device = None;
    }

    fn release_handle(&self) -> ReleaseHandle {
        self.release.clone()
    }

    fn is_open(&self) -> bool {
        !self.release.is_released() && (self.stream.is_some() || self.device.is_some())
    }
}

/// Stop streaming on `handle` so a thread blocked in `VIDIOC_DQBUF` returns.
fn stream_off(handle: &Arc<v4l::device::Handle>) -> std::io::Result<()> {
    let mut typ = v4l::buffer::Type::VideoCapture as u32;
    // SAFETY: `typ` lives across the call and `handle` keeps the descriptor open.
    unsafe {
        v4l::v4l2::ioctl(
            handle.fd(),
            v4l::v4l2::vidioc::VIDIOC_STREAMOFF,
            &mut typ as *mut u32 as *mut std::os::raw::c_void,
        )
    }
}

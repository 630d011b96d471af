//! Frame containers.
//!
//! - `Frame`: dense pixel grid handed from the capture activity to the inference activity.
//! - `FrameSlot`: capacity-1 handoff buffer between the two activities.
//!
//! Frames are single-owner: the capture activity moves a frame into the slot, the
//! inference activity moves it out. A newer frame replaces an unconsumed one, so the
//! consumer only ever observes the most recent capture.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

// ----------------------------------------------------------------------------
// Frame: raw pixel grid
// ----------------------------------------------------------------------------

/// Channel order of an interleaved 8-bit, 3-channel frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb,
    Bgr,
}

/// One captured frame: `height` rows of `width` interleaved 3-byte pixels.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    /// Monotonic sequence number assigned by the producing source.
    pub sequence: u64,
    captured_at: Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Wrap interleaved pixel bytes. Fails when the buffer does not match the extent.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        sequence: u64,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame extent must be non-zero ({}x{})", width, height));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
            sequence,
            captured_at: Instant::now(),
        })
    }

    /// Wrap an RGB image without copying.
    pub fn from_rgb_image(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            layout: PixelLayout::Rgb,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Uniform-color frame, mostly useful for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Self {
        let image = RgbImage::from_pixel(width, height, image::Rgb(rgb));
        Self::from_rgb_image(image, sequence)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Extent as `(height, width)`, matching the row-major layout of the data.
    pub fn shape(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }

    /// Copy into an RGB image, swapping channels when the frame is BGR.
    pub fn to_rgb_image(&self) -> RgbImage {
        let data = match self.layout {
            PixelLayout::Rgb => self.data.clone(),
            PixelLayout::Bgr => {
                let mut swapped = self.data.clone();
                for px in swapped.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                swapped
            }
        };
        // Length was validated at construction.
        RgbImage::from_raw(self.width, self.height, data)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: latest-frame-wins handoff
// ----------------------------------------------------------------------------

/// Capacity-1 frame buffer shared between the capture and inference activities.
///
/// `push` never blocks on the consumer: an unconsumed frame is dropped and replaced.
/// This is the only cross-activity mutable state in the pipeline.
#[derive(Default)]
pub struct FrameSlot {
    slot: Mutex<Option<Frame>>,
    pushed: AtomicU64,
    overwritten: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a frame, replacing any frame that was not yet taken.
    ///
    /// Returns true when an unconsumed frame was overwritten.
    pub fn push(&self, frame: Frame) -> bool {
        let mut guard = self.slot.lock().unwrap_or_else(|poison| poison.into_inner());
        let replaced = guard.replace(frame).is_some();
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    /// Take the latest frame, leaving the slot empty.
    pub fn take(&self) -> Option<Frame> {
        self.slot
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    /// Drop any pending frame.
    pub fn clear(&self) {
        let _ = self.take();
    }

    pub fn stats(&self) -> FrameSlotStats {
        FrameSlotStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
        }
    }
}

/// Counters describing how many frames went through the slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameSlotStats {
    pub pushed: u64,
    /// Frames replaced before the consumer saw them.
    pub overwritten: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_keeps_only_latest_frame() {
        let slot = FrameSlot::new();
        assert!(!slot.push(Frame::filled(4, 4, [1, 1, 1], 1)));
        assert!(slot.push(Frame::filled(4, 4, [2, 2, 2], 2)));

        let frame = slot.take().expect("latest frame");
        assert_eq!(frame.sequence, 2);
        assert_eq!(frame.data()[0], 2);
        assert!(slot.take().is_none(), "frame A must be unobservable");

        let stats = slot.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.overwritten, 1);
    }

    #[test]
    fn frame_rejects_mismatched_length() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, PixelLayout::Rgb, 0).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2, PixelLayout::Rgb, 0).is_ok());
        assert!(Frame::new(Vec::new(), 0, 2, PixelLayout::Rgb, 0).is_err());
    }

    #[test]
    fn bgr_frames_convert_to_rgb() -> Result<()> {
        let frame = Frame::new(vec![10, 20, 30], 1, 1, PixelLayout::Bgr, 0)?;
        let rgb = frame.to_rgb_image();
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
        assert_eq!(frame.shape(), (1, 1));
        Ok(())
    }
}

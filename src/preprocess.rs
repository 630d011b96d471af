//! Letterbox preprocessing.
//!
//! Turns an arbitrary-resolution frame into the fixed-size, padded, CHW float
//! tensor the detector consumes, and records the `GeometricTransform` needed to
//! map detector-space boxes back onto the source frame.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array3;

use crate::frame::Frame;
use crate::geometry::BoundingBox;

/// Gray fill used for letterbox padding.
pub const LETTERBOX_FILL: u8 = 114;

/// How a source frame was resized and padded into detector input space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometricTransform {
    pub scale: f32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub pad_left: u32,
    pub pad_right: u32,
    pub source_width: u32,
    pub source_height: u32,
}

impl GeometricTransform {
    /// Source-frame box to detector-input box.
    pub fn forward(&self, bbox: &BoundingBox) -> BoundingBox {
        let left = self.pad_left as f32;
        let top = self.pad_top as f32;
        BoundingBox::new(
            bbox.x1 * self.scale + left,
            bbox.y1 * self.scale + top,
            bbox.x2 * self.scale + left,
            bbox.y2 * self.scale + top,
        )
    }

    /// Detector-input box back to source-frame coordinates (unclamped).
    pub fn inverse(&self, bbox: &BoundingBox) -> BoundingBox {
        let left = self.pad_left as f32;
        let top = self.pad_top as f32;
        BoundingBox::new(
            (bbox.x1 - left) / self.scale,
            (bbox.y1 - top) / self.scale,
            (bbox.x2 - left) / self.scale,
            (bbox.y2 - top) / self.scale,
        )
    }
}

/// Normalized `[3, H, W]` RGB tensor with values in `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct InputTensor {
    data: Array3<f32>,
}

impl InputTensor {
    pub fn from_array(data: Array3<f32>) -> Self {
        Self { data }
    }

    /// Zero tensor, handy for warm-up runs.
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            data: Array3::zeros((3, height as usize, width as usize)),
        }
    }

    pub fn width(&self) -> u32 {
        self.data.shape()[2] as u32
    }

    pub fn height(&self) -> u32 {
        self.data.shape()[1] as u32
    }

    pub fn as_array(&self) -> &Array3<f32> {
        &self.data
    }

    /// Contiguous CHW values.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}

/// Letterboxing preprocessor for a fixed detector input size.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
    fill: u8,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Result<Self> {
        if target_width == 0 || target_height == 0 {
            return Err(anyhow!(
                "detector input size must be non-zero ({}x{})",
                target_width,
                target_height
            ));
        }
        Ok(Self {
            target_width,
            target_height,
            fill: LETTERBOX_FILL,
        })
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    /// The transform `process` would apply to a `source_width` x `source_height` frame.
    pub fn transform_for(&self, source_width: u32, source_height: u32) -> Result<GeometricTransform> {
        if source_width == 0 || source_height == 0 {
            return Err(anyhow!("cannot letterbox an empty frame"));
        }
        let scale = (self.target_height as f32 / source_height as f32)
            .min(self.target_width as f32 / source_width as f32);
        let (new_w, new_h) = self.scaled_size(source_width, source_height, scale);

        let pad_w = self.target_width - new_w;
        let pad_h = self.target_height - new_h;
        Ok(GeometricTransform {
            scale,
            pad_top: pad_h / 2,
            pad_bottom: pad_h - pad_h / 2,
            pad_left: pad_w / 2,
            pad_right: pad_w - pad_w / 2,
            source_width,
            source_height,
        })
    }

    fn scaled_size(&self, width: u32, height: u32, scale: f32) -> (u32, u32) {
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, self.target_width);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, self.target_height);
        (new_w, new_h)
    }

    /// Letterbox a captured frame.
    pub fn process(&self, frame: &Frame) -> Result<(InputTensor, GeometricTransform)> {
        self.process_image(&frame.to_rgb_image())
    }

    /// Letterbox an RGB image.
    pub fn process_image(&self, image: &RgbImage) -> Result<(InputTensor, GeometricTransform)> {
        let (width, height) = image.dimensions();
        let transform = self.transform_for(width, height)?;
        let canvas = self.letterbox(image, &transform);
        Ok((to_chw_tensor(&canvas), transform))
    }

    fn letterbox(&self, image: &RgbImage, transform: &GeometricTransform) -> RgbImage {
        let new_w = self.target_width - transform.pad_left - transform.pad_right;
        let new_h = self.target_height - transform.pad_top - transform.pad_bottom;

        let mut canvas = RgbImage::from_pixel(
            self.target_width,
            self.target_height,
            Rgb([self.fill; 3]),
        );
        if image.dimensions() == (new_w, new_h) {
            imageops::replace(&mut canvas, image, transform.pad_left as i64, transform.pad_top as i64);
        } else {
            let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
            imageops::replace(&mut canvas, &resized, transform.pad_left as i64, transform.pad_top as i64);
        }
        canvas
    }
}

fn to_chw_tensor(image: &RgbImage) -> InputTensor {
    let (width, height) = image.dimensions();
    let raw = image.as_raw();
    let w = width as usize;
    let data = Array3::from_shape_fn((3, height as usize, w), |(c, y, x)| {
        raw[(y * w + x) * 3 + c] as f32 / 255.0
    });
    InputTensor::from_array(data)
}

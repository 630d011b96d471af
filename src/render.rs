//! Annotation rendering.
//!
//! Draws a translucent highlight, a solid border and a `"{class} {conf:.2}"`
//! label for each detection. Rendering always happens on a copy; the input
//! image is never touched. Labels use a TTF font when one is configured and
//! built-in bitmap glyphs otherwise.

mod bitmap_font;

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::geometry::BoundingBox;

const HIGHLIGHT: [u8; 3] = [0, 180, 0];
const BORDER: [u8; 3] = [0, 255, 0];
const HIGHLIGHT_ALPHA: f32 = 0.2;
const BORDER_WIDTH: u32 = 2;
const LABEL_OFFSET: i32 = 10;
const LABEL_SCALE: f32 = 18.0;
/// Bitmap glyph magnification; 5x7 glyphs become 10x14.
const BITMAP_SCALE: u32 = 2;

/// Where a label ended up on the rendered image.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedLabel {
    pub text: String,
    /// Top-left corner of the label text.
    pub x: i32,
    pub y: i32,
    pub bbox: BoundingBox,
}

/// Annotated copy of a frame plus the labels drawn on it.
#[derive(Clone, Debug)]
pub struct RenderedFrame {
    pub image: RgbImage,
    pub labels: Vec<RenderedLabel>,
}

#[derive(Clone)]
pub struct Renderer {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Renderer {
    /// Renderer drawing labels with the built-in bitmap glyphs.
    pub fn new() -> Self {
        Self {
            font: None,
            scale: PxScale::from(LABEL_SCALE),
        }
    }

    pub fn with_font(font: FontArc) -> Self {
        Self {
            font: Some(font),
            ..Self::new()
        }
    }

    /// Load a TTF/OTF font for label text.
    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read font {}", path.display()))?;
        let font = FontArc::try_from_vec(bytes)
            .with_context(|| format!("parse font {}", path.display()))?;
        Ok(Self::with_font(font))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw `detections` (display-space boxes) onto a copy of `image`.
    pub fn render(&self, image: &RgbImage, detections: &[Detection]) -> RenderedFrame {
        let mut canvas = image.clone();
        let mut labels = Vec::with_capacity(detections.len());

        for detection in detections {
            let Some(rect) = to_rect(&detection.bbox, canvas.width(), canvas.height()) else {
                continue;
            };
            blend_rect(&mut canvas, &rect, HIGHLIGHT, HIGHLIGHT_ALPHA);
            for inset in 0..BORDER_WIDTH {
                if let Some(inner) = shrink(&rect, inset) {
                    draw_hollow_rect_mut(&mut canvas, inner, Rgb(BORDER));
                }
            }

            let text = detection.label();
            let (x, y) = self.label_origin(&text, &rect, canvas.width(), canvas.height());
            match &self.font {
                Some(font) => draw_text_mut(&mut canvas, Rgb(BORDER), x, y, self.scale, font, &text),
                None => bitmap_font::draw_text(&mut canvas, Rgb(BORDER), x, y, BITMAP_SCALE, &text),
            }
            labels.push(RenderedLabel {
                text,
                x,
                y,
                bbox: detection.bbox,
            });
        }

        RenderedFrame {
            image: canvas,
            labels,
        }
    }

    fn text_extent(&self, text: &str) -> (u32, u32) {
        match &self.font {
            Some(font) => text_size(self.scale, font, text),
            None => bitmap_font::text_size(text, BITMAP_SCALE),
        }
    }

    // Text sits just above the box's top-left corner and is kept on the frame.
    fn label_origin(&self, text: &str, rect: &Rect, width: u32, height: u32) -> (i32, i32) {
        let (text_w, text_h) = self.text_extent(text);
        let max_x = (width as i32 - text_w as i32).max(0);
        let max_y = (height as i32 - text_h as i32).max(0);
        let x = rect.left().clamp(0, max_x);
        let y = (rect.top() - LABEL_OFFSET - text_h as i32).clamp(0, max_y);
        (x, y)
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

fn to_rect(bbox: &BoundingBox, width: u32, height: u32) -> Option<Rect> {
    if !bbox.is_finite() {
        return None;
    }
    let x1 = (bbox.x1.round() as i64).clamp(0, width as i64);
    let y1 = (bbox.y1.round() as i64).clamp(0, height as i64);
    let x2 = (bbox.x2.round() as i64).clamp(0, width as i64);
    let y2 = (bbox.y2.round() as i64).clamp(0, height as i64);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::at(x1 as i32, y1 as i32).of_size((x2 - x1) as u32, (y2 - y1) as u32))
}

fn shrink(rect: &Rect, inset: u32) -> Option<Rect> {
    let w = rect.width().checked_sub(2 * inset).filter(|w| *w > 0)?;
    let h = rect.height().checked_sub(2 * inset).filter(|h| *h > 0)?;
    Some(Rect::at(rect.left() + inset as i32, rect.top() + inset as i32).of_size(w, h))
}

fn blend_rect(canvas: &mut RgbImage, rect: &Rect, color: [u8; 3], alpha: f32) {
    let right = (rect.right() as u32).min(canvas.width().saturating_sub(1));
    let bottom = (rect.bottom() as u32).min(canvas.height().saturating_sub(1));
    for y in rect.top() as u32..=bottom {
        for x in rect.left() as u32..=right {
            let px = canvas.get_pixel_mut(x, y);
            for c in 0..3 {
                let mixed = px[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha;
                px[c] = mixed.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

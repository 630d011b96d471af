use anyhow::{anyhow, Context, Result};

/// Pixel encodings a camera may deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Nv12,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    /// Map a V4L2 FourCC code to a supported format.
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

/// Convert one captured buffer into interleaved RGB24.
pub fn normalize_to_rgb(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb24 => {
            check_len(pixels, packed_len(width, height, 3)?, "RGB")?;
            Ok(pixels.to_vec())
        }
        PixelFormat::Bgr24 => {
            check_len(pixels, packed_len(width, height, 3)?, "BGR")?;
            let mut rgb = pixels.to_vec();
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(rgb)
        }
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height),
        PixelFormat::Mjpeg => {
            let img = image::load_from_memory_with_format(pixels, image::ImageFormat::Jpeg)
                .context("decode MJPEG frame")?;
            let rgb = img.to_rgb8();
            if rgb.dimensions() != (width, height) {
                return Err(anyhow!(
                    "MJPEG frame is {}x{}, expected {}x{}",
                    rgb.width(),
                    rgb.height(),
                    width,
                    height
                ));
            }
            Ok(rgb.into_raw())
        }
    }
}

fn packed_len(width: u32, height: u32, bytes_per_pixel: u32) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(bytes_per_pixel))
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn check_len(pixels: &[u8], expected: usize, what: &str) -> Result<()> {
    if pixels.len() != expected {
        return Err(anyhow!(
            "{} frame length mismatch: expected {}, got {}",
            what,
            expected,
            pixels.len()
        ));
    }
    Ok(())
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    [
        clamp_to_u8(y + 1.402_f32 * v),
        clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v),
        clamp_to_u8(y + 1.772_f32 * u),
    ]
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = packed_len(width, height, 1)?;
    let expected = y_plane
        .checked_add(y_plane / 2)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    check_len(pixels, expected, "NV12")?;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    Ok(rgb)
}

// YUYV packs two pixels into four bytes: [Y0, U, Y1, V].
fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    if width % 2 != 0 {
        return Err(anyhow!("YUYV frames need an even width, got {}", width));
    }
    check_len(pixels, packed_len(width, height, 2)?, "YUYV")?;

    let mut rgb = Vec::with_capacity(packed_len(width, height, 3)?);
    for chunk in pixels.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        rgb.extend_from_slice(&yuv_to_rgb(chunk[0] as f32, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(chunk[2] as f32, u, v));
    }
    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let rgb = normalize_to_rgb(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(rgb, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn yuyv_conversion_produces_gray() -> Result<()> {
        let yuyv = vec![128u8; 8];
        let rgb = normalize_to_rgb(&yuyv, 2, 2, PixelFormat::Yuyv)?;
        assert_eq!(rgb, vec![128u8; 12]);
        assert!(normalize_to_rgb(&yuyv[..6], 2, 2, PixelFormat::Yuyv).is_err());
        Ok(())
    }

    #[test]
    fn bgr_is_swapped_and_rgb_passes_through() -> Result<()> {
        let rgb = normalize_to_rgb(&[1, 2, 3], 1, 1, PixelFormat::Bgr24)?;
        assert_eq!(rgb, vec![3, 2, 1]);
        let pixels = vec![1u8; 9];
        assert_eq!(normalize_to_rgb(&pixels, 1, 3, PixelFormat::Rgb24)?, pixels);
        Ok(())
    }

    #[test]
    fn fourcc_lookup() {
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
    }
}

//! Screenshots of presented video frames

use crate::types::VideoFrame;
#[cfg(not(feature = "screenshot"))]
use crate::Error;
use crate::Result;
use std::path::Path;

/// Convert a YUV 4:2:0 frame to packed RGB (BT.601, full range)
pub fn yuv_to_rgb(frame: &VideoFrame) -> Vec<u8> {
    let (width, height) = (frame.width as usize, frame.height as usize);
    let chroma_width = width.div_ceil(2);
    let mut rgb = Vec::with_capacity(width * height * 3);

    for row in 0..height {
        for col in 0..width {
            let luma = frame.y.get(row * width + col).copied().unwrap_or(0) as f32;
            let chroma = (row / 2) * chroma_width + col / 2;
            let u = frame.u.get(chroma).copied().unwrap_or(128) as f32 - 128.0;
            let v = frame.v.get(chroma).copied().unwrap_or(128) as f32 - 128.0;

            rgb.push(clamp_channel(luma + 1.402 * v));
            rgb.push(clamp_channel(luma - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_channel(luma + 1.772 * u));
        }
    }
    rgb
}

fn clamp_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Write `frame` to `path` as PNG
#[cfg(feature = "screenshot")]
pub fn write_png(frame: &VideoFrame, path: &Path) -> Result<()> {
    let rgb = yuv_to_rgb(frame);
    let image = image::RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| crate::Error::Internal("frame buffer does not match its dimensions".into()))?;
    image
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| crate::Error::Internal(format!("failed to write {}: {}", path.display(), e)))
}

#[cfg(not(feature = "screenshot"))]
pub fn write_png(_frame: &VideoFrame, _path: &Path) -> Result<()> {
    Err(Error::InvalidArgument(
        "screenshots are not supported by this build".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(width: u32, height: u32, luma: u8) -> VideoFrame {
        let chroma = (width.div_ceil(2) * height.div_ceil(2)) as usize;
        VideoFrame {
            pts_ms: 0,
            width,
            height,
            y: vec![luma; (width * height) as usize].into(),
            u: vec![128; chroma].into(),
            v: vec![128; chroma].into(),
        }
    }

    #[test]
    fn test_neutral_chroma_is_gray() {
        let rgb = yuv_to_rgb(&gray(3, 3, 90));
        assert_eq!(rgb.len(), 27);
        assert!(rgb.iter().all(|&c| c == 90));
    }

    #[test]
    fn test_saturated_red() {
        let mut frame = gray(2, 2, 76);
        frame.u = vec![85].into();
        frame.v = vec![255].into();
        let rgb = yuv_to_rgb(&frame);
        assert!(rgb[0] > 240);
        assert!(rgb[1] < 10);
        assert!(rgb[2] < 10);
    }

    #[cfg(feature = "screenshot")]
    #[test]
    fn test_write_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        write_png(&gray(4, 2, 200), &path).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (4, 2));
        assert_eq!(decoded.get_pixel(0, 0).0, [200, 200, 200]);
    }
}

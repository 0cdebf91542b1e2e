//! JPEG transcode and box annotation for the dashboard relay.

use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, RgbImage};

/// Where a frame's detections came from; picks the box color so operators
/// can see the load balancing working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceOrigin {
    Local,
    Remote,
}

impl InferenceOrigin {
    fn color(self) -> [u8; 3] {
        match self {
            Self::Local => [220, 40, 40],   // red
            Self::Remote => [255, 140, 0],  // orange
        }
    }
}

pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage, ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(frame)?;
    Ok(out)
}

/// Draw a 2-pixel hollow rectangle, clamped to the frame.
pub fn draw_box(frame: &mut RgbImage, bbox: [f64; 4], origin: InferenceOrigin) {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let clamp_x = |v: f64| -> u32 { v.max(0.0).min(f64::from(width - 1)) as u32 };
    let clamp_y = |v: f64| -> u32 { v.max(0.0).min(f64::from(height - 1)) as u32 };

    let x1 = clamp_x(bbox[0].min(bbox[2]));
    let x2 = clamp_x(bbox[0].max(bbox[2]));
    let y1 = clamp_y(bbox[1].min(bbox[3]));
    let y2 = clamp_y(bbox[1].max(bbox[3]));
    let pixel = image::Rgb(origin.color());

    for thickness in 0..2u32 {
        let top = (y1 + thickness).min(height - 1);
        let bottom = y2.saturating_sub(thickness);
        for x in x1..=x2 {
            frame.put_pixel(x, top, pixel);
            frame.put_pixel(x, bottom, pixel);
        }
        let left = (x1 + thickness).min(width - 1);
        let right = x2.saturating_sub(thickness);
        for y in y1..=y2 {
            frame.put_pixel(left, y, pixel);
            frame.put_pixel(right, y, pixel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_transcode_round_trips_dimensions() {
        let frame = RgbImage::from_pixel(32, 24, image::Rgb([10, 120, 200]));
        let jpeg = encode_jpeg(&frame, 70).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (32, 24));
    }

    #[test]
    fn draw_box_clamps_out_of_frame_coords() {
        let mut frame = RgbImage::new(20, 20);
        draw_box(&mut frame, [-10.0, -10.0, 100.0, 100.0], InferenceOrigin::Local);
        assert_eq!(*frame.get_pixel(0, 0), image::Rgb([220, 40, 40]));
        assert_eq!(*frame.get_pixel(19, 19), image::Rgb([220, 40, 40]));
        // interior untouched
        assert_eq!(*frame.get_pixel(10, 10), image::Rgb([0, 0, 0]));
    }

    #[test]
    fn origins_use_distinct_colors() {
        assert_ne!(InferenceOrigin::Local.color(), InferenceOrigin::Remote.color());
    }
}

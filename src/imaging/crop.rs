/// Square crops around a detection box
///
/// The crop region is a square of side `2 * half` centered on the box. It
/// may extend past the image; the part outside reads as black. The region is
/// never materialized: the resampler maps every output pixel straight back to
/// source pixels and leaves out-of-image taps out, so a box whose padded
/// extent is many times the image costs no more than one that fits.
///
/// Downscaling averages over the covered area; upscaling interpolates
/// bilinearly. Both are separable and deterministic.
use image::{ImageBuffer, Pixel, Primitive, Rgb};
use std::collections::HashMap;

use super::buffer::PixelBuffer;
use crate::state::data::{BoundingBox, CropSpec};

/// Crop region in source pixel coordinates. `left`/`top` may be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub left: i64,
    pub top: i64,
    pub side: i64,
}

/// Compute the crop square for `bbox` with `padding_ratio` of padding per side.
///
/// Each quantity is floored once from its exact value:
/// `cx = floor((xmin + xmax) / 2)` and
/// `half = floor(max(w, h) * (0.5 + padding_ratio))`, at least 1.
pub fn crop_window(bbox: &BoundingBox, padding_ratio: f64) -> CropWindow {
    let (cx, cy) = bbox.center();
    let factor = 0.5 + padding_ratio;
    let half_x = (bbox.width() as f64 * factor).floor();
    let half_y = (bbox.height() as f64 * factor).floor();
    let half = half_x.max(half_y).clamp(1.0, (i64::MAX / 8) as f64) as i64;

    CropWindow {
        left: cx.saturating_sub(half),
        top: cy.saturating_sub(half),
        side: half.saturating_mul(2),
    }
}

/// Crop `buffer` around `bbox` and resize to `spec.output_size` squared.
///
/// Keeps the bit depth of the input. Never fails: boxes partially or fully
/// outside the image produce black where there is no image.
pub fn crop(buffer: &PixelBuffer, bbox: &BoundingBox, spec: &CropSpec) -> PixelBuffer {
    let window = crop_window(bbox, spec.padding_ratio);
    let out = spec.output_size.max(1);
    match buffer {
        PixelBuffer::Rgb8(img) => PixelBuffer::Rgb8(resample(img, window, out)),
        PixelBuffer::Rgb16(img) => PixelBuffer::Rgb16(resample(img, window, out)),
    }
}

trait Sample: Primitive {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Sample for u8 {
    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, u8::MAX as f32) as u8
    }
}

impl Sample for u16 {
    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, u16::MAX as f32) as u16
    }
}

/// Source taps `(index, weight)` contributing to one output coordinate.
type Taps = Vec<(usize, f32)>;

/// Per-output taps along one axis.
///
/// `start` is where the crop square begins in source coordinates, `side` its
/// length, `extent` the image size along this axis.
fn axis_taps(start: i64, side: i64, out: u32, extent: u32) -> Vec<Taps> {
    let side_f = side as f64;
    let scale = side_f / out as f64;
    let origin = start as f64;
    let extent = extent as f64;

    (0..out)
        .map(|o| {
            let mut taps = Taps::new();
            if scale >= 1.0 {
                // Area average over [a, b) in source coordinates.
                let a = origin + o as f64 * scale;
                let b = a + scale;
                let lo = a.floor().max(0.0);
                let hi = b.ceil().min(extent);
                let mut k = lo;
                while k < hi {
                    let overlap = b.min(k + 1.0) - a.max(k);
                    if overlap > 0.0 {
                        taps.push((k as usize, (overlap / scale) as f32));
                    }
                    k += 1.0;
                }
            } else {
                let center = ((o as f64 + 0.5) * scale - 0.5).clamp(0.0, side_f - 1.0);
                let k0 = center.floor();
                let k1 = (k0 + 1.0).min(side_f - 1.0);
                let t = center - k0;
                for (k, weight) in [(k0, 1.0 - t), (k1, t)] {
                    let source = origin + k;
                    if weight > 0.0 && source >= 0.0 && source < extent {
                        taps.push((source as usize, weight as f32));
                    }
                }
            }
            taps
        })
        .collect()
}

fn resample<T: Sample>(
    src: &ImageBuffer<Rgb<T>, Vec<T>>,
    window: CropWindow,
    out: u32,
) -> ImageBuffer<Rgb<T>, Vec<T>>
where
    Rgb<T>: Pixel<Subpixel = T>,
{
    let out_len = out as usize;
    let x_taps = axis_taps(window.left, window.side, out, src.width());
    let y_taps = axis_taps(window.top, window.side, out, src.height());

    // Horizontal pass, only for source rows some output row reads.
    let mut rows: HashMap<usize, Vec<f32>> = HashMap::new();
    for &(y, _) in y_taps.iter().flatten() {
        rows.entry(y).or_insert_with(|| {
            let mut row = vec![0.0f32; out_len * 3];
            for (ox, taps) in x_taps.iter().enumerate() {
                for &(x, weight) in taps {
                    let pixel = src.get_pixel(x as u32, y as u32);
                    for c in 0..3 {
                        row[ox * 3 + c] += pixel[c].to_f32() * weight;
                    }
                }
            }
            row
        });
    }

    let mut data = Vec::with_capacity(out_len * out_len * 3);
    let mut acc = vec![0.0f32; out_len * 3];
    for taps in &y_taps {
        acc.fill(0.0);
        for &(y, weight) in taps {
            if let Some(row) = rows.get(&y) {
                for (a, r) in acc.iter_mut().zip(row) {
                    *a += r * weight;
                }
            }
        }
        data.extend(acc.iter().map(|&v| T::from_f32(v)));
    }

    ImageBuffer::from_raw(out, out, data).unwrap_or_else(|| ImageBuffer::new(out, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::buffer::Rgb16Image;
    use image::RgbImage;

    fn white(w: u32, h: u32) -> PixelBuffer {
        PixelBuffer::Rgb8(RgbImage::from_pixel(w, h, Rgb([255, 255, 255])))
    }

    fn pixel(buffer: &PixelBuffer, x: u32, y: u32) -> [u16; 3] {
        match buffer {
            PixelBuffer::Rgb8(img) => img.get_pixel(x, y).0.map(u16::from),
            PixelBuffer::Rgb16(img) => img.get_pixel(x, y).0,
        }
    }

    fn bbox(x1: i64, y1: i64, x2: i64, y2: i64) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2).unwrap()
    }

    #[test]
    fn test_window_geometry() {
        let window = crop_window(&bbox(10, 10, 50, 50), 1.0);
        assert_eq!(window, CropWindow { left: -30, top: -30, side: 120 });

        // Odd extents floor both the center and the half side.
        let window = crop_window(&bbox(0, 0, 5, 3), 0.0);
        assert_eq!(window, CropWindow { left: 0, top: -1, side: 4 });

        let window = crop_window(&bbox(0, 0, 1, 1), 0.0);
        assert_eq!(window.side, 2);
    }

    #[test]
    fn test_output_is_always_requested_size() {
        let source = white(37, 23);
        for (b, ratio, size) in [
            (bbox(0, 0, 5, 5), 0.0, 1),
            (bbox(3, 4, 30, 20), 0.25, 64),
            (bbox(-10, -10, 50, 40), 2.0, 17),
            (bbox(30, 20, 36, 22), 0.5, 300),
        ] {
            let cropped = crop(&source, &b, &CropSpec::new(ratio, size));
            assert_eq!((cropped.width(), cropped.height()), (size, size));
            assert_eq!(cropped.channels(), 3);
        }
    }

    #[test]
    fn test_fully_outside_box_is_black() {
        let cropped = crop(&white(10, 10), &bbox(1000, 1000, 1010, 1010), &CropSpec::new(0.5, 16));
        match cropped {
            PixelBuffer::Rgb8(img) => assert!(img.as_raw().iter().all(|&v| v == 0)),
            PixelBuffer::Rgb16(_) => panic!("depth changed"),
        }
    }

    #[test]
    fn test_border_box_pads_outside_edge_only() {
        // half = 10, center (5, 5): the square spans -5..15 on both axes.
        let cropped = crop(&white(20, 20), &bbox(0, 0, 10, 10), &CropSpec::new(0.5, 20));
        assert_eq!(pixel(&cropped, 0, 0), [0, 0, 0]);
        assert_eq!(pixel(&cropped, 4, 10), [0, 0, 0]);
        assert_eq!(pixel(&cropped, 10, 4), [0, 0, 0]);
        assert_eq!(pixel(&cropped, 5, 5), [255, 255, 255]);
        assert_eq!(pixel(&cropped, 19, 19), [255, 255, 255]);
    }

    #[test]
    fn test_huge_padded_extent_is_not_an_error() {
        let cropped = crop(
            &white(10, 10),
            &bbox(-1_000_000, -1_000_000, 1_000_000, 1_000_000),
            &CropSpec::new(1.0, 32),
        );
        assert_eq!((cropped.width(), cropped.height()), (32, 32));
        assert_eq!(pixel(&cropped, 0, 0), [0, 0, 0]);
    }

    #[test]
    fn test_unit_scale_copies_16_bit_samples_exactly() {
        let mut img = Rgb16Image::new(8, 8);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgb([x as u16 * 1000 + 7, y as u16 * 3000, 65535]);
        }
        let source = PixelBuffer::Rgb16(img);
        let cropped = crop(&source, &bbox(2, 2, 6, 6), &CropSpec::new(0.0, 4));

        assert_eq!(cropped.bit_depth(), 16);
        assert_eq!(pixel(&cropped, 0, 0), pixel(&source, 2, 2));
        assert_eq!(pixel(&cropped, 3, 1), pixel(&source, 5, 3));
    }

    #[test]
    fn test_downscale_averages_area() {
        let mut img = RgbImage::new(4, 4);
        for (x, _, p) in img.enumerate_pixels_mut() {
            *p = if x % 2 == 0 { Rgb([200, 200, 200]) } else { Rgb([100, 100, 100]) };
        }
        let cropped = crop(&PixelBuffer::Rgb8(img), &bbox(0, 0, 4, 4), &CropSpec::new(0.0, 2));
        assert_eq!(pixel(&cropped, 0, 0), [150, 150, 150]);
        assert_eq!(pixel(&cropped, 1, 1), [150, 150, 150]);
    }

    #[test]
    fn test_upscale_inside_image_keeps_uniform_color() {
        let cropped = crop(&white(10, 10), &bbox(2, 2, 8, 8), &CropSpec::new(0.0, 24));
        match cropped {
            PixelBuffer::Rgb8(img) => assert!(img.as_raw().iter().all(|&v| v == 255)),
            PixelBuffer::Rgb16(_) => panic!("depth changed"),
        }
    }

    #[test]
    fn test_crop_is_deterministic() {
        let mut img = RgbImage::new(50, 40);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgb([(x * 5) as u8, (y * 6) as u8, ((x + y) % 256) as u8]);
        }
        let source = PixelBuffer::Rgb8(img);
        let spec = CropSpec::new(0.3, 37);
        let b = bbox(5, 7, 33, 29);
        assert_eq!(crop(&source, &b, &spec), crop(&source, &b, &spec));
    }
}

/// Color and bit-depth conversion utilities
///
/// This module handles:
/// - Reducing 16-bit buffers to 8-bit for display
/// - Swapping between BGR and RGB channel order
use image::RgbImage;

use crate::imaging::buffer::PixelBuffer;

/// Divisor mapping the full 16-bit range onto the full 8-bit range
/// (65535 / 257 = 255).
const U16_TO_U8: u16 = 257;

/// Convert a canonical buffer to 8-bit RGB for display.
///
/// 8-bit buffers pass through unchanged; 16-bit samples are scaled by 1/257.
pub fn to_display_rgb8(buffer: &PixelBuffer) -> RgbImage {
    match buffer {
        PixelBuffer::Rgb8(img) => img.clone(),
        PixelBuffer::Rgb16(img) => {
            let samples = img.as_raw().iter().map(|&v| (v / U16_TO_U8) as u8).collect();
            RgbImage::from_raw(img.width(), img.height(), samples)
                .unwrap_or_else(|| RgbImage::new(img.width(), img.height()))
        }
    }
}

/// Swap the first and third channel of every interleaved 3-sample pixel,
/// turning BGR into RGB and back.
pub fn swap_red_blue<T>(samples: &mut [T]) {
    for pixel in samples.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
}

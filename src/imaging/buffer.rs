/// Pixel containers
///
/// `RawRaster` is whatever a decoder managed to read: an arbitrary shape,
/// sample type and channel order. `PixelBuffer` is the canonical form every
/// other component works with: H×W×3 RGB at 8 or 16 bits.
use image::{ImageBuffer, Rgb, RgbImage};

/// 16-bit RGB image.
pub type Rgb16Image = ImageBuffer<Rgb<u16>, Vec<u16>>;

/// Canonical decoded or cropped image: three RGB channels, 8 or 16 bit.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    Rgb8(RgbImage),
    Rgb16(Rgb16Image),
}

impl PixelBuffer {
    pub fn width(&self) -> u32 {
        match self {
            PixelBuffer::Rgb8(img) => img.width(),
            PixelBuffer::Rgb16(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            PixelBuffer::Rgb8(img) => img.height(),
            PixelBuffer::Rgb16(img) => img.height(),
        }
    }

    pub fn channels(&self) -> u8 {
        3
    }

    pub fn bit_depth(&self) -> u8 {
        match self {
            PixelBuffer::Rgb8(_) => 8,
            PixelBuffer::Rgb16(_) => 16,
        }
    }

    /// Bytes held by the sample storage.
    pub fn size_bytes(&self) -> usize {
        match self {
            PixelBuffer::Rgb8(img) => img.as_raw().len(),
            PixelBuffer::Rgb16(img) => img.as_raw().len() * 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Decoded samples in the type the decoder produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::U8(v) => v.len(),
            Samples::U16(v) => v.len(),
            Samples::U32(v) => v.len(),
            Samples::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Order of the color channels in a three/four channel raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Decoder output before normalization.
///
/// `shape` is `[H, W]`, `[H, W, C]`, `[C, H, W]` or a stack `[N, ...]`;
/// samples are stored in row-major order over that shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRaster {
    pub shape: Vec<usize>,
    pub samples: Samples,
    pub order: ChannelOrder,
}

impl RawRaster {
    pub fn new(shape: Vec<usize>, samples: Samples) -> Self {
        Self {
            shape,
            samples,
            order: ChannelOrder::Rgb,
        }
    }

    pub fn with_order(mut self, order: ChannelOrder) -> Self {
        self.order = order;
        self
    }

    /// Convert an `image` crate decode result without losing bit depth.
    pub fn from_dynamic(img: image::DynamicImage) -> Self {
        use image::DynamicImage::*;

        let (w, h) = (img.width() as usize, img.height() as usize);
        let (channels, samples) = match img {
            ImageLuma8(b) => (1, Samples::U8(b.into_raw())),
            ImageLumaA8(b) => (2, Samples::U8(b.into_raw())),
            ImageRgb8(b) => (3, Samples::U8(b.into_raw())),
            ImageRgba8(b) => (4, Samples::U8(b.into_raw())),
            ImageLuma16(b) => (1, Samples::U16(b.into_raw())),
            ImageLumaA16(b) => (2, Samples::U16(b.into_raw())),
            ImageRgb16(b) => (3, Samples::U16(b.into_raw())),
            ImageRgba16(b) => (4, Samples::U16(b.into_raw())),
            ImageRgb32F(b) => (3, Samples::F32(b.into_raw())),
            ImageRgba32F(b) => (4, Samples::F32(b.into_raw())),
            other => (4, Samples::U16(other.into_rgba16().into_raw())),
        };

        Self::new(vec![h, w, channels], samples)
    }
}

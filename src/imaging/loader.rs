/// Image decoding with a fallback chain
///
/// Microscopy files come in every flavour: 8/16-bit PNG, JPEG, single and
/// multi-page TIFF, channel stacks, misnamed extensions. No single decoder
/// reads all of them, so decoding walks an ordered list of [`Decoder`]s and
/// keeps the first one that produces pixels:
///
/// 1. `still` - the `image` crate, format chosen from the extension
///    (PNG/JPEG, TIFF frame 0)
/// 2. `tiff` - the `tiff` crate directly, first sub-image or a 3/4-page
///    channel stack
/// 3. `sniff` - the `image` crate with the format guessed from the file
///    contents and no allocation limits
///
/// Whatever succeeds is normalized to an H×W×3 RGB [`PixelBuffer`].
use log::debug;
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;
use tiff::decoder::DecodingResult;

use super::buffer::{ChannelOrder, PixelBuffer, RawRaster, Rgb16Image, Samples};
use crate::color::swap_red_blue;
use crate::error::{Error, Result};

/// One way of reading an image file.
///
/// Implementations return the raster as found in the file; normalization is
/// applied by [`ImageDecoder`] regardless of which implementation succeeded.
pub trait Decoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, path: &Path) -> std::result::Result<RawRaster, String>;
}

/// General still-image decoder; the extension picks the codec.
pub struct StillImageDecoder;

impl Decoder for StillImageDecoder {
    fn name(&self) -> &'static str {
        "still"
    }

    fn decode(&self, path: &Path) -> std::result::Result<RawRaster, String> {
        let img = image::ImageReader::open(path)
            .map_err(|e| format!("open failed: {}", e))?
            .decode()
            .map_err(|e| e.to_string())?;
        Ok(RawRaster::from_dynamic(img))
    }
}

/// Scientific TIFF decoder for layouts the general decoder rejects.
pub struct ScientificTiffDecoder;

impl ScientificTiffDecoder {
    /// Pages forming a channel-first stack have this many single-channel
    /// planes of identical geometry.
    const STACK_CHANNELS: [usize; 2] = [3, 4];
}

impl Decoder for ScientificTiffDecoder {
    fn name(&self) -> &'static str {
        "tiff"
    }

    fn decode(&self, path: &Path) -> std::result::Result<RawRaster, String> {
        let file = File::open(path).map_err(|e| format!("open failed: {}", e))?;
        let mut decoder = tiff::decoder::Decoder::new(BufReader::new(file))
            .map_err(|e| e.to_string())?
            .with_limits(tiff::decoder::Limits::unlimited());

        let colortype = decoder.colortype().map_err(|e| e.to_string())?;
        let channels = match colortype {
            tiff::ColorType::Gray(_) => 1,
            tiff::ColorType::GrayA(_) => 2,
            tiff::ColorType::RGB(_) => 3,
            tiff::ColorType::RGBA(_) => 4,
            other => return Err(format!("unsupported TIFF color type {:?}", other)),
        };
        let (w, h) = decoder.dimensions().map_err(|e| e.to_string())?;
        let (w, h) = (w as usize, h as usize);
        let first = read_page(&mut decoder)?;

        if channels != 1 || !decoder.more_images() {
            return Ok(RawRaster::new(vec![h, w, channels], first));
        }

        // A short run of gray pages with identical geometry is a (C, H, W)
        // channel stack; anything else is a time/z stack and we keep page 0.
        let mut planes = vec![first];
        while decoder.more_images() && planes.len() <= Self::STACK_CHANNELS[1] {
            if decoder.next_image().is_err() {
                break;
            }
            let same_geometry = decoder.dimensions().ok() == Some((w as u32, h as u32))
                && matches!(decoder.colortype(), Ok(c) if c == colortype);
            if !same_geometry {
                break;
            }
            match read_page(&mut decoder) {
                Ok(plane) => planes.push(plane),
                Err(_) => break,
            }
        }

        let is_stack = Self::STACK_CHANNELS.contains(&planes.len()) && !decoder.more_images();
        if !is_stack {
            return Ok(RawRaster::new(vec![h, w, 1], planes.swap_remove(0)));
        }

        let depth = planes.len();
        let samples = concat_planes(planes).ok_or("mixed sample types in channel stack")?;
        Ok(RawRaster::new(vec![depth, h, w], samples))
    }
}

/// Broad-format decoder used as last resort: sniffs the format from the
/// file contents, so misnamed files still decode.
pub struct SniffingDecoder;

impl Decoder for SniffingDecoder {
    fn name(&self) -> &'static str {
        "sniff"
    }

    fn decode(&self, path: &Path) -> std::result::Result<RawRaster, String> {
        let bytes = std::fs::read(path).map_err(|e| format!("read failed: {}", e))?;
        let mut reader = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| e.to_string())?;
        reader.no_limits();
        let img = reader.decode().map_err(|e| e.to_string())?;
        Ok(RawRaster::from_dynamic(img))
    }
}

fn read_page<R: std::io::Read + std::io::Seek>(
    decoder: &mut tiff::decoder::Decoder<R>,
) -> std::result::Result<Samples, String> {
    let page = decoder.read_image().map_err(|e| e.to_string())?;
    match page {
        DecodingResult::U8(v) => Ok(Samples::U8(v)),
        DecodingResult::U16(v) => Ok(Samples::U16(v)),
        DecodingResult::U32(v) => Ok(Samples::U32(v)),
        DecodingResult::F32(v) => Ok(Samples::F32(v)),
        DecodingResult::F64(v) => Ok(Samples::F32(v.into_iter().map(|s| s as f32).collect())),
        // Signed data: negatives clip to black, the positive half is stretched.
        DecodingResult::I8(v) => Ok(Samples::U8(
            v.into_iter().map(|s| (s.max(0) as u8) << 1).collect(),
        )),
        DecodingResult::I16(v) => Ok(Samples::U16(
            v.into_iter().map(|s| (s.max(0) as u16) << 1).collect(),
        )),
        _ => Err("unsupported TIFF sample format".to_string()),
    }
}

fn concat_planes(planes: Vec<Samples>) -> Option<Samples> {
    let mut iter = planes.into_iter();
    let mut acc = iter.next()?;
    for plane in iter {
        match (&mut acc, plane) {
            (Samples::U8(a), Samples::U8(b)) => a.extend(b),
            (Samples::U16(a), Samples::U16(b)) => a.extend(b),
            (Samples::U32(a), Samples::U32(b)) => a.extend(b),
            (Samples::F32(a), Samples::F32(b)) => a.extend(b),
            _ => return None,
        }
    }
    Some(acc)
}

/// Pixel layout after shape analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    ChannelLast,
    ChannelFirst,
}

/// Bring any decoder output into canonical H×W×3 RGB form.
///
/// - `[H, W]` is gray
/// - `[H, W, C]` with C in 1..=4 is channel-last
/// - `[C, H, W]` with C in {1, 3, 4} (last axis not a channel count) is
///   transposed to channel-last
/// - a leading stack axis `[N, ...]` keeps the first sub-image
///
/// One channel is replicated, a second (alpha) or fourth channel is dropped,
/// BGR is swapped to RGB. 8- and 16-bit samples keep their depth; 32-bit
/// integers and floats (assumed `[0, 1]`) become 16-bit.
pub fn normalize(raster: RawRaster) -> std::result::Result<PixelBuffer, String> {
    let RawRaster {
        mut shape,
        samples,
        order,
    } = raster;

    let expected: usize = shape.iter().product();
    if samples.is_empty() || expected == 0 {
        return Err("no pixel data".to_string());
    }
    if samples.len() != expected {
        return Err(format!(
            "shape {:?} needs {} samples, got {}",
            shape,
            expected,
            samples.len()
        ));
    }

    let mut samples = samples;
    if shape.len() == 4 {
        let frame = expected / shape[0];
        samples = first_frame(samples, frame);
        shape.remove(0);
    }

    let (h, w, c, layout) = match shape[..] {
        [h, w] => (h, w, 1, Layout::ChannelLast),
        [h, w, c] if (1..=4).contains(&c) => (h, w, c, Layout::ChannelLast),
        [c, h, w] if matches!(c, 1 | 3 | 4) => (h, w, c, Layout::ChannelFirst),
        _ => return Err(format!("unsupported raster shape {:?}", shape)),
    };
    let width = u32::try_from(w).map_err(|_| "image too wide".to_string())?;
    let height = u32::try_from(h).map_err(|_| "image too tall".to_string())?;

    let geometry = Geometry { h, w, c, layout, order };
    match samples {
        Samples::U8(v) => {
            let rgb = geometry.gather(&v);
            image::RgbImage::from_raw(width, height, rgb)
                .map(PixelBuffer::Rgb8)
                .ok_or_else(|| "buffer size mismatch".to_string())
        }
        Samples::U16(v) => geometry.to_rgb16(width, height, &v),
        Samples::U32(v) => {
            let v: Vec<u16> = v.into_iter().map(|s| (s / 65537) as u16).collect();
            geometry.to_rgb16(width, height, &v)
        }
        Samples::F32(v) => {
            let v: Vec<u16> = v
                .into_iter()
                .map(|s| {
                    let s = if s.is_finite() { s.clamp(0.0, 1.0) } else { 0.0 };
                    (s * 65535.0 + 0.5) as u16
                })
                .collect();
            geometry.to_rgb16(width, height, &v)
        }
    }
}

fn first_frame(samples: Samples, frame: usize) -> Samples {
    match samples {
        Samples::U8(mut v) => {
            v.truncate(frame);
            Samples::U8(v)
        }
        Samples::U16(mut v) => {
            v.truncate(frame);
            Samples::U16(v)
        }
        Samples::U32(mut v) => {
            v.truncate(frame);
            Samples::U32(v)
        }
        Samples::F32(mut v) => {
            v.truncate(frame);
            Samples::F32(v)
        }
    }
}

struct Geometry {
    h: usize,
    w: usize,
    c: usize,
    layout: Layout,
    order: ChannelOrder,
}

impl Geometry {
    fn gather<T: Copy>(&self, src: &[T]) -> Vec<T> {
        let plane = self.h * self.w;
        let mut out = Vec::with_capacity(plane * 3);
        for p in 0..plane {
            let at = |ch: usize| match self.layout {
                Layout::ChannelLast => src[p * self.c + ch],
                Layout::ChannelFirst => src[ch * plane + p],
            };
            if self.c < 3 {
                let v = at(0);
                out.extend([v, v, v]);
            } else {
                out.extend([at(0), at(1), at(2)]);
            }
        }
        if self.c >= 3 && self.order == ChannelOrder::Bgr {
            swap_red_blue(&mut out);
        }
        out
    }

    fn to_rgb16(
        &self,
        width: u32,
        height: u32,
        src: &[u16],
    ) -> std::result::Result<PixelBuffer, String> {
        Rgb16Image::from_raw(width, height, self.gather(src))
            .map(PixelBuffer::Rgb16)
            .ok_or_else(|| "buffer size mismatch".to_string())
    }
}

/// Runs attempts lazily in order and returns the first success, or every
/// failure reason if none succeeded.
fn first_success<T, I>(attempts: I) -> std::result::Result<T, Vec<String>>
where
    I: IntoIterator<Item = (&'static str, std::result::Result<T, String>)>,
{
    let mut failures = Vec::new();
    for (name, attempt) in attempts {
        match attempt {
            Ok(value) => return Ok(value),
            Err(reason) => failures.push(format!("{}: {}", name, reason)),
        }
    }
    Err(failures)
}

/// Ordered decoder chain plus normalization.
pub struct ImageDecoder {
    decoders: Vec<Box<dyn Decoder>>,
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self::with_decoders(vec![
            Box::new(StillImageDecoder),
            Box::new(ScientificTiffDecoder),
            Box::new(SniffingDecoder),
        ])
    }
}

impl ImageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decoders(decoders: Vec<Box<dyn Decoder>>) -> Self {
        Self { decoders }
    }

    pub fn decoder_names(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }

    /// Decode `path` into a canonical buffer.
    ///
    /// Fails with [`Error::Decode`] only when no decoder in the chain yields
    /// non-empty pixel data.
    pub fn decode(&self, path: &Path) -> Result<PixelBuffer> {
        let attempts = self.decoders.iter().map(|decoder| {
            let outcome = decoder.decode(path).and_then(normalize);
            if let Ok(buffer) = &outcome {
                debug!(
                    "Decoded {} with {} ({}x{}, {}-bit)",
                    path.display(),
                    decoder.name(),
                    buffer.width(),
                    buffer.height(),
                    buffer.bit_depth()
                );
            }
            (decoder.name(), outcome)
        });

        first_success(attempts).map_err(|failures| Error::Decode {
            path: path.to_path_buf(),
            reason: if failures.is_empty() {
                "no decoders configured".to_string()
            } else {
                failures.join("; ")
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma, Rgb, Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn rgb_at(buffer: &PixelBuffer, x: u32, y: u32) -> [u16; 3] {
        match buffer {
            PixelBuffer::Rgb8(img) => img.get_pixel(x, y).0.map(u16::from),
            PixelBuffer::Rgb16(img) => img.get_pixel(x, y).0,
        }
    }

    #[test]
    fn test_gray_is_replicated() {
        let raster = RawRaster::new(vec![1, 2], Samples::U8(vec![7, 9]));
        let buffer = normalize(raster).unwrap();
        assert_eq!(buffer.bit_depth(), 8);
        assert_eq!(rgb_at(&buffer, 1, 0), [9, 9, 9]);
    }

    #[test]
    fn test_alpha_is_dropped() {
        let raster = RawRaster::new(vec![1, 1, 4], Samples::U16(vec![1, 2, 3, 4]));
        let buffer = normalize(raster).unwrap();
        assert_eq!(buffer.bit_depth(), 16);
        assert_eq!(rgb_at(&buffer, 0, 0), [1, 2, 3]);
    }

    #[test]
    fn test_channel_first_is_transposed() {
        // (C=3, H=1, W=5): one plane per channel.
        let mut samples = vec![10u8; 5];
        samples.extend([20u8; 5]);
        samples.extend([30u8; 5]);
        let buffer = normalize(RawRaster::new(vec![3, 1, 5], Samples::U8(samples))).unwrap();
        assert_eq!((buffer.width(), buffer.height()), (5, 1));
        assert_eq!(rgb_at(&buffer, 4, 0), [10, 20, 30]);
    }

    #[test]
    fn test_bgr_is_swapped() {
        let raster = RawRaster::new(vec![1, 1, 3], Samples::U8(vec![1, 2, 3]))
            .with_order(ChannelOrder::Bgr);
        assert_eq!(rgb_at(&normalize(raster).unwrap(), 0, 0), [3, 2, 1]);
    }

    #[test]
    fn test_stack_keeps_first_frame_and_floats_become_16_bit() {
        let raster = RawRaster::new(vec![2, 1, 1, 1], Samples::F32(vec![1.0, 0.0]));
        let buffer = normalize(raster).unwrap();
        assert_eq!(buffer.bit_depth(), 16);
        assert_eq!(rgb_at(&buffer, 0, 0), [65535, 65535, 65535]);
    }

    #[test]
    fn test_empty_and_inconsistent_rasters_fail() {
        assert!(normalize(RawRaster::new(vec![0, 4], Samples::U8(vec![]))).is_err());
        assert!(normalize(RawRaster::new(vec![2, 2], Samples::U8(vec![1]))).is_err());
        assert!(normalize(RawRaster::new(vec![2, 2, 7], Samples::U8(vec![0; 28]))).is_err());
    }

    #[test]
    fn test_png_16_bit_gray_decodes_to_rgb16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray16.png");
        ImageBuffer::from_pixel(3, 2, Luma([40000u16])).save(&path).unwrap();

        let buffer = ImageDecoder::new().decode(&path).unwrap();
        assert_eq!(buffer.bit_depth(), 16);
        assert_eq!((buffer.width(), buffer.height()), (3, 2));
        assert_eq!(rgb_at(&buffer, 2, 1), [40000, 40000, 40000]);
    }

    #[test]
    fn test_rgba_tiff_decodes_to_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("color.tif");
        RgbaImage::from_pixel(4, 4, Rgba([200, 100, 50, 255])).save(&path).unwrap();

        let buffer = ImageDecoder::new().decode(&path).unwrap();
        assert_eq!(rgb_at(&buffer, 0, 0), [200, 100, 50]);
    }

    #[test]
    fn test_misnamed_file_falls_through_to_sniffing() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("real.png");
        GrayImage::from_pixel(2, 2, Luma([77])).save(&png).unwrap();
        let misnamed = dir.path().join("actually_png.tif");
        std::fs::rename(&png, &misnamed).unwrap();

        let tiff_only = ImageDecoder::with_decoders(vec![Box::new(ScientificTiffDecoder)]);
        assert!(tiff_only.decode(&misnamed).is_err());

        let buffer = ImageDecoder::new().decode(&misnamed).unwrap();
        assert_eq!(rgb_at(&buffer, 1, 1), [77, 77, 77]);
    }

    #[test]
    fn test_tiff_decoder_reads_first_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("single.tif");
        ImageBuffer::from_pixel(3, 3, Luma([1234u16])).save(&path).unwrap();

        let raster = ScientificTiffDecoder.decode(&path).unwrap();
        assert_eq!(raster.shape, vec![3, 3, 1]);
        assert_eq!(rgb_at(&normalize(raster).unwrap(), 0, 0), [1234, 1234, 1234]);
    }

    struct Failing(&'static str, Arc<AtomicUsize>);

    impl Decoder for Failing {
        fn name(&self) -> &'static str {
            self.0
        }

        fn decode(&self, _path: &Path) -> std::result::Result<RawRaster, String> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_string())
        }
    }

    struct Solid(Arc<AtomicUsize>);

    impl Decoder for Solid {
        fn name(&self) -> &'static str {
            "solid"
        }

        fn decode(&self, _path: &Path) -> std::result::Result<RawRaster, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(RawRaster::new(vec![1, 1, 3], Samples::U8(vec![5, 6, 7])))
        }
    }

    #[test]
    fn test_chain_stops_at_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = ImageDecoder::with_decoders(vec![
            Box::new(Failing("first", Arc::clone(&calls))),
            Box::new(Solid(Arc::clone(&calls))),
            Box::new(Failing("never", Arc::clone(&calls))),
        ]);

        let buffer = chain.decode(Path::new("whatever")).unwrap();
        assert_eq!(rgb_at(&buffer, 0, 0), [5, 6, 7]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_chain_reports_every_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = ImageDecoder::with_decoders(vec![
            Box::new(Failing("a", Arc::clone(&calls))),
            Box::new(Failing("b", Arc::clone(&calls))),
        ]);

        match chain.decode(Path::new("x.tif")) {
            Err(Error::Decode { reason, .. }) => assert_eq!(reason, "a: nope; b: nope"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(ImageDecoder::with_decoders(vec![]).decode(Path::new("x")).is_err());
    }

    #[test]
    fn test_rgb_png_roundtrip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.png");
        let mut img = image::RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([1, 2, 3]));
        img.put_pixel(1, 0, Rgb([250, 251, 252]));
        img.save(&path).unwrap();

        let buffer = ImageDecoder::new().decode(&path).unwrap();
        assert_eq!(buffer, PixelBuffer::Rgb8(img));
    }
}

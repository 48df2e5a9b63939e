/// Shared data structures for detections and crop requests
///
/// These value objects are created once when a dataset is flattened and are
/// immutable afterwards. They flow from the dataset loader to the cache and
/// the UI layer.
use serde::Serialize;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Smallest and largest coordinate accepted from dataset files.
pub const COORD_MIN: i64 = i32::MIN as i64;
pub const COORD_MAX: i64 = i32::MAX as i64;

/// `floor((a + b) / 2)` without overflowing.
fn midpoint(a: i64, b: i64) -> i64 {
    ((a as i128 + b as i128).div_euclid(2)) as i64
}

/// Axis-aligned box in source-image pixel coordinates.
///
/// Invariant: `xmax > xmin` and `ymax > ymin`. Degenerate boxes are rejected
/// by [`BoundingBox::new`], never clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BoundingBox {
    xmin: i64,
    ymin: i64,
    xmax: i64,
    ymax: i64,
}

impl BoundingBox {
    /// Checks the box has positive width and height before constructing.
    pub fn new(xmin: i64, ymin: i64, xmax: i64, ymax: i64) -> Result<Self> {
        let reject = |reason: &str| Error::InvalidBox {
            xmin,
            ymin,
            xmax,
            ymax,
            reason: reason.to_string(),
        };
        if xmax <= xmin {
            return Err(reject("xmax must be greater than xmin"));
        }
        if ymax <= ymin {
            return Err(reject("ymax must be greater than ymin"));
        }
        Ok(Self { xmin, ymin, xmax, ymax })
    }

    /// Build from `[x1, y1, x2, y2]` as found in dataset files.
    ///
    /// Coordinates may be fractional; they are rounded half-to-even. Values
    /// outside the `i32` range are rejected rather than saturated.
    pub fn from_coords(coords: [f64; 4]) -> Result<Self> {
        let reject = |reason: String| Error::InvalidBox {
            xmin: 0,
            ymin: 0,
            xmax: 0,
            ymax: 0,
            reason,
        };
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(reject(format!("non-finite coordinate in {:?}", coords)));
        }
        let rounded = coords.map(f64::round_ties_even);
        if rounded.iter().any(|&c| c < COORD_MIN as f64 || c > COORD_MAX as f64) {
            return Err(reject(format!("coordinate out of range in {:?}", coords)));
        }
        let [x1, y1, x2, y2] = rounded.map(|c| c as i64);
        Self::new(x1, y1, x2, y2)
    }

    pub fn xmin(&self) -> i64 {
        self.xmin
    }

    pub fn ymin(&self) -> i64 {
        self.ymin
    }

    pub fn xmax(&self) -> i64 {
        self.xmax
    }

    pub fn ymax(&self) -> i64 {
        self.ymax
    }

    /// Saturates for boxes built directly from extreme `i64` corners.
    pub fn width(&self) -> i64 {
        self.xmax.saturating_sub(self.xmin)
    }

    pub fn height(&self) -> i64 {
        self.ymax.saturating_sub(self.ymin)
    }

    /// Center, floored toward negative infinity on both axes.
    pub fn center(&self) -> (i64, i64) {
        (midpoint(self.xmin, self.xmax), midpoint(self.ymin, self.ymax))
    }

    pub fn xyxy(&self) -> [i64; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }
}

/// One annotated box with its confidence, tied to a source image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// `<image basename>_<index within image>`, unique within a dataset.
    pub id: String,
    /// Image reference exactly as declared in the dataset file.
    pub image_ref: String,
    pub bbox: BoundingBox,
    /// Score in `[0, 1]`.
    pub confidence: f64,
    pub cell_id: String,
}

/// One raw box/score pair as read from either dataset schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBox {
    pub coords: [f64; 4],
    pub confidence: f64,
    /// Declared cell label, or the schema's positional default.
    pub cell_id: String,
}

/// One source image plus its raw detections, before threshold filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetEntry {
    pub image_path: String,
    pub boxes: Vec<RawBox>,
}

/// Crop parameters after normalization: finite non-negative padding and a
/// non-zero output edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropSpec {
    pub padding_ratio: f64,
    pub output_size: u32,
}

impl CropSpec {
    pub fn new(padding_ratio: f64, output_size: u32) -> Self {
        let padding_ratio = if padding_ratio.is_finite() && padding_ratio > 0.0 {
            padding_ratio
        } else {
            0.0
        };
        Self {
            padding_ratio,
            output_size: output_size.max(1),
        }
    }
}

/// A named crop configuration. Two variants of the same detection are
/// independent cache entries.
#[derive(Debug, Clone, Copy)]
pub enum CropVariant {
    /// Tight square crop around the box for grid display.
    Thumbnail { size: u32 },
    /// Padded crop for the large viewfinder.
    Viewfinder { padding_ratio: f64, size: u32 },
}

impl CropVariant {
    pub fn spec(&self) -> CropSpec {
        match *self {
            CropVariant::Thumbnail { size } => CropSpec::new(0.0, size),
            CropVariant::Viewfinder {
                padding_ratio,
                size,
            } => CropSpec::new(padding_ratio, size),
        }
    }

    /// Stable textual tag used in cache keys.
    pub fn tag(&self) -> String {
        let spec = self.spec();
        match self {
            CropVariant::Thumbnail { .. } => format!("thumb-{}", spec.output_size),
            CropVariant::Viewfinder { .. } => format!(
                "view-{:016x}-{}",
                spec.padding_ratio.to_bits(),
                spec.output_size
            ),
        }
    }
}

// Equality and hashing go through the normalized crop parameters, so a NaN
// padding and a zero padding address the same entry.
impl PartialEq for CropVariant {
    fn eq(&self, other: &Self) -> bool {
        self.tag() == other.tag()
    }
}

impl Eq for CropVariant {}

impl Hash for CropVariant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
    }
}

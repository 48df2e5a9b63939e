//! Crop pipeline behind the cell verification grid.
//!
//! A dataset file lists images and the boxes a detector drew on them. This
//! crate flattens those into [`Detection`]s, finds the referenced images even
//! after the dataset has moved, decodes them whatever their format, and hands
//! out fixed-size square crops through a memory + disk cache.

pub mod cache;
pub mod color;
pub mod config;
pub mod error;
pub mod imaging;
pub mod logging;
pub mod state;

pub use cache::thumbnail::{CacheKey, CacheStats, ThumbnailCache};
pub use config::Config;
pub use error::{Error, Result};
pub use imaging::buffer::PixelBuffer;
pub use imaging::crop::crop;
pub use imaging::loader::{Decoder, ImageDecoder};
pub use state::data::{BoundingBox, CropSpec, CropVariant, DatasetEntry, Detection};
pub use state::dataset::{flatten, parse, relink, sort_by_confidence, RelinkReport};
pub use state::resolver::PathResolver;

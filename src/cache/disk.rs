/// Persistent crop store (cache tier 2)
///
/// One lossless PNG per cache key in a flat directory. File names are the
/// SHA-256 of the canonical key: a content address that keeps names bounded
/// and filesystem-safe, not a security measure.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader sees either the complete file or nothing. A file that fails to
/// decode or has the wrong size is removed and reported as a miss.
use image::{DynamicImage, ExtendedColorType, ImageFormat};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::imaging::buffer::PixelBuffer;

const EXTENSION: &str = "png";

/// Hex SHA-256 of `key`.
pub fn key_digest(key: &str) -> String {
    Sha256::digest(key.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug)]
pub struct DiskTier {
    dir: PathBuf,
    writes: AtomicU64,
}

impl DiskTier {
    /// Use `dir` as the store, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::cache_io(&dir, e))?;
        Ok(Self {
            dir,
            writes: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key_digest(key), EXTENSION))
    }

    /// Read the crop stored for `key`.
    ///
    /// `Ok(None)` is a miss: absent, unreadable as an image, or not
    /// `edge`×`edge`. Only I/O errors other than "not found" are `Err`.
    pub fn read(&self, key: &str, edge: u32) -> Result<Option<PixelBuffer>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::cache_io(&path, e)),
        };

        let buffer = match image::load_from_memory_with_format(&bytes, ImageFormat::Png) {
            Ok(DynamicImage::ImageRgb8(img)) => Some(PixelBuffer::Rgb8(img)),
            Ok(DynamicImage::ImageRgb16(img)) => Some(PixelBuffer::Rgb16(img)),
            Ok(_) | Err(_) => None,
        };

        match buffer {
            Some(buffer) if buffer.width() == edge && buffer.height() == edge => Ok(Some(buffer)),
            _ => {
                warn!("Discarding unusable cache file {}", path.display());
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    /// Store `buffer` under `key`, replacing any previous file.
    pub fn write(&self, key: &str, buffer: &PixelBuffer) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(
            ".{}.{}-{}.tmp",
            key_digest(key),
            std::process::id(),
            self.writes.fetch_add(1, Ordering::Relaxed)
        ));

        let saved = match buffer {
            PixelBuffer::Rgb8(img) => image::save_buffer_with_format(
                &tmp,
                img.as_raw(),
                img.width(),
                img.height(),
                ExtendedColorType::Rgb8,
                ImageFormat::Png,
            ),
            PixelBuffer::Rgb16(img) => image::save_buffer_with_format(
                &tmp,
                bytemuck::cast_slice(img.as_raw()),
                img.width(),
                img.height(),
                ExtendedColorType::Rgb16,
                ImageFormat::Png,
            ),
        };

        let renamed = saved
            .map_err(|e| Error::cache_io(&tmp, e))
            .and_then(|()| fs::rename(&tmp, &path).map_err(|e| Error::cache_io(&path, e)));
        if renamed.is_err() {
            let _ = fs::remove_file(&tmp);
        } else {
            debug!("Stored crop {}", path.display());
        }
        renamed
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::cache_io(&path, e)),
        }
    }

    /// Number of stored crops.
    pub fn len(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().extension().is_some_and(|ext| ext == EXTENSION))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

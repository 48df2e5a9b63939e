/// Two-tier crop cache
///
/// A request for `(detection, variant)` is served from:
/// 1. Tier 1, the in-memory LRU
/// 2. Tier 2, the on-disk store (a hit is promoted into tier 1)
/// 3. a fresh resolve → decode → crop, written to both tiers
///
/// Only one computation per key runs at a time; concurrent requesters for
/// the same cold key wait for it and share its outcome. Failures are handed
/// to the waiters but never stored, so a later retry recomputes.
///
/// Disk problems never fail a request: they are logged and the cache keeps
/// working from memory.
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::disk::DiskTier;
use super::memory::LruCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::imaging::buffer::PixelBuffer;
use crate::imaging::crop::crop;
use crate::imaging::loader::ImageDecoder;
use crate::state::data::{BoundingBox, CropVariant, Detection};
use crate::state::resolver::PathResolver;

/// Identity of one cached crop.
///
/// The box coordinates ride along with the id so that a re-annotated
/// dataset reusing ids never serves crops of the old boxes from disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub image_ref: String,
    pub box_id: String,
    pub bbox: BoundingBox,
    pub variant: CropVariant,
}

impl CacheKey {
    pub fn new(detection: &Detection, variant: CropVariant) -> Self {
        Self {
            image_ref: detection.image_ref.clone(),
            box_id: detection.id.clone(),
            bbox: detection.bbox,
            variant,
        }
    }

    /// Unambiguous text form, hashed for the disk file name.
    pub fn canonical(&self) -> String {
        let [x1, y1, x2, y2] = self.bbox.xyxy();
        format!(
            "{}\u{1f}{}\u{1f}{},{},{},{}\u{1f}{}",
            self.image_ref,
            self.box_id,
            x1,
            y1,
            x2,
            y2,
            self.variant.tag()
        )
    }
}

/// Tier-1 value.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub buffer: Arc<PixelBuffer>,
    pub size_bytes: usize,
    /// Whether tier 2 already holds this crop.
    pub flushed: bool,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub computations: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

type Outcome = Result<Arc<PixelBuffer>>;

/// A computation other requesters can wait on.
struct InFlight {
    result: Mutex<Option<Outcome>>,
    cv: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn set(&self, outcome: Outcome) {
        *self.result.lock() = Some(outcome);
        self.cv.notify_all();
    }

    fn wait(&self) -> Outcome {
        let mut guard = self.result.lock();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            self.cv.wait(&mut guard);
        }
    }
}

/// Held by the requester computing a key. Dropping it unfinished, as when
/// the computation panics, hands waiters an error instead of leaving them
/// blocked. Either way the key leaves the in-flight map.
struct Leader<'a> {
    cache: &'a ThumbnailCache,
    key: &'a CacheKey,
    flight: Arc<InFlight>,
    finished: bool,
}

impl Leader<'_> {
    fn finish(mut self, outcome: Outcome) -> Outcome {
        self.flight.set(outcome.clone());
        self.finished = true;
        outcome
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Crop computation for {} did not complete", self.key.box_id);
            let reason = format!("crop of {} panicked", self.key.box_id);
            self.flight.set(Err(Error::Task(reason)));
        }
        self.cache.in_flight.lock().remove(self.key);
    }
}

pub struct ThumbnailCache {
    memory: Mutex<LruCache<CacheKey, CacheEntry>>,
    disk: Option<DiskTier>,
    in_flight: Mutex<HashMap<CacheKey, Arc<InFlight>>>,
    resolver: PathResolver,
    decoder: ImageDecoder,
    counters: Counters,
}

impl ThumbnailCache {
    /// Cache with the standard decoder chain, configured from `config`.
    ///
    /// A missing data root means the current directory.
    pub fn new(config: &Config) -> Self {
        Self::with_decoder(config, ImageDecoder::new())
    }

    pub fn with_decoder(config: &Config, decoder: ImageDecoder) -> Self {
        let data_root = config
            .data_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let resolver = PathResolver::with_limits(data_root, config.walk_limits());
        Self::from_parts(
            resolver,
            decoder,
            config.memory_capacity,
            config.cache_dir.as_deref(),
        )
    }

    /// Assemble a cache from its collaborators. An unusable `cache_dir`
    /// leaves the cache memory-only.
    pub fn from_parts(
        resolver: PathResolver,
        decoder: ImageDecoder,
        memory_capacity: usize,
        cache_dir: Option<&Path>,
    ) -> Self {
        let disk = cache_dir.and_then(|dir| match DiskTier::open(dir) {
            Ok(tier) => Some(tier),
            Err(e) => {
                warn!("Disk cache disabled: {}", e);
                None
            }
        });

        Self {
            memory: Mutex::new(LruCache::new(memory_capacity)),
            disk,
            in_flight: Mutex::new(HashMap::new()),
            resolver,
            decoder,
            counters: Counters::default(),
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Tier-2 directory, if the disk tier is active.
    pub fn disk_dir(&self) -> Option<&Path> {
        self.disk.as_ref().map(DiskTier::dir)
    }

    /// Forward a data root change to the resolver. Cached crops stay valid.
    pub fn set_data_root(&self, data_root: impl Into<PathBuf>) {
        self.resolver.set_data_root(data_root);
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().len()
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory.lock().values().map(|e| e.size_bytes).sum()
    }

    pub fn memory_capacity(&self) -> usize {
        self.memory.lock().capacity()
    }

    /// Drop every tier-1 entry. Tier 2 keeps its files; crops that never
    /// made it to disk are written first.
    pub fn clear_memory(&self) {
        let drained = self.memory.lock().drain();
        for (_, entry) in drained {
            self.flush_if_needed(&entry);
        }
    }

    /// Crop for `detection` in `variant`, from cache or freshly computed.
    pub fn resolve_and_crop(&self, detection: &Detection, variant: CropVariant) -> Outcome {
        let key = CacheKey::new(detection, variant);
        if let Some(buffer) = self.memory_get(&key) {
            return Ok(buffer);
        }

        let (flight, is_leader) = self.join_in_flight(&key);
        if !is_leader {
            debug!("Waiting on in-flight crop {}", key.box_id);
            return flight.wait();
        }

        let leader = Leader {
            cache: self,
            key: &key,
            flight,
            finished: false,
        };
        leader.finish(self.load_or_compute(&key, detection))
    }

    /// [`resolve_and_crop`](Self::resolve_and_crop) on tokio's blocking pool.
    pub async fn resolve_and_crop_async(
        self: &Arc<Self>,
        detection: Detection,
        variant: CropVariant,
    ) -> Outcome {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.resolve_and_crop(&detection, variant))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    fn memory_get(&self, key: &CacheKey) -> Option<Arc<PixelBuffer>> {
        let buffer = self.memory.lock().get(key).map(|e| Arc::clone(&e.buffer))?;
        Counters::bump(&self.counters.memory_hits, 1);
        debug!("Memory hit for {}", key.box_id);
        Some(buffer)
    }

    fn join_in_flight(&self, key: &CacheKey) -> (Arc<InFlight>, bool) {
        let mut map = self.in_flight.lock();
        if let Some(existing) = map.get(key) {
            return (Arc::clone(existing), false);
        }
        let flight = Arc::new(InFlight::new());
        map.insert(key.clone(), Arc::clone(&flight));
        (flight, true)
    }

    fn load_or_compute(&self, key: &CacheKey, detection: &Detection) -> Outcome {
        // A computation for this key may have finished since our first look.
        if let Some(buffer) = self.memory_get(key) {
            return Ok(buffer);
        }

        let canonical = key.canonical();
        let edge = key.variant.spec().output_size;
        if let Some(disk) = &self.disk {
            match disk.read(&canonical, edge) {
                Ok(Some(buffer)) => {
                    Counters::bump(&self.counters.disk_hits, 1);
                    debug!("Disk hit for {}", key.box_id);
                    let buffer = Arc::new(buffer);
                    self.insert(key.clone(), Arc::clone(&buffer), true);
                    return Ok(buffer);
                }
                Ok(None) => {}
                Err(e) => warn!("Disk cache read failed: {}", e),
            }
        }

        Counters::bump(&self.counters.misses, 1);
        let path = self.resolver.resolve(&detection.image_ref)?;
        let source = self.decoder.decode(&path)?;
        Counters::bump(&self.counters.computations, 1);
        let buffer = Arc::new(crop(&source, &detection.bbox, &key.variant.spec()));

        let flushed = match &self.disk {
            Some(disk) => match disk.write(&canonical, &buffer) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Disk cache write failed: {}", e);
                    false
                }
            },
            None => false,
        };
        self.insert(key.clone(), Arc::clone(&buffer), flushed);
        Ok(buffer)
    }

    fn insert(&self, key: CacheKey, buffer: Arc<PixelBuffer>, flushed: bool) {
        let entry = CacheEntry {
            key: key.clone(),
            size_bytes: buffer.size_bytes(),
            buffer,
            flushed,
        };
        let evicted = self.memory.lock().put(key, entry);
        Counters::bump(&self.counters.evictions, evicted.len() as u64);
        for (_, entry) in evicted {
            debug!("Evicted {} from memory", entry.key.box_id);
            self.flush_if_needed(&entry);
        }
    }

    fn flush_if_needed(&self, entry: &CacheEntry) {
        if entry.flushed {
            return;
        }
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.write(&entry.key.canonical(), &entry.buffer) {
                warn!("Dropping unflushed crop {}: {}", entry.key.box_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::buffer::{RawRaster, Samples};
    use crate::imaging::loader::{Decoder, StillImageDecoder};
    use image::{GrayImage, Luma};
    use std::sync::atomic::AtomicUsize;

    /// Delegates to the real decoder and counts calls.
    struct Counting(Arc<AtomicUsize>);

    impl Decoder for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn decode(&self, path: &Path) -> std::result::Result<RawRaster, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            StillImageDecoder.decode(path)
        }
    }

    /// Always yields a 16×16 gray raster, slowly.
    struct Slow(Arc<AtomicUsize>);

    impl Decoder for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn decode(&self, _path: &Path) -> std::result::Result<RawRaster, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(100));
            Ok(RawRaster::new(vec![16, 16], Samples::U8(vec![90; 256])))
        }
    }

    /// Panics on its first call, then yields a 16×16 gray raster.
    struct PanicsOnce {
        calls: Arc<AtomicUsize>,
        delay: std::time::Duration,
    }

    impl Decoder for PanicsOnce {
        fn name(&self) -> &'static str {
            "panics-once"
        }

        fn decode(&self, _path: &Path) -> std::result::Result<RawRaster, String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if call == 0 {
                panic!("decoder blew up");
            }
            Ok(RawRaster::new(vec![16, 16], Samples::U8(vec![90; 256])))
        }
    }

    fn panicking_cache(f: &Fixture, delay_ms: u64) -> (Arc<ThumbnailCache>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let decoder = PanicsOnce {
            calls: Arc::clone(&calls),
            delay: std::time::Duration::from_millis(delay_ms),
        };
        let cache = ThumbnailCache::from_parts(
            PathResolver::new(&f.root),
            ImageDecoder::with_decoders(vec![Box::new(decoder)]),
            8,
            None,
        );
        (Arc::new(cache), calls)
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        cache_dir: PathBuf,
        calls: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(root.join("images")).unwrap();
        GrayImage::from_pixel(40, 40, Luma([180]))
            .save(root.join("images").join("a.png"))
            .unwrap();
        Fixture {
            cache_dir: dir.path().join("crops"),
            root,
            _dir: dir,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn cache(f: &Fixture, capacity: usize, with_disk: bool) -> ThumbnailCache {
        let decoder = ImageDecoder::with_decoders(vec![Box::new(Counting(Arc::clone(&f.calls)))]);
        ThumbnailCache::from_parts(
            PathResolver::new(&f.root),
            decoder,
            capacity,
            with_disk.then_some(f.cache_dir.as_path()),
        )
    }

    fn detection(index: usize, image_ref: &str) -> Detection {
        let i = index as i64;
        Detection {
            id: format!("a.png_{}", index),
            image_ref: image_ref.to_string(),
            bbox: BoundingBox::new(i, i, i + 10, i + 10).unwrap(),
            confidence: 0.9,
            cell_id: format!("cell_{}", index + 1),
        }
    }

    const THUMB: CropVariant = CropVariant::Thumbnail { size: 16 };

    #[test]
    fn test_second_request_is_a_memory_hit_without_decode() {
        let f = fixture();
        let cache = cache(&f, 8, true);
        let d = detection(0, "./old/a.png");

        let first = cache.resolve_and_crop(&d, THUMB).unwrap();
        let second = cache.resolve_and_crop(&d, THUMB).unwrap();

        assert_eq!(first, second);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.memory_hits, stats.computations, stats.misses), (1, 1, 1));
    }

    #[test]
    fn test_variants_are_separate_entries() {
        let f = fixture();
        let cache = cache(&f, 8, false);
        let d = detection(0, "a.png");
        let view = CropVariant::Viewfinder {
            padding_ratio: 1.0,
            size: 32,
        };

        let thumb = cache.resolve_and_crop(&d, THUMB).unwrap();
        let large = cache.resolve_and_crop(&d, view).unwrap();
        assert_eq!(thumb.width(), 16);
        assert_eq!(large.width(), 32);
        assert_eq!(cache.memory_len(), 2);
        assert_eq!(cache.memory_bytes(), 16 * 16 * 3 + 32 * 32 * 3);
    }

    #[test]
    fn test_disk_tier_survives_memory_reset() {
        let f = fixture();
        let cache = cache(&f, 8, true);
        let d = detection(0, "a.png");

        let computed = cache.resolve_and_crop(&d, THUMB).unwrap();
        cache.clear_memory();
        assert_eq!(cache.memory_len(), 0);

        let reloaded = cache.resolve_and_crop(&d, THUMB).unwrap();
        assert_eq!(computed, reloaded);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().disk_hits, 1);
        assert_eq!(cache.memory_len(), 1);
    }

    #[test]
    fn test_eviction_keeps_disk_copy() {
        let f = fixture();
        let cache = cache(&f, 2, true);
        for i in 0..3 {
            cache.resolve_and_crop(&detection(i, "a.png"), THUMB).unwrap();
        }
        assert_eq!(cache.memory_len(), 2);
        assert_eq!(cache.stats().evictions, 1);

        cache.resolve_and_crop(&detection(0, "a.png"), THUMB).unwrap();
        assert_eq!(cache.stats().disk_hits, 1);
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let f = fixture();
        let cache = cache(&f, 8, true);
        let d = detection(0, "b.png");

        let err = cache.resolve_and_crop(&d, THUMB).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(cache.memory_len(), 0);

        GrayImage::from_pixel(40, 40, Luma([10]))
            .save(f.root.join("b.png"))
            .unwrap();
        assert!(cache.resolve_and_crop(&d, THUMB).is_ok());
    }

    #[test]
    fn test_unusable_cache_dir_degrades_to_memory_only() {
        let f = fixture();
        let blocker = f.root.join("images").join("a.png");
        let decoder = ImageDecoder::with_decoders(vec![Box::new(Counting(Arc::clone(&f.calls)))]);
        let cache = ThumbnailCache::from_parts(
            PathResolver::new(&f.root),
            decoder,
            4,
            Some(blocker.as_path()),
        );
        assert!(cache.disk_dir().is_none());
        assert!(cache.resolve_and_crop(&detection(0, "a.png"), THUMB).is_ok());
    }

    #[test]
    fn test_concurrent_requests_for_one_key_compute_once() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ThumbnailCache::from_parts(
            PathResolver::new(&f.root),
            ImageDecoder::with_decoders(vec![Box::new(Slow(Arc::clone(&calls)))]),
            8,
            None,
        ));
        let d = detection(0, "a.png");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let d = d.clone();
                std::thread::spawn(move || cache.resolve_and_crop(&d, THUMB).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.stats().computations, 1);
    }

    #[test]
    fn test_panicking_computation_does_not_wedge_the_key() {
        let f = fixture();
        let (cache, calls) = panicking_cache(&f, 0);
        let d = detection(0, "a.png");

        let first = {
            let cache = Arc::clone(&cache);
            let d = d.clone();
            std::thread::spawn(move || cache.resolve_and_crop(&d, THUMB))
        };
        assert!(first.join().is_err());
        assert!(cache.in_flight.lock().is_empty());

        let (tx, rx) = std::sync::mpsc::channel();
        {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let _ = tx.send(cache.resolve_and_crop(&d, THUMB));
            });
        }
        let retried = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(retried.unwrap().width(), 16);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_waiters_get_an_error_when_the_leader_panics() {
        let f = fixture();
        let (cache, _) = panicking_cache(&f, 300);
        let d = detection(0, "a.png");

        let leader = {
            let cache = Arc::clone(&cache);
            let d = d.clone();
            std::thread::spawn(move || cache.resolve_and_crop(&d, THUMB))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));

        let (tx, rx) = std::sync::mpsc::channel();
        {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let _ = tx.send(cache.resolve_and_crop(&d, THUMB));
            });
        }
        let waited = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(matches!(waited, Err(Error::Task(_))));
        assert!(leader.join().is_err());
    }

    #[tokio::test]
    async fn test_async_bridge() {
        let f = fixture();
        let cache = Arc::new(cache(&f, 8, false));
        let buffer = cache
            .resolve_and_crop_async(detection(0, "a.png"), THUMB)
            .await
            .unwrap();
        assert_eq!((buffer.width(), buffer.height()), (16, 16));

        let err = cache
            .resolve_and_crop_async(detection(1, "missing.png"), THUMB)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_canonical_key_separates_fields() {
        let d = detection(0, "a.png");
        let key = CacheKey::new(&d, THUMB);
        assert_eq!(key.canonical(), "a.png\u{1f}a.png_0\u{1f}0,0,10,10\u{1f}thumb-16");
        let other = CacheKey::new(&d, CropVariant::Thumbnail { size: 17 });
        assert_ne!(key.canonical(), other.canonical());
    }
}

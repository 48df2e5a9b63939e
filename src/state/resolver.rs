/// Image path resolution
///
/// Datasets get moved around as a unit while the image files keep their
/// names, so a declared `image_path` often no longer points anywhere. The
/// resolver maps a declared reference to a real file under a caller-chosen
/// data root, in this order (first match wins):
///
/// 1. an absolute reference that exists
/// 2. the reference rebased onto the data root (leading `./` or `/` stripped)
/// 3. a basename match whose parent directory is named `images`
/// 4. any basename match under the data root
///
/// Steps 3 and 4 use a basename index built by one bounded directory walk on
/// the first miss and kept until the data root changes. Each root change
/// starts a new generation; an index or memoized path from an older
/// generation is never served, even when a resolve that began under the old
/// root finishes after the change.
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Preferred parent directory name for basename matches (case-insensitive).
const PREFERRED_DIR: &str = "images";

/// Last path segment of a declared reference.
///
/// Both separators are honoured so references written on another platform
/// still yield their file name.
pub fn basename(reference: &str) -> &str {
    reference
        .rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())
        .unwrap_or(reference)
}

/// Bounds for the basename index walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkLimits {
    pub max_depth: usize,
    pub max_entries: usize,
    pub timeout: Duration,
}

impl Default for WalkLimits {
    fn default() -> Self {
        Self {
            max_depth: 16,
            max_entries: 200_000,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Files under the data root grouped by file name, in walk order.
#[derive(Debug, Default)]
struct BasenameIndex {
    by_name: HashMap<String, Vec<PathBuf>>,
}

impl BasenameIndex {
    fn lookup(&self, name: &str) -> Option<PathBuf> {
        let candidates = self.by_name.get(name)?;
        let in_images_dir = |path: &&PathBuf| {
            path.parent()
                .and_then(Path::file_name)
                .is_some_and(|dir| dir.to_string_lossy().eq_ignore_ascii_case(PREFERRED_DIR))
        };

        candidates
            .iter()
            .filter(|path| path.is_file())
            .find(in_images_dir)
            .or_else(|| candidates.iter().find(|path| path.is_file()))
            .cloned()
    }
}

/// Resolves declared image references against a mutable data root.
#[derive(Debug)]
pub struct PathResolver {
    data_root: RwLock<PathBuf>,
    /// Bumped under the `data_root` write lock on every root change.
    generation: AtomicU64,
    index: Mutex<Option<(u64, Arc<BasenameIndex>)>>,
    /// Resolved paths keyed by basename, not by the full declared reference.
    resolved: Mutex<HashMap<String, (u64, PathBuf)>>,
    limits: WalkLimits,
    cancel: Arc<AtomicBool>,
    walks: AtomicUsize,
}

impl PathResolver {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self::with_limits(data_root, WalkLimits::default())
    }

    pub fn with_limits(data_root: impl Into<PathBuf>, limits: WalkLimits) -> Self {
        Self {
            data_root: RwLock::new(data_root.into()),
            generation: AtomicU64::new(0),
            index: Mutex::new(None),
            resolved: Mutex::new(HashMap::new()),
            limits,
            cancel: Arc::new(AtomicBool::new(false)),
            walks: AtomicUsize::new(0),
        }
    }

    pub fn data_root(&self) -> PathBuf {
        self.data_root.read().clone()
    }

    /// Point at a new data root. Drops the basename index and every memoized
    /// resolution, and clears a pending cancellation.
    pub fn set_data_root(&self, data_root: impl Into<PathBuf>) {
        let data_root = data_root.into();
        info!("Data root changed to {}", data_root.display());
        {
            let mut root = self.data_root.write();
            *root = data_root;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        *self.index.lock() = None;
        self.resolved.lock().clear();
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Shared flag that stops an in-progress index walk when set.
    ///
    /// A cancelled walk is not memoized; the flag stays set until the data
    /// root changes or the caller clears it.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Number of index walks started so far.
    pub fn index_walks(&self) -> usize {
        self.walks.load(Ordering::SeqCst)
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Root and generation read together.
    fn snapshot(&self) -> (PathBuf, u64) {
        let root = self.data_root.read();
        (root.clone(), self.current_generation())
    }

    /// Map a declared reference to an existing file.
    pub fn resolve(&self, image_ref: &str) -> Result<PathBuf> {
        let declared = Path::new(image_ref);
        if declared.is_absolute() && declared.is_file() {
            return Ok(declared.to_path_buf());
        }

        let (root, generation) = self.snapshot();
        let rebased = root.join(relative_part(declared));
        if rebased.is_file() {
            return Ok(rebased);
        }

        let name = basename(image_ref);
        if let Some((memo_generation, path)) = self.resolved.lock().get(name) {
            if *memo_generation == generation && path.is_file() {
                return Ok(path.clone());
            }
        }

        if let Some(path) = self.index_for(&root, generation).lookup(name) {
            debug!("Resolved {} via basename index to {}", image_ref, path.display());
            let mut resolved = self.resolved.lock();
            if self.current_generation() == generation {
                resolved.insert(name.to_string(), (generation, path.clone()));
            }
            return Ok(path);
        }

        Err(Error::ImageNotFound {
            reference: image_ref.to_string(),
            data_root: root,
        })
    }

    /// Index of `root` as of `generation`. Only memoized when the walk ran to
    /// a bound or to the end and the root did not change meanwhile.
    fn index_for(&self, root: &Path, generation: u64) -> Arc<BasenameIndex> {
        let mut slot = self.index.lock();
        if let Some((built_for, index)) = slot.as_ref() {
            if *built_for == generation {
                return Arc::clone(index);
            }
        }

        let (index, cancelled) = self.walk(root);
        let index = Arc::new(index);
        if cancelled {
            return index;
        }
        if self.current_generation() == generation {
            *slot = Some((generation, Arc::clone(&index)));
        } else {
            debug!("Data root changed during walk of {}, not keeping it", root.display());
        }
        index
    }

    fn walk(&self, root: &Path) -> (BasenameIndex, bool) {
        self.walks.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let mut index = BasenameIndex::default();
        let mut files = 0usize;
        let mut visited = 0usize;
        let mut cancelled = false;

        let walker = WalkDir::new(root)
            .max_depth(self.limits.max_depth)
            .follow_links(true)
            .sort_by_file_name();

        for entry in walker {
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            if started.elapsed() > self.limits.timeout {
                warn!(
                    "Index walk of {} stopped after {:?} ({} files)",
                    root.display(),
                    self.limits.timeout,
                    files
                );
                break;
            }
            visited += 1;
            if visited > self.limits.max_entries {
                warn!(
                    "Index walk of {} stopped at {} entries",
                    root.display(),
                    self.limits.max_entries
                );
                break;
            }

            let Ok(entry) = entry else {
                continue;
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            index.by_name.entry(name).or_default().push(entry.into_path());
            files += 1;
        }

        if cancelled {
            info!("Index walk of {} cancelled", root.display());
        } else {
            info!(
                "Indexed {} files under {} in {:?}",
                files,
                root.display(),
                started.elapsed()
            );
        }
        (index, cancelled)
    }
}

/// Components of a reference that can be re-rooted. Only plain names are
/// kept, so the result never climbs out of the data root.
fn relative_part(declared: &Path) -> PathBuf {
    declared
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use cell_verifier::color::to_display_rgb8;
use cell_verifier::config::{default_config_path, Config};
use cell_verifier::logging::setup_logging;
use cell_verifier::state::dataset;
use cell_verifier::{
    CacheStats, CropVariant, DatasetEntry, Detection, ImageDecoder, PathResolver, ThumbnailCache,
};

#[derive(Parser)]
#[command(name = "cell-verifier")]
#[command(about = "Inspect detection datasets and export cell crops")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write rotating log files to this directory instead of stderr only
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Count entries, boxes and detections, and report unresolvable images
    Summary {
        #[arg(value_name = "DATASET")]
        dataset: PathBuf,

        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long, value_name = "DIR")]
        data_root: Option<PathBuf>,
    },
    /// Crop every detection and write PNGs plus a manifest
    Export {
        #[arg(value_name = "DATASET")]
        dataset: PathBuf,

        #[arg(long, value_name = "DIR")]
        out: PathBuf,

        #[arg(long, value_enum, default_value_t = VariantArg::Thumbnail)]
        variant: VariantArg,

        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long, value_name = "DIR")]
        data_root: Option<PathBuf>,

        /// Crops computed concurrently
        #[arg(long, default_value_t = 4)]
        jobs: usize,
    },
    /// Rewrite image paths to files found under the data root
    Relink {
        #[arg(value_name = "DATASET")]
        dataset: PathBuf,

        #[arg(long, value_name = "FILE")]
        out: PathBuf,

        #[arg(long, value_name = "DIR")]
        data_root: Option<PathBuf>,
    },
    /// Convert every .tif in a directory to a sibling 8-bit .png
    Convert {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum VariantArg {
    Thumbnail,
    Viewfinder,
}

#[derive(Serialize)]
struct ExportedCrop {
    id: String,
    image_ref: String,
    cell_id: String,
    bbox: [i64; 4],
    confidence: f64,
    file: String,
}

#[derive(Serialize)]
struct ExportFailure {
    id: String,
    image_ref: String,
    error: String,
}

#[derive(Serialize)]
struct ExportManifest {
    exported_at: String,
    dataset: PathBuf,
    data_root: PathBuf,
    variant: String,
    confidence_threshold: f64,
    crops: Vec<ExportedCrop>,
    failures: Vec<ExportFailure>,
    stats: CacheStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let _logger =
        setup_logging(level, args.log_dir.as_deref()).context("Logger initialization failed")?;

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Summary {
            dataset,
            threshold,
            data_root,
        } => summary(&config, &dataset, threshold, data_root),
        Command::Export {
            dataset,
            out,
            variant,
            threshold,
            data_root,
            jobs,
        } => export(&config, &dataset, &out, variant, threshold, data_root, jobs).await,
        Command::Relink {
            dataset,
            out,
            data_root,
        } => relink(&config, &dataset, &out, data_root),
        Command::Convert { dir } => convert(&dir),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) => path,
            None => return Ok(Config::default()),
        },
    };
    let config = Config::load(&path)?;
    info!("Using configuration from {}", path.display());
    Ok(config)
}

/// Command line beats config; without either, the dataset's own directory.
fn pick_data_root(config: &Config, dataset: &Path, flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| config.data_root.clone()).unwrap_or_else(|| {
        dataset
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

fn load_detections(
    dataset: &Path,
    threshold: f64,
) -> anyhow::Result<(Vec<DatasetEntry>, Vec<Detection>)> {
    let entries = dataset::load(dataset)?;
    let mut detections = dataset::flatten(&entries, threshold);
    dataset::sort_by_confidence(&mut detections);
    Ok((entries, detections))
}

fn summary(
    config: &Config,
    dataset: &Path,
    threshold: Option<f64>,
    data_root: Option<PathBuf>,
) -> anyhow::Result<()> {
    let threshold = threshold.unwrap_or(config.confidence_threshold);
    let (entries, detections) = load_detections(dataset, threshold)?;
    let root = pick_data_root(config, dataset, data_root);
    let resolver = PathResolver::with_limits(&root, config.walk_limits());

    let unresolved: BTreeSet<&str> = entries
        .iter()
        .map(|e| e.image_path.as_str())
        .filter(|image_ref| resolver.resolve(image_ref).is_err())
        .collect();

    println!("Dataset:     {}", dataset.display());
    println!("Data root:   {}", root.display());
    println!("Entries:     {}", entries.len());
    println!("Raw boxes:   {}", entries.iter().map(|e| e.boxes.len()).sum::<usize>());
    println!("Detections:  {} (confidence >= {})", detections.len(), threshold);
    println!("Unresolved:  {}", unresolved.len());
    for image_ref in unresolved {
        println!("  {}", image_ref);
    }
    Ok(())
}

async fn export(
    config: &Config,
    dataset: &Path,
    out: &Path,
    variant: VariantArg,
    threshold: Option<f64>,
    data_root: Option<PathBuf>,
    jobs: usize,
) -> anyhow::Result<()> {
    let threshold = threshold.unwrap_or(config.confidence_threshold);
    let (_, detections) = load_detections(dataset, threshold)?;
    let root = pick_data_root(config, dataset, data_root);

    std::fs::create_dir_all(out).with_context(|| format!("cannot create {}", out.display()))?;

    let config = Config {
        data_root: Some(root.clone()),
        ..config.clone()
    };
    let variant: CropVariant = match variant {
        VariantArg::Thumbnail => config.variant_thumbnail(),
        VariantArg::Viewfinder => config.variant_viewfinder(),
    };
    let cache = Arc::new(ThumbnailCache::new(&config));
    info!(
        "Exporting {} detections as {} with {} jobs",
        detections.len(),
        variant.tag(),
        jobs.max(1)
    );

    let mut crops = Vec::new();
    let mut failures = Vec::new();
    let mut pending = detections.into_iter().enumerate();
    let mut running = JoinSet::new();

    loop {
        while running.len() < jobs.max(1) {
            let Some((position, detection)) = pending.next() else {
                break;
            };
            let cache = Arc::clone(&cache);
            running.spawn(async move {
                let outcome = cache.resolve_and_crop_async(detection.clone(), variant).await;
                (position, detection, outcome)
            });
        }

        let Some(joined) = running.join_next().await else {
            break;
        };
        let (position, detection, outcome) = joined.context("export task panicked")?;

        let saved = outcome.map_err(anyhow::Error::from).and_then(|buffer| {
            let file = format!("{}.png", detection.id);
            to_display_rgb8(&buffer)
                .save(out.join(&file))
                .with_context(|| format!("cannot write {}", file))?;
            Ok(file)
        });

        match saved {
            Ok(file) => crops.push((
                position,
                ExportedCrop {
                    id: detection.id,
                    image_ref: detection.image_ref,
                    cell_id: detection.cell_id,
                    bbox: detection.bbox.xyxy(),
                    confidence: detection.confidence,
                    file,
                },
            )),
            Err(e) => {
                warn!("{}: {:#}", detection.id, e);
                failures.push((
                    position,
                    ExportFailure {
                        id: detection.id,
                        image_ref: detection.image_ref,
                        error: format!("{:#}", e),
                    },
                ));
            }
        }
    }

    // Completion order varies with --jobs; the manifest keeps grid order.
    crops.sort_by_key(|(position, _)| *position);
    failures.sort_by_key(|(position, _)| *position);

    let manifest = ExportManifest {
        exported_at: Utc::now().to_rfc3339(),
        dataset: dataset.to_path_buf(),
        data_root: root,
        variant: variant.tag(),
        confidence_threshold: threshold,
        stats: cache.stats(),
        crops: crops.into_iter().map(|(_, crop)| crop).collect(),
        failures: failures.into_iter().map(|(_, failure)| failure).collect(),
    };
    let manifest_path = out.join("manifest.json");
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("cannot write {}", manifest_path.display()))?;

    println!(
        "Exported {} crops to {} ({} failed)",
        manifest.crops.len(),
        out.display(),
        manifest.failures.len()
    );
    Ok(())
}

fn relink(
    config: &Config,
    dataset: &Path,
    out: &Path,
    data_root: Option<PathBuf>,
) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(dataset).with_context(|| format!("cannot read {}", dataset.display()))?;
    let root = pick_data_root(config, dataset, data_root);
    let resolver = PathResolver::with_limits(&root, config.walk_limits());

    let (entries, report) = dataset::relink(&bytes, &resolver)?;
    std::fs::write(out, serde_json::to_string_pretty(&entries)?)
        .with_context(|| format!("cannot write {}", out.display()))?;

    println!(
        "Relinked {}: kept {} of {}, dropped {}",
        dataset.display(),
        report.kept,
        report.total,
        report.dropped.len()
    );
    for image_ref in &report.dropped {
        println!("  dropped {}", image_ref);
    }
    Ok(())
}

fn convert(dir: &Path) -> anyhow::Result<()> {
    let decoder = ImageDecoder::new();
    let (mut total, mut converted, mut skipped, mut failed) = (0, 0, 0, 0);

    for entry in WalkDir::new(dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let is_tiff = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| ext == "tif" || ext == "tiff");
        if !is_tiff {
            continue;
        }

        total += 1;
        let png = path.with_extension("png");
        if png.exists() {
            skipped += 1;
            continue;
        }

        let written = decoder
            .decode(path)
            .map_err(anyhow::Error::from)
            .and_then(|buffer| Ok(to_display_rgb8(&buffer).save(&png)?));
        match written {
            Ok(()) => {
                println!("Wrote {}", png.display());
                converted += 1;
            }
            Err(e) => {
                warn!("Failed to convert {}: {:#}", path.display(), e);
                failed += 1;
            }
        }
    }

    println!(
        "Done. total={}, converted={}, already_png={}, failed={}",
        total, converted, skipped, failed
    );
    Ok(())
}

/// Dataset loading
///
/// A dataset file is a JSON list. Each element names an image and carries its
/// boxes in one of two schemas:
///
/// - `detections: [{bbox: [x1, y1, x2, y2], confidence, cell_id}]`
/// - parallel `pred_boxes: [[x1, y1, x2, y2], ...]` and `pred_scores: [...]`
///
/// Parsing keeps raw entries; [`flatten`] turns them into [`Detection`]s for a
/// given confidence threshold. Changing the threshold means flattening again.
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use super::data::{BoundingBox, DatasetEntry, Detection, RawBox};
use super::resolver::{basename, PathResolver};
use crate::error::{Error, Result};

#[derive(Deserialize)]
struct EntryRecord {
    image_path: Option<String>,
    #[serde(default)]
    detections: Option<Vec<DetectionRecord>>,
    #[serde(default)]
    pred_boxes: Option<Vec<[f64; 4]>>,
    #[serde(default)]
    pred_scores: Option<Vec<f64>>,
}

#[derive(Deserialize)]
struct DetectionRecord {
    bbox: [f64; 4],
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    cell_id: Option<String>,
}

impl EntryRecord {
    fn into_entry(self, position: usize) -> Result<DatasetEntry> {
        let image_path = self
            .image_path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::Schema(format!("entry {} has no image_path", position)))?;

        // The structured list wins when a file carries both schemas. Unlabeled
        // structured boxes are `cell_<i>` from 0; parallel arrays are
        // `sperm_<i>` from 1.
        let boxes = match self.detections {
            Some(detections) => detections
                .into_iter()
                .enumerate()
                .map(|(i, d)| RawBox {
                    coords: d.bbox,
                    confidence: d.confidence,
                    cell_id: d.cell_id.unwrap_or_else(|| format!("cell_{}", i)),
                })
                .collect(),
            None => {
                let boxes = self.pred_boxes.unwrap_or_default();
                let scores = self.pred_scores.unwrap_or_default();
                if boxes.len() != scores.len() {
                    warn!(
                        "Entry {} ({}): {} boxes vs {} scores, keeping {}",
                        position,
                        image_path,
                        boxes.len(),
                        scores.len(),
                        boxes.len().min(scores.len())
                    );
                }
                boxes
                    .into_iter()
                    .zip(scores)
                    .enumerate()
                    .map(|(i, (coords, confidence))| RawBox {
                        coords,
                        confidence,
                        cell_id: format!("sperm_{}", i + 1),
                    })
                    .collect()
            }
        };

        Ok(DatasetEntry { image_path, boxes })
    }
}

/// Parse a dataset file's bytes into raw entries, in file order.
///
/// Fails with [`Error::Schema`] when the top-level value is not a list or an
/// entry lacks `image_path`.
pub fn parse(bytes: &[u8]) -> Result<Vec<DatasetEntry>> {
    let root: Value =
        serde_json::from_slice(bytes).map_err(|e| Error::Schema(format!("invalid JSON: {}", e)))?;

    let Value::Array(items) = root else {
        return Err(Error::Schema("top-level value must be a list".to_string()));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(position, item)| {
            let record: EntryRecord = serde_json::from_value(item)
                .map_err(|e| Error::Schema(format!("entry {}: {}", position, e)))?;
            record.into_entry(position)
        })
        .collect()
}

/// Read and parse a dataset file.
pub fn load(path: &Path) -> Result<Vec<DatasetEntry>> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Schema(format!("cannot read {}: {}", path.display(), e)))?;
    let entries = parse(&bytes)?;
    info!(
        "Loaded {} entries ({} raw boxes) from {}",
        entries.len(),
        entries.iter().map(|e| e.boxes.len()).sum::<usize>(),
        path.display()
    );
    Ok(entries)
}

/// Flatten raw entries into detections at or above `confidence_threshold`.
///
/// Order is stable: entries in file order, boxes within an entry in file
/// order. The index in a detection id counts every raw box seen for that
/// basename, so ids do not shift when the threshold changes and stay unique
/// when several entries share a basename. Degenerate boxes and scores outside
/// `[0, 1]` are skipped with a warning.
pub fn flatten(entries: &[DatasetEntry], confidence_threshold: f64) -> Vec<Detection> {
    let mut next_index: HashMap<&str, usize> = HashMap::new();
    let mut detections = Vec::new();

    for entry in entries {
        let name = basename(&entry.image_path);
        let counter = next_index.entry(name).or_insert(0);

        for raw in &entry.boxes {
            let index = *counter;
            *counter += 1;

            let bbox = match BoundingBox::from_coords(raw.coords) {
                Ok(bbox) => bbox,
                Err(e) => {
                    warn!("Skipping box {} of {}: {}", index, entry.image_path, e);
                    continue;
                }
            };
            if !(0.0..=1.0).contains(&raw.confidence) {
                warn!(
                    "Skipping box {} of {}: confidence {} outside [0, 1]",
                    index, entry.image_path, raw.confidence
                );
                continue;
            }
            if raw.confidence < confidence_threshold {
                continue;
            }

            detections.push(Detection {
                id: format!("{}_{}", name, index),
                image_ref: entry.image_path.clone(),
                bbox,
                confidence: raw.confidence,
                cell_id: raw.cell_id.clone(),
            });
        }
    }

    detections
}

/// Sort highest confidence first. Ties keep flattening order.
pub fn sort_by_confidence(detections: &mut [Detection]) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

/// Outcome of [`relink`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelinkReport {
    pub total: usize,
    pub kept: usize,
    /// Declared references that could not be resolved (entries dropped).
    pub dropped: Vec<String>,
}

/// Rewrite every entry's `image_path` to the file it resolves to under the
/// resolver's data root, dropping entries that resolve to nothing.
///
/// All other fields of an entry are preserved untouched.
pub fn relink(bytes: &[u8], resolver: &PathResolver) -> Result<(Vec<Value>, RelinkReport)> {
    let root: Value =
        serde_json::from_slice(bytes).map_err(|e| Error::Schema(format!("invalid JSON: {}", e)))?;
    let Value::Array(items) = root else {
        return Err(Error::Schema("top-level value must be a list".to_string()));
    };

    let mut report = RelinkReport {
        total: items.len(),
        ..RelinkReport::default()
    };
    let mut kept = Vec::with_capacity(items.len());

    for mut item in items {
        let declared = item
            .get("image_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(declared) = declared else {
            report.dropped.push(String::new());
            continue;
        };

        match resolver.resolve(&declared) {
            Ok(path) => {
                let absolute = std::fs::canonicalize(&path).unwrap_or(path);
                if let Some(object) = item.as_object_mut() {
                    object.insert(
                        "image_path".to_string(),
                        Value::String(absolute.to_string_lossy().to_string()),
                    );
                }
                kept.push(item);
            }
            Err(e) => {
                warn!("Dropping entry: {}", e);
                report.dropped.push(declared);
            }
        }
    }

    report.kept = kept.len();
    Ok((kept, report))
}

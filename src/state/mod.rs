/// Dataset state
///
/// This module handles everything known about a loaded dataset:
/// - Detection value objects and crop variants (data.rs)
/// - Parsing, flattening and relinking dataset files (dataset.rs)
/// - Resolving declared image paths under a data root (resolver.rs)

pub mod data;
pub mod dataset;
pub mod resolver;

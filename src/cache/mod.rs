/// Crop caching
///
/// This module handles:
/// - The bounded in-memory LRU (memory.rs)
/// - The persistent PNG store keyed by key hash (disk.rs)
/// - Orchestrating both tiers around resolve → decode → crop (thumbnail.rs)

pub mod disk;
pub mod memory;
pub mod thumbnail;

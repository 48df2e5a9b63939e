pub mod buffer;
pub mod crop;
pub mod loader;

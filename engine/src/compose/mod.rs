//! Compose document model and the pure deployment transform

pub mod doc;
pub mod transform;

pub use doc::ComposeDocument;
pub use transform::transform;

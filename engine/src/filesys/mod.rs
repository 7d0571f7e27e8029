//! Async filesystem wrappers used by the queue, storage layout and log store.

pub mod dir;
pub mod file;

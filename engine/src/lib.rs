//! Dockhand Engine Library
//!
//! Core modules for the dockhand deployment orchestration engine: a
//! queue-backed job processor that resolves sources, transforms compose
//! documents and drives Docker on local or remote hosts.

pub mod compose;
pub mod errors;
pub mod exec;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod store;
pub mod utils;
pub mod version;

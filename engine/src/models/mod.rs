//! Core data models

pub mod job;
pub mod resource;
pub mod server;

//! Job log/status records and the resource store seam

pub mod logstore;
pub mod resources;

//! Command execution against local and remote Docker hosts

pub mod channel;
pub mod docker;
pub mod listing;

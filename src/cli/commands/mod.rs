//! CLI command implementations

pub mod layer;
pub mod setup;
pub mod status;

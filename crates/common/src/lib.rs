//! Shared error scaffolding and utilities used across all quarry crates.

pub mod error;
pub mod hash;
pub mod ids;
pub mod logging;

pub use error::FromMessage;

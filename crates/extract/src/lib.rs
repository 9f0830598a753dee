//! Chain resolution and the category-aware fallback executor.

pub mod executor;
pub mod resolver;

pub use {
    executor::{FallbackExecutor, FallbackResult},
    resolver::ConfigResolver,
};

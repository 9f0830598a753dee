//! LLM provider access: capability/price registry, error classification,
//! and the single-attempt extraction client.

pub mod classify;
pub mod extractor;
pub mod registry;
pub mod types;

pub use {
    classify::{ErrorCategory, classify},
    extractor::{Extractor, HttpExtractor},
    registry::{ModelPrice, ProviderInfo, ProviderRegistry},
    types::{AttemptConfig, ExtractFailure, ExtractRequest, Extraction},
};

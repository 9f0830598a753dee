//! Service configuration: environment variables, tier limits, and the
//! remote JSON overlay (blocklist, log filters, model defaults, tier
//! settings) fetched from a bucket on a TTL.

pub mod env;
pub mod error;
pub mod remote;
pub mod tiers;

pub use {
    env::ServiceConfig,
    error::{Error, Result},
    remote::{ModelDefaults, RemoteConfig},
    tiers::{TierLimits, TierOverride, TierTable},
};

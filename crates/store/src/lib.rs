//! Persistent state: jobs, per-page results, fallback chains, provider
//! keys, webhooks, deliveries, and key-suspension records.
//!
//! Every consumer talks to the trait objects in [`traits`]; the SQLite
//! implementation backs production and the in-memory one backs tests.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use {
    error::{Error, Result},
    memory::InMemoryStore,
    sqlite::SqliteStore,
    traits::{AuthStore, ChainStore, JobStore, KeyStore, SuspensionStore, WebhookStore},
};

/// Run database migrations. Call once at startup before constructing
/// [`SqliteStore::with_pool`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}

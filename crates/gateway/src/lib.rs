//! HTTP surface: extraction endpoints, job queries with SSE streaming,
//! key/chain/webhook management, and admin routes.

pub mod auth;
pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use {
    error::{ApiError, ApiResult},
    server::{build_router, serve},
    state::AppState,
};

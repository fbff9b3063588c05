//! Shared application state.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use axum::extract::State;
use rdv_core::service::QueryService;

pub(crate) struct WebState {
    pub(crate) service: QueryService,
    /// Include database error text in error bodies.
    pub(crate) expose_db_errors: bool,
}

pub(crate) type SharedState = Arc<WebState>;
pub(crate) type AppState = State<SharedState>;

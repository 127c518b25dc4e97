//! designate-api: REST API for the allocation engine.
//!
//! Every request carries its own server snapshot; nothing is stored
//! between calls. Lookups for VMs the pipeline needs beyond that snapshot
//! are answered from the same snapshot.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/allocation` | Pick a server for one VM |
//! | POST | `/capacity` | Count free slots per (package, image) |
//! | GET | `/ping` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use designate_alloc::Allocator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub allocator: Arc<Allocator>,
}

/// Build the complete API router.
pub fn build_router(allocator: Arc<Allocator>) -> Router {
    Router::new()
        .route("/allocation", post(handlers::allocate))
        .route("/capacity", post(handlers::capacity))
        .route("/ping", get(handlers::ping))
        .with_state(ApiState { allocator })
}

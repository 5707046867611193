//! capstan-api — REST surface for the Capstan control plane.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/capsules` | Register a capsule |
//! | GET | `/api/v1/capsules` | List capsules |
//! | GET | `/api/v1/capsules/{capsule_id}` | Get a capsule |
//! | POST | `/api/v1/capsules/{capsule_id}/builds` | Register a build |
//! | POST | `/api/v1/capsules/{capsule_id}/rollouts` | Start a rollout |
//! | GET | `/api/v1/capsules/{capsule_id}/rollouts/{rollout_id}` | Get a rollout |
//! | POST | `/api/v1/capsules/{capsule_id}/rollouts/{rollout_id}/abort` | Abort a rollout |
//! | GET | `/api/v1/capsules/{capsule_id}/rollouts/{rollout_id}/events` | List rollout events |

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use capstan_engine::RolloutService;
use capstan_state::Store;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<RolloutService>,
    pub store: Store,
}

/// Build the complete API router.
pub fn build_router(service: Arc<RolloutService>, store: Store) -> Router {
    let state = ApiState { service, store };

    let api_routes = Router::new()
        .route(
            "/capsules",
            get(handlers::list_capsules).post(handlers::create_capsule),
        )
        .route("/capsules/{capsule_id}", get(handlers::get_capsule))
        .route(
            "/capsules/{capsule_id}/builds",
            post(handlers::register_build),
        )
        .route(
            "/capsules/{capsule_id}/rollouts",
            post(handlers::new_rollout),
        )
        .route(
            "/capsules/{capsule_id}/rollouts/{rollout_id}",
            get(handlers::get_rollout),
        )
        .route(
            "/capsules/{capsule_id}/rollouts/{rollout_id}/abort",
            post(handlers::abort_rollout),
        )
        .route(
            "/capsules/{capsule_id}/rollouts/{rollout_id}/events",
            get(handlers::list_events),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

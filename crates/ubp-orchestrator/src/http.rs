// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Admin REST API.
//!
//! Versioned under `/v1/`. Every endpoint except the health probe requires
//! the admin credential in the `X-Admin-Token` header, compared in
//! constant time.
//!
//! # Endpoints
//!
//! - `POST /v1/bots` - register a bot, returns the one-time token
//! - `GET /v1/bots`, `GET/PUT/DELETE /v1/bots/{bot_id}`
//! - `GET /v1/bots/{bot_id}/instances` - live instances
//! - `POST /v1/bots/{bot_id}/actions/{command_name}` - submit a task (202)
//! - `POST /v1/bots/{bot_id}/commands/{command_name}` - synchronous dispatch
//! - `GET /v1/tasks`, `GET /v1/tasks/{task_id}`, `DELETE /v1/tasks/{task_id}`
//! - `POST/GET/DELETE /v1/context/{session_id}/{namespace}`
//! - `GET /v1/health`, `GET /v1/metrics`

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use ubp_persistence::constant_time_eq;

use crate::server::Orchestrator;

pub mod handlers;

use handlers::ApiError;

/// Build the `/v1` router for an orchestrator.
pub fn router(orch: Orchestrator) -> Router {
    let authed = Router::new()
        .route("/v1/bots", post(handlers::create_bot).get(handlers::list_bots))
        .route(
            "/v1/bots/{bot_id}",
            get(handlers::get_bot)
                .put(handlers::update_bot)
                .delete(handlers::delete_bot),
        )
        .route("/v1/bots/{bot_id}/instances", get(handlers::list_instances))
        .route(
            "/v1/bots/{bot_id}/actions/{command_name}",
            post(handlers::submit_action),
        )
        .route(
            "/v1/bots/{bot_id}/commands/{command_name}",
            post(handlers::dispatch_command),
        )
        .route("/v1/tasks", get(handlers::list_tasks))
        .route(
            "/v1/tasks/{task_id}",
            get(handlers::get_task).delete(handlers::cancel_task),
        )
        .route(
            "/v1/context/{session_id}/{namespace}",
            post(handlers::put_context)
                .get(handlers::get_context)
                .delete(handlers::delete_context),
        )
        .route("/v1/metrics", get(handlers::metrics))
        .layer(middleware::from_fn_with_state(orch.clone(), require_admin));

    Router::new()
        .route("/v1/health", get(handlers::health))
        .merge(authed)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(orch)
}

/// Admin authentication middleware.
async fn require_admin(
    State(orch): State<Orchestrator>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !constant_time_eq(&orch.config().admin_token, presented) {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

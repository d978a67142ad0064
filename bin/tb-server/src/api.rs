//! The probe surface consumed by an HTTP front-end (spec.md §4.4, §6):
//! `/ready`, `/health`, `/busy`. Grounded in the teacher's
//! `fc-router::api::mod` liveness/readiness handlers and `utoipa`
//! annotations, narrowed to the three predicates spec.md names.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tb_consumer::Consumer;
use utoipa::{OpenApi, ToSchema};

#[derive(Clone)]
pub struct AppState {
    pub consumer: Arc<Consumer>,
}

/// Body returned by `/ready`, `/health` and `/busy`.
#[derive(Serialize, ToSchema)]
pub struct ProbeResponse {
    /// `true` iff the predicate for this probe holds.
    pub ok: bool,
}

#[derive(OpenApi)]
#[openapi(
    paths(ready, health, busy),
    components(schemas(ProbeResponse)),
    tags((name = "probe", description = "Consumer liveness/readiness/busy probes"))
)]
pub struct ApiDoc;

/// `/ready` → 200 iff the Consumer is running AND the queue is reachable;
/// else 500 (spec.md §6).
#[utoipa::path(get, path = "/ready", tag = "probe", responses(
    (status = 200, description = "Consumer running and queue reachable", body = ProbeResponse),
    (status = 500, description = "Not ready", body = ProbeResponse),
))]
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    let ready = state.consumer.is_running() && state.consumer.ping_queue().await;
    let status = if ready { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    (status, Json(ProbeResponse { ok: ready }))
}

/// `/health` → 200 iff the Consumer is running; else 500 (spec.md §6).
#[utoipa::path(get, path = "/health", tag = "probe", responses(
    (status = 200, description = "Consumer running", body = ProbeResponse),
    (status = 500, description = "Consumer not running", body = ProbeResponse),
))]
async fn health(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    let healthy = state.consumer.is_running();
    let status = if healthy { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    (status, Json(ProbeResponse { ok: healthy }))
}

/// `/busy` → 200 iff NOT currently processing a message; 503 if currently
/// processing; 500 on internal error (spec.md §6's `is_processing_message`
/// failing its own invariant check).
#[utoipa::path(get, path = "/busy", tag = "probe", responses(
    (status = 200, description = "Idle, not currently processing", body = ProbeResponse),
    (status = 503, description = "Currently processing a message", body = ProbeResponse),
    (status = 500, description = "Internal error", body = ProbeResponse),
))]
async fn busy(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    match state.consumer.is_processing_message() {
        Ok(true) => (StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { ok: false })),
        Ok(false) => (StatusCode::OK, Json(ProbeResponse { ok: true })),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ProbeResponse { ok: false })),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/health", get(health))
        .route("/busy", get(busy))
        .merge(utoipa_swagger_ui::SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}

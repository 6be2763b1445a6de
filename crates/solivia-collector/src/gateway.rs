//! HTTP read path over the scheduler's cache. Handlers only read snapshots;
//! none of them can start a bus exchange.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use poller::{GatewayHandle, InverterSnapshot, PollState};

#[derive(Clone)]
struct GatewayState {
    gateway: GatewayHandle,
    metrics: Option<PrometheusHandle>,
}

pub fn router(gateway: GatewayHandle, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/inverters", get(list_inverters))
        .route("/inverters/:address", get(get_inverter))
        .route("/state", get(poll_state))
        .route("/metrics", get(render_metrics))
        .with_state(GatewayState { gateway, metrics })
}

async fn list_inverters(State(state): State<GatewayState>) -> Json<Vec<InverterSnapshot>> {
    Json(
        state
            .gateway
            .all()
            .iter()
            .map(|snapshot| InverterSnapshot::clone(snapshot))
            .collect(),
    )
}

async fn get_inverter(
    State(state): State<GatewayState>,
    Path(address): Path<u8>,
) -> Result<Json<InverterSnapshot>, StatusCode> {
    state
        .gateway
        .inverter(address)
        .map(|snapshot| Json(InverterSnapshot::clone(&snapshot)))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn poll_state(State(state): State<GatewayState>) -> Json<PollState> {
    Json(state.gateway.poll_state())
}

async fn render_metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

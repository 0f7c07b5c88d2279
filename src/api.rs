//! HTTP API surface (`spec.md` §6): a thin `axum` layer over [`Orchestrator`].
//!
//! Every handler maps the request onto one orchestrator call and lets
//! [`ManagerError`]'s `IntoResponse` impl pick the status code. Two routes
//! beyond the six the specification names, `/healthz` and `/metrics`, exist
//! purely for operability and carry no domain semantics.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::ManagerError;
use crate::orchestrator::Orchestrator;
use crate::registry::ServiceState;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Builds the router. Middleware (tracing, timeouts) is layered on by the
/// caller, mirroring how `main` composes everything else.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/gpu/status", get(get_status))
        .route("/gpu/prepare-phase/:phase", post(post_prepare_phase))
        .route("/gpu/service/:name/start", post(post_start_service))
        .route("/gpu/service/:name/stop", post(post_stop_service))
        .route("/gpu/release-all", post(post_release_all))
        .route("/gpu/lock/release", post(post_release_lock))
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

#[derive(Serialize)]
struct VramReport {
    total_mb: u64,
    used_mb: u64,
    free_mb: u64,
    available_mb: i64,
    processes: Vec<crate::tracker::ProcessUsage>,
    temperature_c: Option<u32>,
    utilization_percent: Option<u32>,
}

#[derive(Serialize)]
struct ServiceReport {
    state: ServiceState,
    vram_mb: u64,
    priority: i64,
    phases: Vec<u32>,
}

#[derive(Serialize)]
struct LockReport {
    holder: Option<String>,
    ttl: i64,
}

#[derive(Serialize)]
struct StatusResponse {
    vram: VramReport,
    services: HashMap<String, ServiceReport>,
    lock: LockReport,
}

async fn get_status(State(state): State<ApiState>) -> Result<impl IntoResponse, ManagerError> {
    let report = state.orchestrator.status().await?;
    let available_mb = report.gpu.free_mb as i64 - state_reserve(&state);

    let mut services = HashMap::with_capacity(report.services.len());
    for descriptor in state.orchestrator.registry().all() {
        let service_state = report
            .services
            .get(&descriptor.name)
            .copied()
            .unwrap_or(ServiceState::Unknown);
        services.insert(
            descriptor.name.clone(),
            ServiceReport {
                state: service_state,
                vram_mb: descriptor.vram_mb,
                priority: descriptor.priority,
                phases: {
                    let mut phases: Vec<u32> = descriptor.phases.iter().copied().collect();
                    phases.sort_unstable();
                    phases
                },
            },
        );
    }

    Ok(Json(StatusResponse {
        vram: VramReport {
            total_mb: report.gpu.total_mb,
            used_mb: report.gpu.used_mb,
            free_mb: report.gpu.free_mb,
            available_mb,
            processes: report.gpu.processes,
            temperature_c: report.gpu.temperature_c,
            utilization_percent: report.gpu.utilization_percent,
        },
        services,
        lock: LockReport {
            holder: report.lock_holder,
            ttl: report.lock_ttl_remaining_s.unwrap_or(-1),
        },
    }))
}

fn state_reserve(state: &ApiState) -> i64 {
    state.orchestrator.vram_reserve_mb() as i64
}

async fn post_prepare_phase(
    State(state): State<ApiState>,
    Path(phase): Path<u32>,
) -> Result<impl IntoResponse, ManagerError> {
    let success = state.orchestrator.prepare_for_phase(phase).await?;
    Ok(Json(serde_json::json!({"success": success, "phase": phase})))
}

async fn post_start_service(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ManagerError> {
    let success = state.orchestrator.start_service(&name).await?;
    Ok(Json(serde_json::json!({"success": success, "service": name})))
}

#[derive(Deserialize, Default)]
struct StopServiceQuery {
    #[serde(default)]
    force: bool,
}

async fn post_stop_service(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<StopServiceQuery>,
) -> Result<impl IntoResponse, ManagerError> {
    let success = state.orchestrator.stop_service(&name, query.force).await?;
    Ok(Json(serde_json::json!({"success": success, "service": name})))
}

async fn post_release_all(State(state): State<ApiState>) -> Result<impl IntoResponse, ManagerError> {
    state.orchestrator.release_all().await?;
    Ok(Json(serde_json::json!({"success": true})))
}

async fn post_release_lock(State(state): State<ApiState>) -> Result<impl IntoResponse, ManagerError> {
    let released = state.orchestrator.release_lock().await?;
    Ok(Json(serde_json::json!({"released": released})))
}

async fn get_healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_metrics(State(state): State<ApiState>) -> Result<impl IntoResponse, ManagerError> {
    let report = state.orchestrator.status().await?;
    let ready_count = report
        .services
        .values()
        .filter(|s| **s == ServiceState::Ready)
        .count();
    let body = format!(
        "gpu_arbiter_vram_total_mb {}\n\
         gpu_arbiter_vram_used_mb {}\n\
         gpu_arbiter_services_ready {}\n\
         gpu_arbiter_lock_held {}\n",
        report.gpu.total_mb,
        report.gpu.used_mb,
        ready_count,
        report.lock_holder.is_some() as u8,
    );
    Ok(([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

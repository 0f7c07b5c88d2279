//! Drives the real `axum` router end to end: build a request, `oneshot` it
//! through the app, read back status codes and JSON bodies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use gpu_arbiter::api::{self, ApiState};
use gpu_arbiter::error::ManagerError;
use gpu_arbiter::lifecycle::Lifecycle;
use gpu_arbiter::lock::DistributedLock;
use gpu_arbiter::orchestrator::Orchestrator;
use gpu_arbiter::registry::{ServiceDescriptor, ServiceKind, ServiceRegistry, ServiceState};
use gpu_arbiter::tracker::{GpuSnapshot, VramTracker};
use http_body_util::BodyExt;
use tokio::sync::Mutex;
use tower::ServiceExt;

struct StubTracker;

#[async_trait]
impl VramTracker for StubTracker {
    async fn snapshot(&self) -> Result<GpuSnapshot, ManagerError> {
        Ok(GpuSnapshot {
            total_mb: 24_000,
            used_mb: 0,
            free_mb: 24_000,
            processes: Vec::new(),
            temperature_c: Some(45),
            utilization_percent: Some(10),
            sampled_at: chrono::Utc::now(),
        })
    }
}

#[derive(Default)]
struct StubLifecycle {
    running: Mutex<HashMap<String, bool>>,
}

#[async_trait]
impl Lifecycle for StubLifecycle {
    async fn ensure_running(&self, name: &str) -> Result<bool, ManagerError> {
        self.running.lock().await.insert(name.to_string(), true);
        Ok(true)
    }

    async fn stop(&self, name: &str, _force: bool) -> Result<bool, ManagerError> {
        self.running.lock().await.insert(name.to_string(), false);
        Ok(true)
    }

    async fn probe(&self, name: &str) -> Result<bool, ManagerError> {
        Ok(self.running.lock().await.get(name).copied().unwrap_or(false))
    }

    async fn wait_ready(&self, name: &str, _timeout_s: u64) -> Result<bool, ManagerError> {
        self.probe(name).await
    }

    async fn states(&self) -> Result<HashMap<String, ServiceState>, ManagerError> {
        let running = self.running.lock().await;
        Ok(running
            .iter()
            .map(|(name, up)| {
                (
                    name.clone(),
                    if *up { ServiceState::Ready } else { ServiceState::Stopped },
                )
            })
            .collect())
    }
}

#[derive(Default)]
struct StubLock {
    holder: Mutex<Option<String>>,
}

#[async_trait]
impl DistributedLock for StubLock {
    async fn acquire(&self, _key: &str, value: &str, _ttl_s: u64) -> Result<bool, ManagerError> {
        let mut holder = self.holder.lock().await;
        if holder.is_some() {
            return Ok(false);
        }
        *holder = Some(value.to_string());
        Ok(true)
    }

    async fn current_holder(&self, _key: &str) -> Result<Option<String>, ManagerError> {
        Ok(self.holder.lock().await.clone())
    }

    async fn ttl_remaining(&self, _key: &str) -> Result<Option<i64>, ManagerError> {
        Ok(self.holder.lock().await.as_ref().map(|_| 600))
    }

    async fn release_if_value_equals(&self, _key: &str, value: &str) -> Result<bool, ManagerError> {
        let mut holder = self.holder.lock().await;
        if holder.as_deref() == Some(value) {
            *holder = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn force_release(&self, _key: &str) -> Result<bool, ManagerError> {
        Ok(self.holder.lock().await.take().is_some())
    }
}

fn app() -> axum::Router {
    let descriptor = ServiceDescriptor {
        name: "worker".to_string(),
        kind: ServiceKind::Native,
        vram_mb: 2048,
        priority: 10,
        health_url: "http://localhost/health".to_string(),
        health_timeout_s: 5,
        warmup_s: 0,
        phases: HashSet::from([1]),
        container_id: None,
        start_cmd: Some("true".to_string()),
        stop_cmd: Some("true".to_string()),
        force_stop_cmd: None,
        pid_file: None,
        graceful_evict_url: None,
    };
    let registry = Arc::new(ServiceRegistry::new(vec![descriptor]));
    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        Arc::new(StubTracker),
        Arc::new(StubLifecycle::default()),
        Arc::new(StubLock::default()),
        1024,
        600,
    ));
    api::router(ApiState { orchestrator })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_reports_vram_and_an_empty_lock() {
    let response = app()
        .oneshot(Request::get("/gpu/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["vram"]["total_mb"], 24_000);
    assert_eq!(body["lock"]["holder"], serde_json::Value::Null);
}

#[tokio::test]
async fn starting_an_unknown_service_is_a_404() {
    let response = app()
        .oneshot(
            Request::post("/gpu/service/ghost/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn an_out_of_range_phase_is_a_400() {
    let response = app()
        .oneshot(
            Request::post("/gpu/prepare-phase/9")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn starting_and_stopping_a_known_service_round_trips() {
    let app = app();

    let start = app
        .clone()
        .oneshot(
            Request::post("/gpu/service/worker/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(start.status(), StatusCode::OK);
    let start_body = body_json(start).await;
    assert_eq!(start_body["success"], true);
    assert_eq!(start_body["service"], "worker");

    let stop = app
        .oneshot(
            Request::post("/gpu/service/worker/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stop.status(), StatusCode::OK);
    let stop_body = body_json(stop).await;
    assert_eq!(stop_body["success"], true);
}

#[tokio::test]
async fn release_all_and_lock_release_both_report_success() {
    let app = app();

    let release_all = app
        .clone()
        .oneshot(
            Request::post("/gpu/release-all")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(release_all.status(), StatusCode::OK);
    assert_eq!(body_json(release_all).await["success"], true);

    let release_lock = app
        .oneshot(Request::post("/gpu/lock/release").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(release_lock.status(), StatusCode::OK);
    // Nobody was holding the lock, so the force-release reports false.
    assert_eq!(body_json(release_lock).await["released"], false);
}

#[tokio::test]
async fn healthz_and_metrics_are_reachable() {
    let app = app();

    let healthz = app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(healthz.status(), StatusCode::OK);

    let metrics = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    let bytes = metrics.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("gpu_arbiter_vram_total_mb 24000"));
}

//! Exercises the real `LifecycleManager` against native services: genuine
//! child processes, a genuine HTTP health check (via `wiremock`), no fakes.

use std::collections::HashSet;
use std::sync::Arc;

use bollard::Docker;
use gpu_arbiter::lifecycle::{Lifecycle, LifecycleManager};
use gpu_arbiter::registry::{ServiceDescriptor, ServiceKind, ServiceRegistry, ServiceState};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn docker() -> Docker {
    Docker::connect_with_unix_defaults().expect("construct a docker client handle")
}

fn native_descriptor(name: &str, health_url: String, start_cmd: String, stop_cmd: String) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        kind: ServiceKind::Native,
        vram_mb: 1024,
        priority: 1,
        health_url,
        health_timeout_s: 1,
        warmup_s: 0,
        phases: HashSet::from([1]),
        container_id: None,
        start_cmd: Some(start_cmd),
        stop_cmd: Some(stop_cmd),
        force_stop_cmd: None,
        pid_file: None,
        graceful_evict_url: None,
    }
}

#[tokio::test]
async fn ensure_running_invokes_start_cmd_when_never_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let marker = tempfile::Builder::new().tempfile().unwrap().into_temp_path();
    std::fs::remove_file(&marker).ok();
    let marker_path = marker.to_path_buf();

    let descriptor = native_descriptor(
        "never-healthy",
        format!("{}/health", server.uri()),
        format!("touch {}", marker_path.display()),
        "true".to_string(),
    );
    let registry = Arc::new(ServiceRegistry::new(vec![descriptor]));
    let manager = LifecycleManager::new(registry, docker());

    let became_ready = manager.ensure_running("never-healthy").await.unwrap();
    assert!(!became_ready);
    assert!(marker_path.exists(), "start_cmd should have run even though the probe never succeeded");

    let states = manager.states().await.unwrap();
    assert_eq!(states.get("never-healthy"), Some(&ServiceState::Error));
}

#[tokio::test]
async fn stop_runs_stop_cmd_when_the_service_is_currently_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let marker = tempfile::Builder::new().tempfile().unwrap().into_temp_path();
    let marker_path = marker.to_path_buf();
    std::fs::write(&marker_path, b"present").unwrap();

    let descriptor = native_descriptor(
        "always-healthy",
        format!("{}/health", server.uri()),
        "true".to_string(),
        format!("rm -f {}", marker_path.display()),
    );
    let registry = Arc::new(ServiceRegistry::new(vec![descriptor]));
    let manager = LifecycleManager::new(registry, docker());

    assert!(manager.probe("always-healthy").await.unwrap());
    let stopped = manager.stop("always-healthy", false).await.unwrap();
    assert!(stopped);
    assert!(!marker_path.exists(), "stop_cmd should have removed the marker file");
}

#[tokio::test]
async fn stopping_an_already_stopped_service_is_a_no_op_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let descriptor = native_descriptor(
        "already-down",
        format!("{}/health", server.uri()),
        "true".to_string(),
        "false".to_string(), // would fail loudly if ever actually invoked
    );
    let registry = Arc::new(ServiceRegistry::new(vec![descriptor]));
    let manager = LifecycleManager::new(registry, docker());

    assert!(manager.stop("already-down", false).await.unwrap());
}

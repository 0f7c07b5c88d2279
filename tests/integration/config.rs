//! Exercises `load_config` against real files on disk, the path the unit
//! tests in `src/config.rs` don't cover (they validate in-memory `RawConfig`
//! values directly).

use std::io::Write;

use gpu_arbiter::error::ManagerError;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp config file");
    file.write_all(contents.as_bytes()).expect("write temp config file");
    file
}

const VALID: &str = r#"
vram_reserve_mb: 2048
default_lock_ttl_s: 300
lock:
  redis_url: "redis://127.0.0.1:6379/0"
docker:
  socket: "/var/run/docker.sock"
services:
  transcriber:
    kind: native
    vram_mb: 4096
    priority: 50
    health_url: "http://127.0.0.1:9001/health"
    health_timeout_s: 20
    warmup_s: 2
    phases: [2, 3]
    start_cmd: "start-transcriber"
    stop_cmd: "stop-transcriber"
  renderer:
    kind: containerized
    vram_mb: 8192
    priority: 100
    health_url: "http://127.0.0.1:9002/health"
    health_timeout_s: 30
    warmup_s: 5
    phases: [4]
    container_id: "renderer-container"
"#;

#[test]
fn a_well_formed_document_loads_with_defaults_applied() {
    let file = write_config(VALID);
    let config = gpu_arbiter::config::load_config(file.path()).expect("valid config should load");
    assert_eq!(config.vram_reserve_mb, 2048);
    assert_eq!(config.default_lock_ttl_s, 300);
    assert_eq!(config.redis_url, "redis://127.0.0.1:6379/0");
    assert_eq!(config.docker_socket.as_deref(), Some("/var/run/docker.sock"));
    assert!(config.registry.get("transcriber").is_some());
    assert!(config.registry.get("renderer").is_some());
}

#[test]
fn omitted_global_defaults_fall_back_to_constants() {
    let yaml = r#"
lock:
  redis_url: "redis://127.0.0.1:6379/0"
services: {}
"#;
    let file = write_config(yaml);
    let config = gpu_arbiter::config::load_config(file.path()).unwrap();
    assert_eq!(config.vram_reserve_mb, gpu_arbiter::constants::DEFAULT_VRAM_RESERVE_MB);
    assert_eq!(config.default_lock_ttl_s, gpu_arbiter::constants::DEFAULT_LOCK_TTL_S);
}

#[test]
fn unknown_top_level_key_is_rejected() {
    let yaml = r#"
lock:
  redis_url: "redis://127.0.0.1:6379/0"
services: {}
totally_unrecognized_key: 1
"#;
    let file = write_config(yaml);
    let err = gpu_arbiter::config::load_config(file.path()).unwrap_err();
    assert!(matches!(err, ManagerError::ConfigParseError(_)));
}

#[test]
fn missing_file_surfaces_as_config_read_error() {
    let err = gpu_arbiter::config::load_config(std::path::Path::new("/nonexistent/gpu-arbiter.yaml"))
        .unwrap_err();
    assert!(matches!(err, ManagerError::ConfigReadError(_)));
}

//! Error handling for the GPU resource manager.
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Defines all possible errors that can occur in the GPU resource manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The NVML handle could not be initialized, or the device index is invalid.
    #[error("GPU tracker unavailable: {0}")]
    TrackerUnavailable(String),

    /// A query against an initialized NVML handle failed.
    #[error("GPU tracker query failed: {0}")]
    TrackerQueryError(#[from] nvml_wrapper::error::NvmlError),

    /// The registry configuration failed validation at load time.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The configuration file could not be read from disk.
    #[error("failed to read config file: {0}")]
    ConfigReadError(std::io::Error),

    /// The configuration file is not valid YAML.
    #[error("invalid YAML configuration: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A caller referenced a service name absent from the registry.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// The container named by a containerized descriptor does not exist.
    #[error("container '{container_id}' for service '{service}' is missing")]
    ContainerMissing {
        /// The service whose container is missing.
        service: String,
        /// The configured container identifier that could not be found.
        container_id: String,
    },

    /// A service failed to become healthy within its configured timeout.
    #[error("service '{0}' did not become ready before its start timeout")]
    StartTimeout(String),

    /// A service did not report stopped within the bounded stop window.
    #[error("service '{0}' did not stop within the bounded deadline")]
    StopTimeout(String),

    /// Not enough VRAM is available and no lower-priority candidate remains
    /// to preempt.
    #[error(
        "cannot fit service '{service}' (needs {needed_mb} MB, {available_mb} MB available) and no lower-priority service remains to preempt"
    )]
    PreemptionBlocked {
        /// The service that could not be scheduled.
        service: String,
        /// VRAM the service's descriptor claims to need.
        needed_mb: u64,
        /// VRAM available after the reserve, at the time of the decision.
        available_mb: i64,
    },

    /// The distributed mutex could not be acquired within the back-off series.
    #[error("lock unavailable; currently held by '{0}'")]
    LockUnavailable(String),

    /// A caller-supplied argument failed validation (e.g. an out-of-range phase).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The container engine returned an error outside the specific cases above.
    #[error("container engine error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// The lock store returned an error outside contention (transport, auth, ...).
    #[error("lock store error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A host-level I/O failure (spawning a native process, writing a pid
    /// file, ...) not otherwise covered by a more specific variant.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// Maps an error kind to the HTTP status code defined in `spec.md` §7.
    fn status_code(&self) -> StatusCode {
        match self {
            ManagerError::TrackerUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ManagerError::TrackerQueryError(_) => StatusCode::SERVICE_UNAVAILABLE,
            ManagerError::ConfigInvalid(_)
            | ManagerError::ConfigReadError(_)
            | ManagerError::ConfigParseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ManagerError::UnknownService(_) => StatusCode::NOT_FOUND,
            ManagerError::ContainerMissing { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ManagerError::StartTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ManagerError::StopTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ManagerError::PreemptionBlocked { .. } => StatusCode::CONFLICT,
            ManagerError::LockUnavailable(_) => StatusCode::from_u16(423).unwrap(),
            ManagerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ManagerError::Docker(_) => StatusCode::SERVICE_UNAVAILABLE,
            ManagerError::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            ManagerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short machine-readable label for the error kind, used as the
    /// "context hash" callers can key retries/alerts off of.
    fn kind(&self) -> &'static str {
        match self {
            ManagerError::TrackerUnavailable(_) => "tracker_unavailable",
            ManagerError::TrackerQueryError(_) => "tracker_query_error",
            ManagerError::ConfigInvalid(_) => "config_invalid",
            ManagerError::ConfigReadError(_) => "config_invalid",
            ManagerError::ConfigParseError(_) => "config_invalid",
            ManagerError::UnknownService(_) => "unknown_service",
            ManagerError::ContainerMissing { .. } => "container_missing",
            ManagerError::StartTimeout(_) => "start_timeout",
            ManagerError::StopTimeout(_) => "stop_timeout",
            ManagerError::PreemptionBlocked { .. } => "preemption_blocked",
            ManagerError::LockUnavailable(_) => "lock_unavailable",
            ManagerError::InvalidArgument(_) => "invalid_argument",
            ManagerError::Docker(_) => "container_engine_error",
            ManagerError::Redis(_) => "lock_store_error",
            ManagerError::Io(_) => "io_error",
        }
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Convenience alias used throughout the manager.
pub type Result<T> = std::result::Result<T, ManagerError>;

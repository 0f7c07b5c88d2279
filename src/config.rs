//! Configuration loading and validation for the GPU resource manager.
//!
//! Mirrors the teacher's `load_config`: read a YAML document from disk,
//! deserialize strictly (unknown keys rejected per `spec.md` §6.4), then
//! validate the result into a [`ServiceRegistry`] before anything else in
//! the process is allowed to start.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use url::Url;

use crate::error::ManagerError;
use crate::registry::{ServiceDescriptor, ServiceKind, ServiceRegistry};

/// Top-level configuration document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// System VRAM reserve in MB. Defaults to [`crate::constants::DEFAULT_VRAM_RESERVE_MB`].
    #[serde(default = "default_vram_reserve_mb")]
    pub vram_reserve_mb: u64,
    /// Default lease TTL in seconds when a caller doesn't override it.
    #[serde(default = "default_lock_ttl_s")]
    pub default_lock_ttl_s: u64,
    /// Lock store connection settings.
    pub lock: LockConfig,
    /// Container engine connection settings.
    #[serde(default)]
    pub docker: DockerConfig,
    /// Service catalog, keyed by name. `IndexMap` preserves file order,
    /// which the registry's equal-priority tie-break depends on.
    pub services: IndexMap<String, RawServiceConfig>,
}

fn default_vram_reserve_mb() -> u64 {
    crate::constants::DEFAULT_VRAM_RESERVE_MB
}

fn default_lock_ttl_s() -> u64 {
    crate::constants::DEFAULT_LOCK_TTL_S
}

/// Connection settings for the distributed lock store.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub redis_url: String,
}

/// Connection settings for the container engine.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerConfig {
    /// Optional Docker socket override. `None` uses the local default.
    #[serde(default)]
    pub socket: Option<String>,
}

/// On-disk shape of one service entry, before validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawServiceConfig {
    pub kind: ServiceKind,
    pub vram_mb: u64,
    pub priority: i64,
    pub health_url: String,
    pub health_timeout_s: u64,
    pub warmup_s: u64,
    pub phases: HashSet<u32>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub start_cmd: Option<String>,
    #[serde(default)]
    pub stop_cmd: Option<String>,
    #[serde(default)]
    pub force_stop_cmd: Option<String>,
    #[serde(default)]
    pub pid_file: Option<String>,
    #[serde(default)]
    pub graceful_evict_url: Option<String>,
}

/// Fully loaded, validated configuration.
pub struct Config {
    /// System VRAM reserve in MB.
    pub vram_reserve_mb: u64,
    /// Default lease TTL in seconds.
    pub default_lock_ttl_s: u64,
    /// Redis connection URL for the lock store.
    pub redis_url: String,
    /// Docker socket override, if any.
    pub docker_socket: Option<String>,
    /// The validated, ordered service registry.
    pub registry: ServiceRegistry,
}

/// Loads and validates the configuration document at `path`.
///
/// Rejects (per `spec.md` §4.2): duplicate names, native descriptors
/// missing `start_cmd`/`stop_cmd`, containerized descriptors missing
/// `container_id`, non-URL `health_url`, negative timeouts, and out-of-range
/// phase numbers. A rejected configuration is a hard startup failure — the
/// process must refuse to start (`ManagerError::ConfigInvalid`).
pub fn load_config(path: &Path) -> Result<Config, ManagerError> {
    let content = fs::read_to_string(path).map_err(ManagerError::ConfigReadError)?;
    let raw: RawConfig = serde_yaml::from_str(&content)?;
    validate(raw)
}

fn validate(raw: RawConfig) -> Result<Config, ManagerError> {
    let mut seen = HashSet::with_capacity(raw.services.len());
    let mut descriptors = Vec::with_capacity(raw.services.len());

    for (name, svc) in raw.services {
        if !seen.insert(name.clone()) {
            return Err(ManagerError::ConfigInvalid(format!(
                "duplicate service name '{name}'"
            )));
        }

        if Url::parse(&svc.health_url).is_err() {
            return Err(ManagerError::ConfigInvalid(format!(
                "service '{name}' has an invalid health_url '{}'",
                svc.health_url
            )));
        }

        if svc.health_timeout_s == 0 {
            return Err(ManagerError::ConfigInvalid(format!(
                "service '{name}' has a non-positive health_timeout_s"
            )));
        }

        for phase in &svc.phases {
            if *phase < crate::constants::MIN_PHASE || *phase > crate::constants::MAX_PHASE {
                return Err(ManagerError::ConfigInvalid(format!(
                    "service '{name}' declares out-of-range phase {phase}"
                )));
            }
        }

        match svc.kind {
            ServiceKind::Containerized => {
                if svc.container_id.is_none() {
                    return Err(ManagerError::ConfigInvalid(format!(
                        "containerized service '{name}' is missing container_id"
                    )));
                }
            }
            ServiceKind::Native => {
                if svc.start_cmd.is_none() || svc.stop_cmd.is_none() {
                    return Err(ManagerError::ConfigInvalid(format!(
                        "native service '{name}' is missing start_cmd or stop_cmd"
                    )));
                }
            }
        }

        descriptors.push(ServiceDescriptor {
            name,
            kind: svc.kind,
            vram_mb: svc.vram_mb,
            priority: svc.priority,
            health_url: svc.health_url,
            health_timeout_s: svc.health_timeout_s,
            warmup_s: svc.warmup_s,
            phases: svc.phases,
            container_id: svc.container_id,
            start_cmd: svc.start_cmd,
            stop_cmd: svc.stop_cmd,
            force_stop_cmd: svc.force_stop_cmd,
            pid_file: svc.pid_file,
            graceful_evict_url: svc.graceful_evict_url,
        });
    }

    Ok(Config {
        vram_reserve_mb: raw.vram_reserve_mb,
        default_lock_ttl_s: raw.default_lock_ttl_s,
        redis_url: raw.lock.redis_url,
        docker_socket: raw.docker.socket,
        registry: ServiceRegistry::new(descriptors),
    })
}

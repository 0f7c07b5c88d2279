//! Lifecycle Manager: starts, stops, and health-probes managed services.
//!
//! Implements `spec.md` §4.3. Containerized services are driven through the
//! container engine; native services are spawned as detached host processes.
//! Operations on the same service name are serialized through a per-service
//! mutex so a start and a stop can never race each other (I6); probes update
//! a cached state map readable without holding that mutex (I7: bounded
//! staleness, not blocking reads).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, KillContainerOptions, StopContainerOptions};
use tokio::process::Command as TokioCommand;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::constants::{
    CONTAINER_SETTLE_DELAY, CONTAINER_STOP_DEADLINE, HEALTH_PROBE_TIMEOUT, NATIVE_SETTLE_DELAY,
    WAIT_READY_POLL_INTERVAL,
};
use crate::error::ManagerError;
use crate::registry::{ServiceDescriptor, ServiceKind, ServiceRegistry, ServiceState};

/// Capability for bringing services up and down and observing their state.
/// Object-safe so the orchestrator can hold it as `Arc<dyn Lifecycle>` and
/// tests can substitute a fake without touching Docker or a real process
/// tree.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Ensures `name` is running and healthy, starting it if necessary.
    /// Returns `true` iff the service ended up `Ready`.
    async fn ensure_running(&self, name: &str) -> Result<bool, ManagerError>;

    /// Stops `name`. `force` skips graceful eviction and kills harder.
    async fn stop(&self, name: &str, force: bool) -> Result<bool, ManagerError>;

    /// Single health check against `name`; updates the cached state.
    async fn probe(&self, name: &str) -> Result<bool, ManagerError>;

    /// Polls `probe` every [`WAIT_READY_POLL_INTERVAL`] until it succeeds or
    /// `timeout_s` elapses.
    async fn wait_ready(&self, name: &str, timeout_s: u64) -> Result<bool, ManagerError>;

    /// A snapshot of every registered service's last-known state, refreshed
    /// by probing each one first.
    async fn states(&self) -> Result<HashMap<String, ServiceState>, ManagerError>;
}

/// Real implementation: containers through `bollard`, native processes
/// through `tokio::process`, health checks through `reqwest`.
pub struct LifecycleManager {
    registry: Arc<ServiceRegistry>,
    docker: Docker,
    http: reqwest::Client,
    states: RwLock<HashMap<String, ServiceState>>,
    service_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    native_pids: Mutex<HashMap<String, u32>>,
}

impl LifecycleManager {
    /// Builds a manager bound to `registry`, connecting to the container
    /// engine at `docker_socket` (or the platform default).
    pub fn new(registry: Arc<ServiceRegistry>, docker: Docker) -> Self {
        Self {
            registry,
            docker,
            http: reqwest::Client::new(),
            states: RwLock::new(HashMap::new()),
            service_locks: Mutex::new(HashMap::new()),
            native_pids: Mutex::new(HashMap::new()),
        }
    }

    fn descriptor(&self, name: &str) -> Result<ServiceDescriptor, ManagerError> {
        self.registry
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownService(name.to_string()))
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.service_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn set_state(&self, name: &str, state: ServiceState) {
        self.states.write().await.insert(name.to_string(), state);
    }

    /// Records a probe result, leaving an in-flight `Starting`/`Stopping`
    /// transition alone so a probe racing a start/stop can't clobber it.
    async fn record_probe(&self, name: &str, healthy: bool) {
        let mut states = self.states.write().await;
        let current = states.get(name).copied().unwrap_or(ServiceState::Unknown);
        let next = if healthy {
            ServiceState::Ready
        } else if matches!(current, ServiceState::Starting | ServiceState::Stopping) {
            current
        } else {
            ServiceState::Stopped
        };
        states.insert(name.to_string(), next);
    }

    async fn raw_probe(&self, descriptor: &ServiceDescriptor) -> bool {
        let result = self
            .http
            .get(&descriptor.health_url)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await;
        matches!(result, Ok(resp) if resp.status().is_success())
    }

    async fn start_container(&self, descriptor: &ServiceDescriptor) -> Result<(), ManagerError> {
        let container_id = descriptor
            .container_id
            .as_deref()
            .expect("containerized descriptor validated at config load");

        self.docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|_| ManagerError::ContainerMissing {
                service: descriptor.name.clone(),
                container_id: container_id.to_string(),
            })?;

        self.docker
            .start_container(container_id, None::<bollard::container::StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        descriptor: &ServiceDescriptor,
        force: bool,
    ) -> Result<(), ManagerError> {
        let container_id = descriptor
            .container_id
            .as_deref()
            .expect("containerized descriptor validated at config load");

        if force {
            self.docker
                .kill_container(container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
                .await?;
        } else {
            self.docker
                .stop_container(
                    container_id,
                    Some(StopContainerOptions {
                        t: CONTAINER_STOP_DEADLINE.as_secs() as i64,
                    }),
                )
                .await?;
        }

        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        let still_running = inspect.state.and_then(|s| s.running).unwrap_or(false);
        if still_running {
            return Err(ManagerError::StopTimeout(descriptor.name.clone()));
        }
        Ok(())
    }

    async fn start_native(&self, descriptor: &ServiceDescriptor) -> Result<(), ManagerError> {
        let start_cmd = descriptor
            .start_cmd
            .as_deref()
            .expect("native descriptor validated at config load");

        let mut cmd = TokioCommand::new("sh");
        cmd.arg("-c")
            .arg(start_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // New session so the child survives this process and signals sent
        // to our process group don't reach it.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        if let Some(pid) = child.id() {
            self.native_pids
                .lock()
                .await
                .insert(descriptor.name.clone(), pid);
            if let Some(pid_file) = &descriptor.pid_file {
                tokio::fs::write(pid_file, pid.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn stop_native(
        &self,
        descriptor: &ServiceDescriptor,
        force: bool,
    ) -> Result<(), ManagerError> {
        let cmd_str = if force {
            descriptor
                .force_stop_cmd
                .as_deref()
                .or(descriptor.stop_cmd.as_deref())
        } else {
            descriptor.stop_cmd.as_deref()
        }
        .expect("native descriptor validated at config load");

        let status = TokioCommand::new("sh").arg("-c").arg(cmd_str).status().await?;
        if !status.success() {
            tracing::warn!(service = %descriptor.name, status = ?status, "stop command exited non-zero");
        }

        let pid = self.native_pids.lock().await.get(&descriptor.name).copied();
        if let Some(pid) = pid {
            let deadline = Instant::now() + CONTAINER_STOP_DEADLINE;
            while Instant::now() < deadline {
                if !process_alive(pid) {
                    self.native_pids.lock().await.remove(&descriptor.name);
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            return Err(ManagerError::StopTimeout(descriptor.name.clone()));
        }

        Ok(())
    }
}

fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[async_trait]
impl Lifecycle for LifecycleManager {
    async fn ensure_running(&self, name: &str) -> Result<bool, ManagerError> {
        let descriptor = self.descriptor(name)?;
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        if self.probe(name).await? {
            return Ok(true);
        }

        self.set_state(name, ServiceState::Starting).await;

        let start_result = match descriptor.kind {
            ServiceKind::Containerized => self.start_container(&descriptor).await,
            ServiceKind::Native => self.start_native(&descriptor).await,
        };
        if let Err(e) = start_result {
            self.set_state(name, ServiceState::Error).await;
            return Err(e);
        }

        tokio::time::sleep(Duration::from_secs(descriptor.warmup_s)).await;

        if self.wait_ready(name, descriptor.health_timeout_s).await? {
            self.set_state(name, ServiceState::Ready).await;
            Ok(true)
        } else {
            self.set_state(name, ServiceState::Error).await;
            Ok(false)
        }
    }

    async fn stop(&self, name: &str, force: bool) -> Result<bool, ManagerError> {
        let descriptor = self.descriptor(name)?;
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        if !self.probe(name).await? {
            self.set_state(name, ServiceState::Stopped).await;
            return Ok(true);
        }

        if let Some(url) = &descriptor.graceful_evict_url {
            let _ = self
                .http
                .post(url)
                .timeout(HEALTH_PROBE_TIMEOUT)
                .send()
                .await;
        }

        self.set_state(name, ServiceState::Stopping).await;

        let stop_result = match descriptor.kind {
            ServiceKind::Containerized => self.stop_container(&descriptor, force).await,
            ServiceKind::Native => self.stop_native(&descriptor, force).await,
        };
        if let Err(e) = stop_result {
            self.set_state(name, ServiceState::Error).await;
            return Err(e);
        }

        let settle = match descriptor.kind {
            ServiceKind::Containerized => CONTAINER_SETTLE_DELAY,
            ServiceKind::Native => NATIVE_SETTLE_DELAY,
        };
        tokio::time::sleep(settle).await;

        self.set_state(name, ServiceState::Stopped).await;
        Ok(true)
    }

    async fn probe(&self, name: &str) -> Result<bool, ManagerError> {
        let descriptor = self.descriptor(name)?;
        let healthy = self.raw_probe(&descriptor).await;
        self.record_probe(name, healthy).await;
        Ok(healthy)
    }

    async fn wait_ready(&self, name: &str, timeout_s: u64) -> Result<bool, ManagerError> {
        let deadline = Instant::now() + Duration::from_secs(timeout_s);
        loop {
            if self.probe(name).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(WAIT_READY_POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn states(&self) -> Result<HashMap<String, ServiceState>, ManagerError> {
        for descriptor in self.registry.all() {
            self.probe(&descriptor.name).await?;
        }
        Ok(self.states.read().await.clone())
    }
}

//! Orchestrator: ties the tracker, registry, lifecycle manager, and
//! distributed lock together into the operations `spec.md` §4.4/§5 exposes
//! to callers.
//!
//! `PrepareForPhase` is serialized process-wide through an internal mutex
//! (§5's suspension-point note) so two concurrent phase transitions can't
//! interleave their preemption decisions. `UseService` and `ReleaseAll` are
//! not serialized against it; they only touch the distributed lock and the
//! lifecycle manager, both of which are already safe under concurrent use.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use std::collections::{HashMap, HashSet};

use crate::constants::{LOCK_BACKOFF_SECONDS, MAX_PHASE, MIN_PHASE};
use crate::error::ManagerError;
use crate::lifecycle::Lifecycle;
use crate::lock::{DistributedLock, LOCK_KEY};
use crate::registry::{ServiceDescriptor, ServiceRegistry, ServiceState};
use crate::tracker::{GpuSnapshot, VramTracker};

/// A held lease on the shared GPU for a single service. Releases the
/// distributed lock on drop if [`Lease::release`] was never called, so a
/// caller that forgets to release, or whose request is cancelled, doesn't
/// leak the lock until its TTL expires.
pub struct Lease {
    service: String,
    lock_value: String,
    lock: Arc<dyn DistributedLock>,
    released: bool,
}

impl Lease {
    /// The service this lease covers.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Releases the lock, provided nobody else has since reacquired it
    /// under a different value (P4).
    pub async fn release(mut self) -> Result<bool, ManagerError> {
        self.released = true;
        self.lock.release_if_value_equals(LOCK_KEY, &self.lock_value).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = self.lock.clone();
        let value = std::mem::take(&mut self.lock_value);
        tokio::spawn(async move {
            let _ = lock.release_if_value_equals(LOCK_KEY, &value).await;
        });
    }
}

/// A point-in-time view of the whole system, backing `GET /gpu/status`.
pub struct StatusReport {
    /// Most recent GPU telemetry reading.
    pub gpu: GpuSnapshot,
    /// Cached lifecycle state of every registered service.
    pub services: HashMap<String, ServiceState>,
    /// Current lock holder's opaque value, if any.
    pub lock_holder: Option<String>,
    /// Remaining TTL on the lock, in seconds, if held.
    pub lock_ttl_remaining_s: Option<i64>,
}

/// Coordinates VRAM accounting, service lifecycle, and the distributed lock.
pub struct Orchestrator {
    registry: Arc<ServiceRegistry>,
    tracker: Arc<dyn VramTracker>,
    lifecycle: Arc<dyn Lifecycle>,
    lock: Arc<dyn DistributedLock>,
    vram_reserve_mb: u64,
    default_lock_ttl_s: u64,
    prepare_gate: tokio::sync::Mutex<()>,
    lease_counter: AtomicU64,
}

impl Orchestrator {
    /// Builds an orchestrator over the given collaborators.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        tracker: Arc<dyn VramTracker>,
        lifecycle: Arc<dyn Lifecycle>,
        lock: Arc<dyn DistributedLock>,
        vram_reserve_mb: u64,
        default_lock_ttl_s: u64,
    ) -> Self {
        Self {
            registry,
            tracker,
            lifecycle,
            lock,
            vram_reserve_mb,
            default_lock_ttl_s,
            prepare_gate: tokio::sync::Mutex::new(()),
            lease_counter: AtomicU64::new(0),
        }
    }

    fn lease_token(&self) -> String {
        let seq = self.lease_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", std::process::id(), seq)
    }

    /// Brings every service required by `phase` to `Ready`, stopping
    /// services not needed for this phase (ascending priority) to free
    /// VRAM before starting anything. A service that fails to start does
    /// not abort the call; its peers are still attempted, and the call
    /// returns `false` rather than erroring, per the partial-success
    /// policy in `spec.md` §7.
    pub async fn prepare_for_phase(&self, phase: u32) -> Result<bool, ManagerError> {
        if !(MIN_PHASE..=MAX_PHASE).contains(&phase) {
            return Err(ManagerError::InvalidArgument(format!(
                "phase {phase} is outside the valid range {MIN_PHASE}..={MAX_PHASE}"
            )));
        }

        let _gate = self.prepare_gate.lock().await;

        let mut needed = self.registry.for_phase(phase);
        // Stable sort: equal-priority services keep registry (insertion)
        // order, which is the declared tie-break.
        needed.sort_by(|a, b| b.priority.cmp(&a.priority));
        let needed_names: HashSet<&str> = needed.iter().map(|d| d.name.as_str()).collect();
        let needed_vram_mb: u64 = needed.iter().map(|d| d.vram_mb).sum();

        let states = self.lifecycle.states().await?;
        let mut candidates_to_stop: Vec<&ServiceDescriptor> = self
            .registry
            .all()
            .iter()
            .filter(|d| !needed_names.contains(d.name.as_str()))
            .filter(|d| states.get(&d.name).copied().unwrap_or(ServiceState::Unknown) == ServiceState::Ready)
            .collect();
        candidates_to_stop.sort_by_key(|d| d.priority);

        while self.available_mb().await? < needed_vram_mb as i64 && !candidates_to_stop.is_empty() {
            let victim = candidates_to_stop.remove(0);
            if let Err(e) = self.lifecycle.stop(&victim.name, false).await {
                tracing::warn!(service = %victim.name, error = %e, "failed to stop candidate while preparing phase");
            }
        }

        let mut all_ready = true;
        for descriptor in needed {
            let ready = match self.lifecycle.ensure_running(&descriptor.name).await {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::warn!(service = %descriptor.name, error = %e, "failed to start for phase");
                    false
                }
            };
            all_ready &= ready;
        }
        Ok(all_ready)
    }

    async fn available_mb(&self) -> Result<i64, ManagerError> {
        let snapshot = self.tracker.snapshot().await?;
        Ok(snapshot.free_mb as i64 - self.vram_reserve_mb as i64)
    }

    /// Starts a single service directly, bypassing the lock. Backs
    /// `POST /gpu/service/{name}/start`, which is an operator action, not a
    /// leased use of the GPU.
    pub async fn start_service(&self, name: &str) -> Result<bool, ManagerError> {
        let descriptor = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownService(name.to_string()))?;
        self.ensure_capacity_for(&descriptor).await?;
        self.lifecycle.ensure_running(name).await
    }

    /// The service catalog this orchestrator was built with.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// The system VRAM reserve this orchestrator was built with, in MB.
    pub fn vram_reserve_mb(&self) -> u64 {
        self.vram_reserve_mb
    }

    async fn ensure_capacity_for(&self, descriptor: &ServiceDescriptor) -> Result<(), ManagerError> {
        if self
            .tracker
            .can_fit(descriptor.vram_mb, self.vram_reserve_mb)
            .await?
        {
            return Ok(());
        }
        self.preempt_for(descriptor).await
    }

    /// Stops strictly-lower-priority `Ready` services, lowest priority
    /// first, until `descriptor` fits or no further candidate remains.
    async fn preempt_for(&self, descriptor: &ServiceDescriptor) -> Result<(), ManagerError> {
        let states = self.lifecycle.states().await?;
        let mut candidates: Vec<&ServiceDescriptor> = self
            .registry
            .all()
            .iter()
            .filter(|d| d.name != descriptor.name)
            .filter(|d| d.priority < descriptor.priority)
            .filter(|d| states.get(&d.name).copied().unwrap_or(ServiceState::Unknown) == ServiceState::Ready)
            .collect();
        candidates.sort_by_key(|d| d.priority);

        for victim in candidates {
            self.lifecycle.stop(&victim.name, false).await?;
            if self
                .tracker
                .can_fit(descriptor.vram_mb, self.vram_reserve_mb)
                .await?
            {
                return Ok(());
            }
        }

        let snapshot = self.tracker.snapshot().await?;
        Err(ManagerError::PreemptionBlocked {
            service: descriptor.name.clone(),
            needed_mb: descriptor.vram_mb,
            available_mb: snapshot.free_mb as i64 - self.vram_reserve_mb as i64,
        })
    }

    /// Acquires the distributed lock (retrying across the back-off series),
    /// makes room for `name` if needed, and ensures it's running. The
    /// returned [`Lease`] owns the lock until released or dropped.
    pub async fn use_service(&self, name: &str, lock_ttl_s: Option<u64>) -> Result<Lease, ManagerError> {
        let descriptor = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownService(name.to_string()))?;
        let ttl = lock_ttl_s.unwrap_or(self.default_lock_ttl_s);
        let token = self.lease_token();

        let mut acquired = self.lock.acquire(LOCK_KEY, &token, ttl).await?;
        if !acquired {
            for backoff_s in LOCK_BACKOFF_SECONDS {
                tokio::time::sleep(Duration::from_secs(*backoff_s)).await;
                if self.lock.acquire(LOCK_KEY, &token, ttl).await? {
                    acquired = true;
                    break;
                }
            }
        }
        if !acquired {
            let holder = self
                .lock
                .current_holder(LOCK_KEY)
                .await?
                .unwrap_or_else(|| "<unknown>".to_string());
            return Err(ManagerError::LockUnavailable(holder));
        }

        if let Err(e) = self.ensure_capacity_for(&descriptor).await {
            let _ = self.lock.release_if_value_equals(LOCK_KEY, &token).await;
            return Err(e);
        }

        match self.lifecycle.ensure_running(name).await {
            Ok(true) => Ok(Lease {
                service: name.to_string(),
                lock_value: token,
                lock: self.lock.clone(),
                released: false,
            }),
            Ok(false) => {
                let _ = self.lock.release_if_value_equals(LOCK_KEY, &token).await;
                Err(ManagerError::StartTimeout(name.to_string()))
            }
            Err(e) => {
                let _ = self.lock.release_if_value_equals(LOCK_KEY, &token).await;
                Err(e)
            }
        }
    }

    /// Stops a single service directly, bypassing the lock. Backs
    /// `POST /gpu/service/{name}/stop`, which is an operator action, not a
    /// leased use of the GPU.
    pub async fn stop_service(&self, name: &str, force: bool) -> Result<bool, ManagerError> {
        if self.registry.get(name).is_none() {
            return Err(ManagerError::UnknownService(name.to_string()));
        }
        self.lifecycle.stop(name, force).await
    }

    /// Stops every registered service and force-releases the lock,
    /// regardless of who holds it. Used for operator recovery and between
    /// pipeline runs.
    pub async fn release_all(&self) -> Result<(), ManagerError> {
        for descriptor in self.registry.all() {
            self.lifecycle.stop(&descriptor.name, false).await?;
        }
        self.lock.force_release(LOCK_KEY).await?;
        Ok(())
    }

    /// Unconditionally releases the lock without touching any service.
    /// Backs `POST /gpu/lock/release`.
    pub async fn release_lock(&self) -> Result<bool, ManagerError> {
        self.lock.force_release(LOCK_KEY).await
    }

    /// A point-in-time view of GPU telemetry, service states, and the lock.
    pub async fn status(&self) -> Result<StatusReport, ManagerError> {
        let gpu = self.tracker.snapshot().await?;
        let services = self.lifecycle.states().await?;
        let lock_holder = self.lock.current_holder(LOCK_KEY).await?;
        let lock_ttl_remaining_s = self.lock.ttl_remaining(LOCK_KEY).await?;
        Ok(StatusReport {
            gpu,
            services,
            lock_holder,
            lock_ttl_remaining_s,
        })
    }
}

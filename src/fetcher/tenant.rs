//! Per-tenant fetcher state and its registry.
//!
//! A `TenantSession` is created on first use and carries everything one
//! tenant's worker needs: its store view, fetch log, trace recorder, loop
//! flags, and observable status. Sessions that are stopped and idle can be
//! evicted; the next use recreates them from the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use crate::config::{RetentionConfig, TraceConfig};
use crate::fetcher::status::FetcherStatus;
use crate::logs::FetchLog;
use crate::store::{Store, TenantStore};
use crate::trace::TraceRecorder;

pub struct TenantSession {
    tenant: String,
    store: TenantStore,
    log: FetchLog,
    tracer: TraceRecorder,
    active: AtomicBool,
    running: AtomicBool,
    /// Bumped on every start/stop so a superseded loop can tell it is stale.
    generation: AtomicU64,
    status: RwLock<FetcherStatus>,
    stop: Notify,
    last_touched: RwLock<DateTime<Utc>>,
}

impl TenantSession {
    fn new(
        store: Arc<dyn Store>,
        tenant: &str,
        trace: &TraceConfig,
        retention: &RetentionConfig,
    ) -> Self {
        let tenant_store = TenantStore::new(store, tenant);
        Self {
            tenant: tenant.to_string(),
            log: FetchLog::new(tenant_store.clone(), retention.clone()),
            tracer: TraceRecorder::new(trace.clone(), tenant_store.clone()),
            store: tenant_store,
            active: AtomicBool::new(false),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            status: RwLock::new(FetcherStatus::default()),
            stop: Notify::new(),
            last_touched: RwLock::new(Utc::now()),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn store(&self) -> &TenantStore {
        &self.store
    }

    pub fn log(&self) -> &FetchLog {
        &self.log
    }

    pub fn tracer(&self) -> &TraceRecorder {
        &self.tracer
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enable the loop. Returns the new generation, or `None` if it was
    /// already active.
    pub(crate) fn activate(&self) -> Option<u64> {
        if self.active.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Disable the loop and wake it so it can exit.
    pub(crate) fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop.notify_waiters();
        was_active
    }

    /// Whether a loop started at `generation` should keep ticking.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.is_active() && self.generation.load(Ordering::SeqCst) == generation
    }

    pub(crate) async fn stopped(&self) {
        self.stop.notified().await;
    }

    /// Claim the cycle slot. `None` if a cycle is already in flight.
    pub(crate) fn try_begin_cycle(self: &Arc<Self>) -> Option<CycleGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CycleGuard {
                session: Arc::clone(self),
            })
    }

    pub async fn touch(&self) {
        *self.last_touched.write().await = Utc::now();
    }

    pub async fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - *self.last_touched.read().await)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) async fn update_status<F>(&self, f: F)
    where
        F: FnOnce(&mut FetcherStatus),
    {
        f(&mut *self.status.write().await);
    }

    /// Status snapshot with the live flags filled in.
    pub async fn status(&self) -> FetcherStatus {
        let mut status = self.status.read().await.clone();
        status.active = self.is_active();
        status.running = self.is_running();
        status
    }
}

/// Held for the duration of a cycle; releases the slot on drop, panics
/// included.
pub(crate) struct CycleGuard {
    session: Arc<TenantSession>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.session.running.store(false, Ordering::SeqCst);
    }
}

pub struct TenantRegistry {
    store: Arc<dyn Store>,
    trace: TraceConfig,
    retention: RetentionConfig,
    sessions: RwLock<HashMap<String, Arc<TenantSession>>>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn Store>, trace: TraceConfig, retention: RetentionConfig) -> Self {
        Self {
            store,
            trace,
            retention,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, tenant: &str) -> Arc<TenantSession> {
        if let Some(session) = self.sessions.read().await.get(tenant) {
            return Arc::clone(session);
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(tenant.to_string()).or_insert_with(|| {
            debug!(tenant, "Creating tenant session");
            Arc::new(TenantSession::new(
                Arc::clone(&self.store),
                tenant,
                &self.trace,
                &self.retention,
            ))
        }))
    }

    pub async fn get(&self, tenant: &str) -> Option<Arc<TenantSession>> {
        self.sessions.read().await.get(tenant).cloned()
    }

    pub async fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Drop sessions that are stopped, not mid-cycle, held by no caller, and
    /// idle for at least `max_idle`. Returns the evicted tenants.
    ///
    /// A session someone still holds (a cycle about to claim its guard, a
    /// status request) stays, so the tenant never ends up with two sessions
    /// and two independent `running` flags.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let mut evicted = Vec::new();
        for (tenant, session) in sessions.iter() {
            let held = Arc::strong_count(session) > 1;
            if !held
                && !session.is_active()
                && !session.is_running()
                && session.idle_for(now).await >= max_idle
            {
                evicted.push(tenant.clone());
            }
        }
        for tenant in &evicted {
            sessions.remove(tenant);
            info!(tenant = %tenant, "Evicted idle tenant session");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> TenantRegistry {
        TenantRegistry::new(
            Arc::new(MemoryStore::new()),
            TraceConfig::default(),
            RetentionConfig::default(),
        )
    }

    #[tokio::test]
    async fn sessions_are_created_once() {
        let registry = registry();
        let a = registry.get_or_create("t1").await;
        let b = registry.get_or_create("t1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.store().tenant(), "t1");
        assert_eq!(registry.tenants().await, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn cycle_guard_is_exclusive_and_released_on_drop() {
        let session = registry().get_or_create("t1").await;
        let guard = session.try_begin_cycle().unwrap();
        assert!(session.is_running());
        assert!(session.try_begin_cycle().is_none());
        drop(guard);
        assert!(!session.is_running());
        assert!(session.try_begin_cycle().is_some());
    }

    #[tokio::test]
    async fn activation_bumps_generation() {
        let session = registry().get_or_create("t1").await;
        let generation = session.activate().unwrap();
        assert!(session.activate().is_none());
        assert!(session.is_current(generation));
        assert!(session.deactivate());
        assert!(!session.is_current(generation));
        let next = session.activate().unwrap();
        assert!(next > generation);
        assert!(!session.is_current(generation));
    }

    #[tokio::test]
    async fn evicts_only_idle_stopped_sessions() {
        let registry = registry();
        registry.get_or_create("idle").await;
        let active = registry.get_or_create("active").await;
        active.activate();

        let evicted = registry.evict_idle(Duration::ZERO).await;
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert!(registry.get("idle").await.is_none());
        assert!(registry.get("active").await.is_some());

        registry.get_or_create("fresh").await;
        assert!(registry.evict_idle(Duration::from_secs(3600)).await.is_empty());
    }

    #[tokio::test]
    async fn held_session_is_not_evicted() {
        let registry = registry();
        let held = registry.get_or_create("t1").await;

        assert!(registry.evict_idle(Duration::ZERO).await.is_empty());
        let again = registry.get_or_create("t1").await;
        assert!(Arc::ptr_eq(&held, &again));

        // The cycle guard claimed through the held handle is the one every
        // later lookup sees.
        let guard = held.try_begin_cycle().unwrap();
        assert!(again.try_begin_cycle().is_none());

        drop(again);
        drop(guard);
        drop(held);
        assert_eq!(registry.evict_idle(Duration::ZERO).await, vec!["t1".to_string()]);
    }
}

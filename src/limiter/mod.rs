//! Bounded worker pools, global and per-tenant.
//!
//! The limiter guarantees that at no point more than the tenant cap's worth
//! of external processes run concurrently for one tenant, and that the total
//! across all tenants never exceeds the global pool. Excess submissions block
//! the submitter until a slot frees (backpressure, not failure).
//!
//! Pools are `tokio::sync::Semaphore`s. Resizing swaps in a fresh semaphore
//! going forward: work already holding permits on the old one completes
//! normally, only new submissions see the new size. This non-atomicity is
//! accepted by design.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Which pool a [`ConcurrencyLimiter::resize`] call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolScope {
    /// The single global pool shared by all tenants.
    Global,
    /// Every per-tenant pool, existing and future.
    PerTenant,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LimiterError {
    /// A pool semaphore was closed while a submission waited on it.
    /// Does not occur during normal operation.
    #[error("worker pool closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, LimiterError>;

/// Bounded worker pools: one global, plus lazily created per-tenant pools.
pub struct ConcurrencyLimiter {
    global: RwLock<Arc<Semaphore>>,
    tenants: DashMap<String, Arc<Semaphore>>,
    tenant_permits: AtomicUsize,
}

impl ConcurrencyLimiter {
    /// Creates a limiter with the given global and per-tenant pool sizes.
    ///
    /// Tenant pools are created on first submission for that tenant.
    pub fn new(global_permits: usize, tenant_permits: usize) -> Self {
        Self {
            global: RwLock::new(Arc::new(Semaphore::new(global_permits))),
            tenants: DashMap::new(),
            tenant_permits: AtomicUsize::new(tenant_permits),
        }
    }

    /// Queues `task` on the tenant's pool.
    ///
    /// Blocks the submitter until both a tenant permit and a global permit
    /// are available, then spawns the task holding both. Permits are released
    /// when the task finishes.
    pub async fn submit<F>(&self, tenant: &str, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let tenant_pool = self.tenant_pool(tenant);
        let tenant_permit = tenant_pool
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;

        let global_pool = Arc::clone(&*self.global.read().await);
        let global_permit = global_pool
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;

        debug!(tenant, "submission acquired pool permits");

        Ok(tokio::spawn(async move {
            // Permits ride along with the task and drop on completion.
            let _tenant_permit = tenant_permit;
            let _global_permit = global_permit;
            task.await
        }))
    }

    /// Replaces the targeted pool(s) with fresh ones of size `permits`.
    ///
    /// Already-running work keeps its permits on the old semaphore; only new
    /// submissions use the resized pool.
    pub async fn resize(&self, scope: PoolScope, permits: usize) {
        match scope {
            PoolScope::Global => {
                *self.global.write().await = Arc::new(Semaphore::new(permits));
                info!(permits, "resized global pool");
            }
            PoolScope::PerTenant => {
                self.tenant_permits.store(permits, Ordering::Relaxed);
                for mut entry in self.tenants.iter_mut() {
                    *entry.value_mut() = Arc::new(Semaphore::new(permits));
                }
                info!(permits, "resized per-tenant pools");
            }
        }
    }

    fn tenant_pool(&self, tenant: &str) -> Arc<Semaphore> {
        self.tenants
            .entry(tenant.to_string())
            .or_insert_with(|| {
                debug!(tenant, "creating tenant pool");
                Arc::new(Semaphore::new(self.tenant_permits.load(Ordering::Relaxed)))
            })
            .clone()
    }
}

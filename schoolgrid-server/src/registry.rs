//! Connection registry - process-wide map of tenant -> live pool.
//!
//! Read on every tenant-plane data access, written only when a tenant is
//! reconciled at startup or announced by the registration listener.
//!
//! - Sharded map (`DashMap`): lookups never contend with each other
//! - Registration is idempotent: the pool is opened only for a vacant slot,
//!   so a duplicate can never leak a second handle
//! - Entries are removed only through the explicit `evict` path

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use schoolgrid_core::{ConnectionDescriptor, DbKey, TenantId};
use sqlx::PgPool;

use crate::db::PoolFactory;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tenant {0} is not registered")]
    NotRegistered(TenantId),

    #[error("tenant {0} is inactive and cannot be registered")]
    Inactive(TenantId),

    #[error("failed to open pool for tenant {tenant}: {source}")]
    Open {
        tenant: TenantId,
        #[source]
        source: sqlx::Error,
    },
}

/// Outcome of [`ConnectionRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    AlreadyPresent,
}

/// One registered tenant database.
pub struct TenantHandle {
    descriptor: ConnectionDescriptor,
    pool: PgPool,
    generation: u64,
    unusable: AtomicBool,
}

impl TenantHandle {
    fn new(descriptor: ConnectionDescriptor, pool: PgPool, generation: u64) -> Self {
        Self {
            descriptor,
            pool,
            generation,
            unusable: AtomicBool::new(false),
        }
    }

    pub fn tenant(&self) -> TenantId {
        self.descriptor.tenant_id
    }

    pub fn db_key(&self) -> &DbKey {
        &self.descriptor.db_name
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Monotonic id of the pool behind this handle; changes on recycle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Flag the handle for replacement by the reaper.
    pub fn mark_unusable(&self) {
        self.unusable.store(true, Ordering::Release);
    }

    pub fn is_unusable(&self) -> bool {
        self.unusable.load(Ordering::Acquire)
    }

    pub fn needs_recycle(&self) -> bool {
        self.is_unusable() || self.pool.is_closed()
    }
}

impl fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantHandle")
            .field("tenant", &self.descriptor.tenant_id)
            .field("db_key", &self.descriptor.db_name)
            .field("generation", &self.generation)
            .field("unusable", &self.is_unusable())
            .finish()
    }
}

pub struct ConnectionRegistry {
    entries: DashMap<TenantId, Arc<TenantHandle>>,
    factory: Arc<dyn PoolFactory>,
    generations: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn PoolFactory>) -> Self {
        Self {
            entries: DashMap::new(),
            factory,
            generations: AtomicU64::new(1),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a tenant. Registering an already-registered tenant is a no-op.
    pub fn register(&self, descriptor: &ConnectionDescriptor) -> Result<Registration, RegistryError> {
        let tenant = descriptor.tenant_id;
        if !descriptor.is_active {
            return Err(RegistryError::Inactive(tenant));
        }

        match self.entries.entry(tenant) {
            Entry::Occupied(_) => {
                tracing::debug!(%tenant, db_key = %descriptor.db_name, "tenant already registered");
                Ok(Registration::AlreadyPresent)
            }
            Entry::Vacant(slot) => {
                let pool = self
                    .factory
                    .open(descriptor)
                    .map_err(|source| RegistryError::Open { tenant, source })?;
                let handle = TenantHandle::new(descriptor.clone(), pool, self.next_generation());
                slot.insert(Arc::new(handle));
                tracing::info!(%tenant, db_key = %descriptor.db_name, "tenant registered");
                Ok(Registration::Added)
            }
        }
    }

    /// Resolve the live handle for a tenant.
    pub fn resolve(&self, tenant: TenantId) -> Result<Arc<TenantHandle>, RegistryError> {
        self.entries
            .get(&tenant)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::NotRegistered(tenant))
    }

    pub fn contains(&self, tenant: TenantId) -> bool {
        self.entries.contains_key(&tenant)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered tenants, sorted.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.entries.iter().map(|e| *e.key()).collect();
        tenants.sort();
        tenants
    }

    /// Remove a tenant and close its pool in the background. Returns false
    /// if it was not registered.
    pub fn evict(&self, tenant: TenantId) -> bool {
        let Some((_, handle)) = self.entries.remove(&tenant) else {
            return false;
        };
        retire(&handle);
        tracing::warn!(%tenant, db_key = %handle.db_key(), "tenant evicted from registry");
        true
    }

    /// Replace a handle that needs recycling with a fresh pool opened from
    /// the same descriptor. Returns true if a replacement happened. The
    /// retired pool is closed in the background.
    pub fn recycle(&self, tenant: TenantId) -> Result<bool, RegistryError> {
        let retired = {
            let mut entry = self
                .entries
                .get_mut(&tenant)
                .ok_or(RegistryError::NotRegistered(tenant))?;
            if !entry.needs_recycle() {
                return Ok(false);
            }
            let pool = self
                .factory
                .open(entry.descriptor())
                .map_err(|source| RegistryError::Open { tenant, source })?;
            let fresh = TenantHandle::new(entry.descriptor().clone(), pool, self.next_generation());
            std::mem::replace(entry.value_mut(), Arc::new(fresh))
        };

        retire(&retired);
        tracing::info!(%tenant, retired_generation = retired.generation(), "tenant pool recycled");
        Ok(true)
    }
}

/// `close` waits for checked-out connections to come back, which can take
/// as long as the slowest in-flight query on that pool.
fn retire(handle: &TenantHandle) {
    let pool = handle.pool.clone();
    let tenant = handle.tenant();
    tokio::spawn(async move {
        pool.close().await;
        tracing::debug!(%tenant, "retired tenant pool closed");
    });
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("tenants", &self.tenants())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::LazyPoolFactory;
    use std::sync::atomic::AtomicUsize;

    /// Counts how many pools were opened.
    #[derive(Default)]
    pub(crate) struct CountingFactory {
        pub opened: AtomicUsize,
        inner: LazyPoolFactory,
    }

    impl PoolFactory for CountingFactory {
        fn open(&self, descriptor: &ConnectionDescriptor) -> Result<PgPool, sqlx::Error> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.inner.open(descriptor)
        }
    }

    pub(crate) fn descriptor(id: i64) -> ConnectionDescriptor {
        ConnectionDescriptor::new(
            TenantId(id),
            DbKey::parse(&format!("school_{}_db", id)).unwrap(),
            format!("school_{}", id),
            "pw",
        )
    }

    pub(crate) async fn wait_closed(pool: &PgPool) {
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !pool.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("retired pool was never closed");
    }

    fn registry() -> (Arc<CountingFactory>, ConnectionRegistry) {
        let factory = Arc::new(CountingFactory::default());
        let registry = ConnectionRegistry::new(factory.clone());
        (factory, registry)
    }

    #[tokio::test]
    async fn register_twice_keeps_one_handle() {
        let (factory, registry) = registry();

        assert_eq!(registry.register(&descriptor(1)).unwrap(), Registration::Added);
        let first = registry.resolve(TenantId(1)).unwrap();

        assert_eq!(
            registry.register(&descriptor(1)).unwrap(),
            Registration::AlreadyPresent
        );
        let second = registry.resolve(TenantId(1)).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_registered() {
        let (_, registry) = registry();
        registry.register(&descriptor(1)).unwrap();

        let err = registry.resolve(TenantId(2)).unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered(TenantId(2))));
    }

    #[tokio::test]
    async fn inactive_descriptor_is_refused() {
        let (factory, registry) = registry();
        let err = registry.register(&descriptor(3).inactive()).unwrap_err();
        assert!(matches!(err, RegistryError::Inactive(_)));
        assert!(registry.is_empty());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_registration_opens_once() {
        let (factory, registry) = registry();
        let registry = Arc::new(registry);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.register(&descriptor(5)).unwrap() })
            })
            .collect();

        let mut added = 0;
        for task in tasks {
            if task.await.unwrap() == Registration::Added {
                added += 1;
            }
        }

        assert_eq!(added, 1);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn recycle_replaces_only_unusable_handles() {
        let (factory, registry) = registry();
        registry.register(&descriptor(1)).unwrap();

        // healthy: nothing to do
        assert!(!registry.recycle(TenantId(1)).unwrap());

        let old = registry.resolve(TenantId(1)).unwrap();
        old.mark_unusable();
        assert!(registry.recycle(TenantId(1)).unwrap());

        let new = registry.resolve(TenantId(1)).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(new.generation() > old.generation());
        wait_closed(old.pool()).await;
        assert!(!new.pool().is_closed());
        assert_eq!(registry.len(), 1);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn evict_removes_and_closes() {
        let (_, registry) = registry();
        registry.register(&descriptor(1)).unwrap();
        let handle = registry.resolve(TenantId(1)).unwrap();

        assert!(registry.evict(TenantId(1)));
        assert!(registry.resolve(TenantId(1)).is_err());
        wait_closed(handle.pool()).await;
        assert!(!registry.evict(TenantId(1)));
    }
}

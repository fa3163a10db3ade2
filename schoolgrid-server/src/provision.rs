//! Tenant onboarding and suspension.
//!
//! Provisioning attaches a database to an existing `school` row. It brings
//! the new database to the tenant-plane schema,
//! records its directory row and then announces it on the registration
//! channel. Nothing routes to the tenant until the listener picks that
//! announcement up.

use std::sync::Arc;

use async_trait::async_trait;
use schoolgrid_core::{ConnectionDescriptor, CoreError, DbKey, Plane, TenantId};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::db::migrations::{migrate, MigrationError};
use crate::db::pool::connect_options;
use crate::db::{DirectoryError, TenantDirectory};
use crate::listener::ChannelPublisher;
use crate::registry::ConnectionRegistry;
use crate::routing::Target;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("tenant {0} has no directory row")]
    NotFound(TenantId),

    #[error("school {0} does not exist")]
    UnknownSchool(TenantId),

    #[error(transparent)]
    Directory(DirectoryError),

    #[error("schema setup failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("cannot reach tenant database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("publish failed: {0}")]
    Publish(String),
}

impl From<DirectoryError> for ProvisionError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Conflict(msg) => ProvisionError::Conflict(msg),
            DirectoryError::UnknownSchool(tenant) => ProvisionError::UnknownSchool(tenant),
            other => ProvisionError::Directory(other),
        }
    }
}

/// Announces a newly provisioned database key.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ProvisionError>;
}

/// `pg_notify` on the control plane.
#[derive(Clone)]
pub struct PgPublisher {
    pool: PgPool,
}

impl PgPublisher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Publisher for PgPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ProvisionError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| ProvisionError::Publish(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, _channel: &str, payload: &str) -> Result<(), ProvisionError> {
        ChannelPublisher::publish(self, payload);
        Ok(())
    }
}

/// Prepares a tenant database before its directory row exists.
#[async_trait]
pub trait TenantInitializer: Send + Sync {
    /// Returns the number of migrations applied.
    async fn initialize(&self, descriptor: &ConnectionDescriptor) -> Result<usize, ProvisionError>;
}

/// Connects with the row's own credentials and applies tenant-plane
/// migrations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigratingInitializer;

#[async_trait]
impl TenantInitializer for MigratingInitializer {
    async fn initialize(&self, descriptor: &ConnectionDescriptor) -> Result<usize, ProvisionError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options(descriptor))
            .await
            .map_err(ProvisionError::Connect)?;

        let applied = migrate(&pool, Target::Tenant(descriptor.tenant_id), Plane::TenantPlane).await;
        pool.close().await;
        Ok(applied?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub tenant_id: TenantId,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub db_host: Option<String>,
    pub db_port: Option<u16>,
}

impl ProvisionRequest {
    pub fn into_descriptor(self) -> Result<ConnectionDescriptor, ProvisionError> {
        if self.db_user.trim().is_empty() {
            return Err(CoreError::invalid("db_user", "cannot be empty").into());
        }
        let key = DbKey::parse(&self.db_name)?;
        let mut descriptor = ConnectionDescriptor::new(self.tenant_id, key, self.db_user, self.db_password);
        if let Some(host) = self.db_host {
            descriptor.db_host = host;
        }
        if let Some(port) = self.db_port {
            descriptor.db_port = port;
        }
        Ok(descriptor)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub tenant: TenantId,
    pub db_name: DbKey,
    pub migrations_applied: usize,
    /// False when the row was written but the announcement failed; the
    /// listener's reconnect resync or the next restart will pick it up.
    pub announced: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeactivateReport {
    pub tenant: TenantId,
    pub evicted: bool,
}

pub struct Provisioner {
    directory: Arc<dyn TenantDirectory>,
    registry: Arc<ConnectionRegistry>,
    initializer: Arc<dyn TenantInitializer>,
    publisher: Arc<dyn Publisher>,
    channel: String,
    evict_on_deactivate: bool,
}

impl Provisioner {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        registry: Arc<ConnectionRegistry>,
        initializer: Arc<dyn TenantInitializer>,
        publisher: Arc<dyn Publisher>,
        channel: impl Into<String>,
        evict_on_deactivate: bool,
    ) -> Self {
        Self {
            directory,
            registry,
            initializer,
            publisher,
            channel: channel.into(),
            evict_on_deactivate,
        }
    }

    pub async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionReport, ProvisionError> {
        let descriptor = request.into_descriptor()?;
        let tenant = descriptor.tenant_id;

        // Refuse before touching a database that may belong to someone else.
        if self.directory.find_school(tenant).await?.is_none() {
            return Err(ProvisionError::UnknownSchool(tenant));
        }
        if self.directory.find_by_tenant(tenant).await?.is_some() {
            return Err(ProvisionError::Conflict(format!("tenant {} is already provisioned", tenant)));
        }
        if self.directory.find_by_key(&descriptor.db_name).await?.is_some() {
            return Err(ProvisionError::Conflict(format!(
                "database '{}' is already assigned",
                descriptor.db_name
            )));
        }

        let migrations_applied = self.initializer.initialize(&descriptor).await?;
        self.directory.insert(&descriptor).await?;

        let announced = match self.publisher.publish(&self.channel, descriptor.db_name.as_str()).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%tenant, error = %err, "tenant provisioned but announcement failed");
                false
            }
        };

        tracing::info!(
            %tenant,
            db_key = %descriptor.db_name,
            migrations_applied,
            announced,
            "tenant provisioned"
        );
        Ok(ProvisionReport {
            tenant,
            db_name: descriptor.db_name,
            migrations_applied,
            announced,
        })
    }

    /// Mark a tenant inactive. Its live handle stays registered unless
    /// eviction on deactivation is enabled.
    pub async fn deactivate(&self, tenant: TenantId) -> Result<DeactivateReport, ProvisionError> {
        if !self.directory.set_active(tenant, false).await? {
            return Err(ProvisionError::NotFound(tenant));
        }

        let evicted = self.evict_on_deactivate && self.registry.evict(tenant);
        tracing::info!(%tenant, evicted, "tenant deactivated");
        Ok(DeactivateReport { tenant, evicted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDirectory;
    use crate::listener::{ChannelSource, RegistrationListener};
    use crate::registry::tests::{descriptor, CountingFactory};
    use schoolgrid_core::config::ListenerSection;
    use schoolgrid_core::Tenant;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingInitializer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TenantInitializer for CountingInitializer {
        async fn initialize(&self, _descriptor: &ConnectionDescriptor) -> Result<usize, ProvisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), ProvisionError> {
            Err(ProvisionError::Publish("notify refused".into()))
        }
    }

    fn request(id: i64, db: &str) -> ProvisionRequest {
        ProvisionRequest {
            tenant_id: TenantId(id),
            db_name: db.into(),
            db_user: format!("school_{}", id),
            db_password: "pw".into(),
            db_host: None,
            db_port: Some(6432),
        }
    }

    struct Fixture {
        directory: Arc<MemoryDirectory>,
        registry: Arc<ConnectionRegistry>,
        initializer: Arc<CountingInitializer>,
    }

    fn fixture() -> Fixture {
        let directory = MemoryDirectory::with_rows([descriptor(1)]);
        for (id, name) in [(2, "Hillside"), (4, "Lakeview"), (9, "Northgate")] {
            directory.add_school(Tenant::new(TenantId(id), name));
        }
        Fixture {
            directory: Arc::new(directory),
            registry: Arc::new(ConnectionRegistry::new(Arc::new(CountingFactory::default()))),
            initializer: Arc::new(CountingInitializer::default()),
        }
    }

    fn provisioner(fx: &Fixture, publisher: Arc<dyn Publisher>, evict: bool) -> Provisioner {
        Provisioner::new(
            fx.directory.clone(),
            Arc::clone(&fx.registry),
            fx.initializer.clone(),
            publisher,
            "new_db_created",
            evict,
        )
    }

    #[test]
    fn request_validation() {
        let descriptor = request(7, " school_7_db ").into_descriptor().unwrap();
        assert_eq!(descriptor.db_name.as_str(), "school_7_db");
        assert_eq!(descriptor.db_host, "127.0.0.1");
        assert_eq!(descriptor.db_port, 6432);

        assert!(request(7, "School-7").into_descriptor().is_err());
        let mut blank_user = request(7, "school_7_db");
        blank_user.db_user = " ".into();
        assert!(blank_user.into_descriptor().is_err());
    }

    #[tokio::test]
    async fn provisioned_tenant_is_registered_by_the_listener() {
        let fx = fixture();
        let (source, publisher) = ChannelSource::pair();
        let settings = ListenerSection {
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            ..ListenerSection::default()
        };
        let listener = RegistrationListener::new(
            Arc::new(source),
            fx.directory.clone(),
            Arc::clone(&fx.registry),
            &settings,
        )
        .spawn();
        let mut health = listener.status().watch();
        health.wait_for(|h| h.is_connected()).await.unwrap();

        let report = provisioner(&fx, Arc::new(publisher), false)
            .provision(request(9, "school_9_db"))
            .await
            .unwrap();
        assert!(report.announced);
        assert_eq!(report.migrations_applied, 3);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !fx.registry.contains(TenantId(9)) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("listener did not register provisioned tenant");
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn conflicts_are_refused_before_initializing() {
        let fx = fixture();
        let (_, publisher) = ChannelSource::pair();
        let provisioner = provisioner(&fx, Arc::new(publisher), false);

        let err = provisioner.provision(request(1, "fresh_db")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Conflict(_)));

        let err = provisioner.provision(request(2, "school_1_db")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Conflict(_)));

        assert_eq!(fx.initializer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_school_is_refused_before_initializing() {
        let fx = fixture();
        let (_, publisher) = ChannelSource::pair();

        let err = provisioner(&fx, Arc::new(publisher), false)
            .provision(request(77, "school_77_db"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownSchool(TenantId(77))));
        assert_eq!(fx.initializer.calls.load(Ordering::SeqCst), 0);
        assert!(fx.directory.find_by_tenant(TenantId(77)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_announcement_still_records_the_row() {
        let fx = fixture();
        let report = provisioner(&fx, Arc::new(FailingPublisher), false)
            .provision(request(4, "school_4_db"))
            .await
            .unwrap();
        assert!(!report.announced);
        assert!(fx.directory.find_by_tenant(TenantId(4)).await.unwrap().is_some());
        assert!(!fx.registry.contains(TenantId(4)));
    }

    #[tokio::test]
    async fn deactivation_keeps_live_handle_by_default() {
        let fx = fixture();
        fx.registry.register(&descriptor(1)).unwrap();
        let (_, publisher) = ChannelSource::pair();

        let report = provisioner(&fx, Arc::new(publisher), false)
            .deactivate(TenantId(1))
            .await
            .unwrap();
        assert!(!report.evicted);
        assert!(fx.registry.contains(TenantId(1)));

        let row = fx.directory.find_by_tenant(TenantId(1)).await.unwrap().unwrap();
        assert!(!row.is_active);
    }

    #[tokio::test]
    async fn deactivation_evicts_when_configured() {
        let fx = fixture();
        fx.registry.register(&descriptor(1)).unwrap();
        let (_, publisher) = ChannelSource::pair();
        let provisioner = provisioner(&fx, Arc::new(publisher), true);

        let report = provisioner.deactivate(TenantId(1)).await.unwrap();
        assert!(report.evicted);
        assert!(!fx.registry.contains(TenantId(1)));

        let err = provisioner.deactivate(TenantId(42)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(TenantId(42))));
    }

    // Integration tests require a real database
    // Run with: DATABASE_URL=postgres://... cargo test -p schoolgrid-server -- --ignored

    #[tokio::test]
    #[ignore = "requires database"]
    async fn missing_school_row_never_reaches_the_tenant_database() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::db::create_pool_with_options(&url, 2).await.unwrap();
        migrate(&pool, Target::ControlPlane, Plane::ControlPlane).await.unwrap();

        let initializer = Arc::new(CountingInitializer::default());
        let (_, publisher) = ChannelSource::pair();
        let provisioner = Provisioner::new(
            Arc::new(crate::db::PgTenantDirectory::new(pool)),
            Arc::new(ConnectionRegistry::new(Arc::new(CountingFactory::default()))),
            initializer.clone(),
            Arc::new(publisher),
            "new_db_created",
            false,
        );

        let missing = TenantId(i64::MAX - 2);
        let err = provisioner
            .provision(request(missing.get(), "never_created_db"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownSchool(t) if t == missing));
        assert_eq!(initializer.calls.load(Ordering::SeqCst), 0);
    }
}

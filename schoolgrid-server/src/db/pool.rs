//! Connection pool construction.
//!
//! The control plane gets one eagerly connected pool. Tenant pools are opened
//! through a [`PoolFactory`] from each tenant's own directory row.

use std::sync::Arc;

use schoolgrid_core::config::TenantPoolSection;
use schoolgrid_core::ConnectionDescriptor;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

/// Create the control-plane connection pool with a custom size.
pub async fn create_pool_with_options(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Connect options for one tenant database, taken verbatim from its row.
pub fn connect_options(descriptor: &ConnectionDescriptor) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&descriptor.db_host)
        .port(descriptor.db_port)
        .username(&descriptor.db_user)
        .password(&descriptor.db_password)
        .database(descriptor.db_name.as_str())
}

/// Opens the handle for one tenant database.
///
/// Called while the registry holds the slot for that tenant, so it must not
/// block on I/O.
pub trait PoolFactory: Send + Sync {
    fn open(&self, descriptor: &ConnectionDescriptor) -> Result<PgPool, sqlx::Error>;
}

impl<F: PoolFactory + ?Sized> PoolFactory for Arc<F> {
    fn open(&self, descriptor: &ConnectionDescriptor) -> Result<PgPool, sqlx::Error> {
        (**self).open(descriptor)
    }
}

/// Builds lazy pools: no connection is made until the first query.
///
/// Idle connections past `idle_timeout` and any connection past
/// `max_lifetime` are closed by the pool's own maintenance task.
#[derive(Debug, Clone)]
pub struct LazyPoolFactory {
    settings: TenantPoolSection,
}

impl LazyPoolFactory {
    pub fn new(settings: TenantPoolSection) -> Self {
        Self { settings }
    }
}

impl Default for LazyPoolFactory {
    fn default() -> Self {
        Self::new(TenantPoolSection::default())
    }
}

impl PoolFactory for LazyPoolFactory {
    fn open(&self, descriptor: &ConnectionDescriptor) -> Result<PgPool, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .idle_timeout(self.settings.idle_timeout())
            .max_lifetime(self.settings.max_lifetime())
            .acquire_timeout(self.settings.acquire_timeout())
            .connect_lazy_with(connect_options(descriptor));
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schoolgrid_core::{DbKey, TenantId};

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new(
            TenantId(9),
            DbKey::parse("riverside_9_db").unwrap(),
            "riverside",
            "s3cret",
        )
        .with_host("10.0.0.9", 6432)
    }

    #[test]
    fn options_come_from_descriptor() {
        let options = connect_options(&descriptor());
        assert_eq!(options.get_host(), "10.0.0.9");
        assert_eq!(options.get_port(), 6432);
        assert_eq!(options.get_username(), "riverside");
        assert_eq!(options.get_database(), Some("riverside_9_db"));
    }

    #[tokio::test]
    async fn lazy_factory_does_not_connect() {
        // Nothing listens on this address; a lazy pool must still open.
        let pool = LazyPoolFactory::default().open(&descriptor()).unwrap();
        assert_eq!(pool.size(), 0);
        assert!(!pool.is_closed());
    }

    // Integration tests require a real database
    // Run with: DATABASE_URL=postgres://... cargo test -p schoolgrid-server -- --ignored

    #[tokio::test]
    #[ignore = "requires database"]
    async fn pool_acquires_connection() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool_with_options(&url, 2).await.expect("pool creation failed");

        let result: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("query failed");

        assert_eq!(result.0, 1);
    }
}

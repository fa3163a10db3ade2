//! Tenant directory - the control-plane source of truth for how to reach each
//! tenant database.
//!
//! Backed by the `school` and `school_db_metadata` tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schoolgrid_core::{ConnectionDescriptor, DbKey, Tenant, TenantId};
use sqlx::{PgPool, Row};

/// Directory / principal store error type
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("directory row for tenant {tenant} is corrupt: {reason}")]
    Corrupt { tenant: i64, reason: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("school {0} does not exist")]
    UnknownSchool(TenantId),

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Every descriptor with `is_active = true`.
    async fn active_descriptors(&self) -> Result<Vec<ConnectionDescriptor>, DirectoryError>;

    /// Look a descriptor up by its logical database name, active or not.
    async fn find_by_key(&self, key: &DbKey) -> Result<Option<ConnectionDescriptor>, DirectoryError>;

    /// Look a descriptor up by tenant, active or not.
    async fn find_by_tenant(
        &self,
        tenant: TenantId,
    ) -> Result<Option<ConnectionDescriptor>, DirectoryError>;

    /// The `school` record itself, if it exists.
    async fn find_school(&self, tenant: TenantId) -> Result<Option<Tenant>, DirectoryError>;

    /// Insert a new row. Fails with `Conflict` if the tenant or the database
    /// name is already present, and with `UnknownSchool` if there is no
    /// `school` row to attach it to.
    async fn insert(&self, descriptor: &ConnectionDescriptor) -> Result<(), DirectoryError>;

    /// Flip the active flag. Returns false if the tenant has no row.
    async fn set_active(&self, tenant: TenantId, active: bool) -> Result<bool, DirectoryError>;
}

/// Postgres implementation over the control-plane pool.
#[derive(Clone)]
pub struct PgTenantDirectory {
    pool: PgPool,
}

impl PgTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_DESCRIPTOR: &str = r#"
    SELECT school_id, db_name, db_user, db_password, db_host, db_port,
           is_active, created_at, updated_at
    FROM school_db_metadata
"#;

/// A `school_db_metadata` row as stored, before validation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DescriptorRow {
    pub school_id: i64,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub db_host: String,
    pub db_port: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DescriptorRow> for ConnectionDescriptor {
    type Error = DirectoryError;

    fn try_from(row: DescriptorRow) -> Result<Self, Self::Error> {
        let tenant = row.school_id;
        let db_name = DbKey::parse(&row.db_name).map_err(|e| DirectoryError::Corrupt {
            tenant,
            reason: e.to_string(),
        })?;
        let db_port = u16::try_from(row.db_port).map_err(|_| DirectoryError::Corrupt {
            tenant,
            reason: format!("port {} out of range", row.db_port),
        })?;

        Ok(ConnectionDescriptor {
            tenant_id: TenantId(tenant),
            db_name,
            db_user: row.db_user,
            db_password: row.db_password,
            db_host: row.db_host,
            db_port,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Validate a scan of rows. A corrupt row is logged and skipped so the rest
/// of the directory stays reachable.
pub fn keep_valid(rows: Vec<DescriptorRow>) -> Vec<ConnectionDescriptor> {
    let total = rows.len();
    let valid: Vec<ConnectionDescriptor> = rows
        .into_iter()
        .filter_map(|row| match ConnectionDescriptor::try_from(row) {
            Ok(descriptor) => Some(descriptor),
            Err(err) => {
                tracing::warn!(error = %err, "skipping corrupt directory row");
                None
            }
        })
        .collect();

    let skipped = total - valid.len();
    if skipped > 0 {
        tracing::warn!(skipped, usable = valid.len(), "tenant directory scan skipped corrupt rows");
    }
    valid
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn active_descriptors(&self) -> Result<Vec<ConnectionDescriptor>, DirectoryError> {
        let sql = format!("{} WHERE is_active = TRUE ORDER BY school_id", SELECT_DESCRIPTOR);
        let rows = sqlx::query_as::<_, DescriptorRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(keep_valid(rows))
    }

    async fn find_by_key(&self, key: &DbKey) -> Result<Option<ConnectionDescriptor>, DirectoryError> {
        let sql = format!("{} WHERE db_name = $1", SELECT_DESCRIPTOR);
        let row = sqlx::query_as::<_, DescriptorRow>(&sql)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ConnectionDescriptor::try_from).transpose()
    }

    async fn find_by_tenant(
        &self,
        tenant: TenantId,
    ) -> Result<Option<ConnectionDescriptor>, DirectoryError> {
        let sql = format!("{} WHERE school_id = $1", SELECT_DESCRIPTOR);
        let row = sqlx::query_as::<_, DescriptorRow>(&sql)
            .bind(tenant.get())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ConnectionDescriptor::try_from).transpose()
    }

    async fn find_school(&self, tenant: TenantId) -> Result<Option<Tenant>, DirectoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, is_active, school_admin_id, created_at, updated_at
            FROM school
            WHERE id = $1
            "#,
        )
        .bind(tenant.get())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Tenant {
            id: TenantId(row.try_get("id")?),
            name: row.try_get("name")?,
            is_active: row.try_get("is_active")?,
            owner_id: row.try_get("school_admin_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn insert(&self, descriptor: &ConnectionDescriptor) -> Result<(), DirectoryError> {
        // Rely on the unique constraints, no check-then-insert
        let result = sqlx::query(
            r#"
            INSERT INTO school_db_metadata
                (school_id, db_name, db_user, db_password, db_host, db_port, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(descriptor.tenant_id.get())
        .bind(descriptor.db_name.as_str())
        .bind(&descriptor.db_user)
        .bind(&descriptor.db_password)
        .bind(&descriptor.db_host)
        .bind(i32::from(descriptor.db_port))
        .bind(descriptor.is_active)
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                DirectoryError::UnknownSchool(descriptor.tenant_id)
            }
            _ => DirectoryError::Sqlx(err),
        })?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::Conflict(format!(
                "tenant {} or database '{}' already has a directory row",
                descriptor.tenant_id, descriptor.db_name
            )));
        }
        Ok(())
    }

    async fn set_active(&self, tenant: TenantId, active: bool) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            "UPDATE school_db_metadata SET is_active = $2, updated_at = NOW() WHERE school_id = $1",
        )
        .bind(tenant.get())
        .bind(active)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

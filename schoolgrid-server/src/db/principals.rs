//! Principal lookup for the authentication stage.

use async_trait::async_trait;
use schoolgrid_core::TenantId;
use serde::Serialize;
use sqlx::{PgPool, Row};

use super::directory::DirectoryError;

/// An authenticated caller as recorded in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: i64,
    pub user_name: String,
    pub is_active: bool,
    /// Global operator, not bound to any single school.
    pub is_operator: bool,
    /// School bound to the account when it was created.
    pub tenant: Option<TenantId>,
}

impl Principal {
    pub fn member(id: i64, user_name: impl Into<String>, tenant: TenantId) -> Self {
        Self {
            id,
            user_name: user_name.into(),
            is_active: true,
            is_operator: false,
            tenant: Some(tenant),
        }
    }

    pub fn operator(id: i64, user_name: impl Into<String>) -> Self {
        Self {
            id,
            user_name: user_name.into(),
            is_active: true,
            is_operator: true,
            tenant: None,
        }
    }
}

#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn find(&self, user_id: i64) -> Result<Option<Principal>, DirectoryError>;
}

/// Reads `auth_user` on the control plane.
#[derive(Clone)]
pub struct PgPrincipalStore {
    pool: PgPool,
}

impl PgPrincipalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PrincipalStore for PgPrincipalStore {
    async fn find(&self, user_id: i64) -> Result<Option<Principal>, DirectoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_name, is_active, is_superuser, school_id
            FROM auth_user
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Principal {
            id: row.try_get("id")?,
            user_name: row.try_get("user_name")?,
            is_active: row.try_get("is_active")?,
            is_operator: row.try_get("is_superuser")?,
            tenant: row.try_get::<Option<i64>, _>("school_id")?.map(TenantId),
        }))
    }
}

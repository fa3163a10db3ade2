//! Schema migrations for both planes.
//!
//! Control-plane tables only ever go to the control-plane database and
//! tenant-plane tables only ever go to tenant databases. A newly provisioned
//! tenant is brought to the current tenant-plane schema before its first
//! notification is published.

use schoolgrid_core::Plane;
use sqlx::{Executor, PgPool};

use crate::routing::{allow_migrate, Target};

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("{plane} migrations may not run against {target}")]
    Refused { plane: Plane, target: Target },
}

const LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS schoolgrid_migrations (
    version BIGINT PRIMARY KEY,
    plane TEXT NOT NULL,
    name TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CONTROL_PLANE: &[Migration] = &[
    Migration {
        version: 1,
        name: "auth",
        sql: r#"
        CREATE TABLE IF NOT EXISTS auth_role (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(50) NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS auth_user (
            id BIGSERIAL PRIMARY KEY,
            user_name VARCHAR(100) NOT NULL UNIQUE,
            email TEXT NOT NULL DEFAULT '',
            password TEXT NOT NULL DEFAULT '',
            role_id BIGINT REFERENCES auth_role(id) ON DELETE SET NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            is_staff BOOLEAN NOT NULL DEFAULT FALSE,
            is_superuser BOOLEAN NOT NULL DEFAULT FALSE,
            school_id BIGINT,
            full_name TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    },
    Migration {
        version: 2,
        name: "tenant_directory",
        sql: r#"
        CREATE TABLE IF NOT EXISTS school (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            address TEXT NOT NULL DEFAULT '',
            school_admin_id BIGINT REFERENCES auth_user(id) ON DELETE CASCADE,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS school_db_metadata (
            id BIGSERIAL PRIMARY KEY,
            school_id BIGINT NOT NULL UNIQUE REFERENCES school(id) ON DELETE CASCADE,
            db_name VARCHAR(255) NOT NULL UNIQUE,
            db_user VARCHAR(100) NOT NULL,
            db_password VARCHAR(100) NOT NULL,
            db_host VARCHAR(100) NOT NULL DEFAULT '127.0.0.1',
            db_port INTEGER NOT NULL DEFAULT 5432,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    },
];

pub const TENANT_PLANE: &[Migration] = &[
    Migration {
        version: 1,
        name: "academics",
        sql: r#"
        CREATE TABLE IF NOT EXISTS academic_years (
            id BIGSERIAL PRIMARY KEY,
            label TEXT NOT NULL UNIQUE,
            starts_on DATE NOT NULL,
            ends_on DATE NOT NULL,
            is_current BOOLEAN NOT NULL DEFAULT FALSE
        );
        CREATE TABLE IF NOT EXISTS classes (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS sections (
            id BIGSERIAL PRIMARY KEY,
            class_id BIGINT NOT NULL REFERENCES classes(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            UNIQUE (class_id, name)
        );
        "#,
    },
    Migration {
        version: 2,
        name: "people",
        sql: r#"
        CREATE TABLE IF NOT EXISTS teachers (
            id BIGSERIAL PRIMARY KEY,
            user_id BIGINT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS students (
            id BIGSERIAL PRIMARY KEY,
            section_id BIGINT REFERENCES sections(id) ON DELETE SET NULL,
            full_name TEXT NOT NULL,
            roll_number TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS attendance (
            id BIGSERIAL PRIMARY KEY,
            student_id BIGINT NOT NULL REFERENCES students(id) ON DELETE CASCADE,
            day DATE NOT NULL,
            present BOOLEAN NOT NULL,
            UNIQUE (student_id, day)
        );
        "#,
    },
];

pub fn migrations_for(plane: Plane) -> &'static [Migration] {
    match plane {
        Plane::ControlPlane => CONTROL_PLANE,
        Plane::TenantPlane => TENANT_PLANE,
    }
}

/// Apply every pending migration of `plane` to `pool`, which must be the
/// connection for `target`. Returns the number of migrations applied.
///
/// Runs in one transaction; already-recorded versions are skipped.
pub async fn migrate(pool: &PgPool, target: Target, plane: Plane) -> Result<usize, MigrationError> {
    if !allow_migrate(target, plane) {
        return Err(MigrationError::Refused { plane, target });
    }

    let mut tx = pool.begin().await?;
    (&mut *tx).execute(sqlx::raw_sql(LEDGER)).await?;

    let mut applied = 0;
    for migration in migrations_for(plane) {
        let (done,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM schoolgrid_migrations WHERE version = $1)")
                .bind(migration.version)
                .fetch_one(&mut *tx)
                .await?;
        if done {
            continue;
        }

        tracing::info!(%target, %plane, version = migration.version, name = migration.name, "applying migration");
        (&mut *tx).execute(sqlx::raw_sql(migration.sql)).await?;
        sqlx::query("INSERT INTO schoolgrid_migrations (version, plane, name) VALUES ($1, $2, $3)")
            .bind(migration.version)
            .bind(plane.to_string())
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        applied += 1;
    }

    tx.commit().await?;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schoolgrid_core::TenantId;
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn versions_are_strictly_increasing() {
        for plane in [Plane::ControlPlane, Plane::TenantPlane] {
            let versions: Vec<i64> = migrations_for(plane).iter().map(|m| m.version).collect();
            assert!(versions.windows(2).all(|w| w[0] < w[1]), "{:?}", versions);
        }
    }

    #[test]
    fn directory_tables_live_on_control_plane_only() {
        let tenant_sql: String = TENANT_PLANE.iter().map(|m| m.sql).collect();
        assert!(!tenant_sql.contains("school_db_metadata"));
        assert!(!tenant_sql.contains("auth_user ("));
    }

    #[tokio::test]
    async fn mismatched_plane_is_refused_before_touching_the_pool() {
        // Lazy pool to nowhere; the refusal must happen before any I/O.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://nobody@127.0.0.1:1/nothing")
            .unwrap();

        let err = migrate(&pool, Target::ControlPlane, Plane::TenantPlane)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Refused { .. }));

        let err = migrate(&pool, Target::Tenant(TenantId(1)), Plane::ControlPlane)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Refused { .. }));
    }
}

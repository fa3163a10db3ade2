//! Query router.
//!
//! Decides, per data access, which physical database a module's entities
//! live in:
//!
//! 1. control-plane modules always go to the control-plane pool, whatever
//!    the request is bound to
//! 2. tenant-plane modules go to the bound tenant's registered pool
//! 3. an unbound tenant-plane access follows [`MissingContextPolicy`]
//! 4. an unregistered tenant is a distinct error, never a fallback
//!
//! A [`RoutingContext`] is built per request from the request's
//! [`TenantScope`]; it is handed to domain services instead of ambient state.

use std::fmt;
use std::sync::{Arc, Mutex};

use schoolgrid_core::{MissingContextPolicy, Module, Plane, PlaneEntity, TenantId, TenantScope};
use serde::Serialize;
use sqlx::PgPool;

use crate::registry::{ConnectionRegistry, RegistryError, TenantHandle};

/// Physical database a data access resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "tenant", rename_all = "snake_case")]
pub enum Target {
    ControlPlane,
    Tenant(TenantId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::ControlPlane => f.write_str("control-plane"),
            Target::Tenant(id) => write!(f, "tenant {}", id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("{module} data requires a tenant, but the request is not bound to one")]
    MissingContext { module: Module },

    #[error("tenant {0} is not provisioned or not reachable")]
    NotRegistered(TenantId),

    #[error("cannot relate objects on {left} and {right}")]
    CrossTenantRelation { left: Target, right: Target },

    #[error("request data names tenant {claimed}, but the caller is bound to {bound}")]
    TenantMismatch { claimed: TenantId, bound: TenantScope },
}

impl From<RegistryError> for RoutingError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotRegistered(id) | RegistryError::Inactive(id) => Self::NotRegistered(id),
            RegistryError::Open { tenant, .. } => Self::NotRegistered(tenant),
        }
    }
}

/// A resolved connection for one data access.
#[derive(Debug, Clone)]
pub struct RoutedConnection {
    target: Target,
    pool: PgPool,
    handle: Option<Arc<TenantHandle>>,
}

impl RoutedConnection {
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Connections handed out while serving one request; drained by the reaper.
#[derive(Debug, Clone, Default)]
pub struct TouchedConnections {
    inner: Arc<Mutex<Vec<RoutedConnection>>>,
}

impl TouchedConnections {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, conn: &RoutedConnection) {
        if let Ok(mut touched) = self.inner.lock() {
            if !touched.iter().any(|t| t.target == conn.target) {
                touched.push(conn.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every recorded connection, leaving the ledger empty.
    pub fn drain(&self) -> Vec<RoutedConnection> {
        self.inner
            .lock()
            .map(|mut touched| std::mem::take(&mut *touched))
            .unwrap_or_default()
    }
}

/// Whether migrations for `plane` may run against `target`.
pub fn allow_migrate(target: Target, plane: Plane) -> bool {
    match (target, plane) {
        (Target::ControlPlane, Plane::ControlPlane) => true,
        (Target::Tenant(_), Plane::TenantPlane) => true,
        _ => false,
    }
}

/// Connection-level failures that make a pool worth replacing.
fn is_connection_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
    )
}

#[derive(Clone)]
pub struct RoutingContext {
    registry: Arc<ConnectionRegistry>,
    control_plane: PgPool,
    scope: TenantScope,
    policy: MissingContextPolicy,
    touched: TouchedConnections,
}

impl RoutingContext {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        control_plane: PgPool,
        scope: TenantScope,
        policy: MissingContextPolicy,
        touched: TouchedConnections,
    ) -> Self {
        Self {
            registry,
            control_plane,
            scope,
            policy,
            touched,
        }
    }

    pub fn scope(&self) -> TenantScope {
        self.scope
    }

    pub fn policy(&self) -> MissingContextPolicy {
        self.policy
    }

    /// Which database `module` resolves to, without taking a handle.
    pub fn target_for(&self, module: Module) -> Result<Target, RoutingError> {
        if module.plane() == Plane::ControlPlane {
            return Ok(Target::ControlPlane);
        }
        // operators are bound to the control plane, not to a school
        if let Some(id) = self.scope.tenant() {
            return Ok(Target::Tenant(id));
        }
        match self.policy {
            MissingContextPolicy::Reject => Err(RoutingError::MissingContext { module }),
            MissingContextPolicy::ControlPlane => Ok(Target::ControlPlane),
        }
    }

    /// Resolve the connection for a data access on `module`.
    pub fn route(&self, module: Module) -> Result<RoutedConnection, RoutingError> {
        let conn = match self.target_for(module)? {
            Target::ControlPlane => RoutedConnection {
                target: Target::ControlPlane,
                pool: self.control_plane.clone(),
                handle: None,
            },
            Target::Tenant(id) => {
                let handle = self.registry.resolve(id).map_err(|err| {
                    tracing::warn!(tenant = %id, %module, "tenant-plane access to unregistered tenant");
                    RoutingError::from(err)
                })?;
                RoutedConnection {
                    target: Target::Tenant(id),
                    pool: handle.pool().clone(),
                    handle: Some(handle),
                }
            }
        };
        self.touched.record(&conn);
        Ok(conn)
    }

    pub fn route_entity<E: PlaneEntity>(&self) -> Result<RoutedConnection, RoutingError> {
        self.route(E::MODULE)
    }

    /// Two objects may be related only if they live on the same database.
    pub fn allow_relation(
        &self,
        left: &RoutedConnection,
        right: &RoutedConnection,
    ) -> Result<(), RoutingError> {
        if left.target == right.target {
            Ok(())
        } else {
            Err(RoutingError::CrossTenantRelation {
                left: left.target,
                right: right.target,
            })
        }
    }

    /// Check a client-supplied school id against the bound scope. The value
    /// is advisory only; it can never select a database.
    pub fn cross_check(&self, claimed: Option<TenantId>) -> Result<(), RoutingError> {
        let Some(claimed) = claimed else {
            return Ok(());
        };
        if self.scope.tenant() == Some(claimed) {
            return Ok(());
        }
        Err(RoutingError::TenantMismatch {
            claimed,
            bound: self.scope,
        })
    }

    /// Report a failed query so a broken tenant pool gets recycled after the
    /// response.
    pub fn report_error(&self, conn: &RoutedConnection, err: &sqlx::Error) {
        if !is_connection_failure(err) {
            return;
        }
        match &conn.handle {
            Some(handle) => {
                tracing::warn!(tenant = %handle.tenant(), error = %err, "tenant connection failure");
                handle.mark_unusable();
            }
            None => tracing::error!(error = %err, "control-plane connection failure"),
        }
    }
}

impl fmt::Debug for RoutingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingContext")
            .field("scope", &self.scope)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Used by the reaper to find the registry entry behind a touched connection.
pub(crate) fn handle_of(conn: &RoutedConnection) -> Option<&Arc<TenantHandle>> {
    conn.handle.as_ref()
}

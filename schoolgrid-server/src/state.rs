//! Application state shared across handlers and request stages

use std::sync::Arc;

use schoolgrid_core::{MissingContextPolicy, TenantScope};
use sqlx::PgPool;

use crate::auth::{Authenticator, TokenKeys};
use crate::db::{PrincipalStore, TenantDirectory};
use crate::listener::ListenerStatus;
use crate::provision::Provisioner;
use crate::reaper::ConnectionReaper;
use crate::reconciler::StartupReconciler;
use crate::registry::ConnectionRegistry;
use crate::routing::{RoutingContext, TouchedConnections};

/// Everything the request pipeline is built from.
pub struct Platform {
    pub control_plane: PgPool,
    pub directory: Arc<dyn TenantDirectory>,
    pub principals: Arc<dyn PrincipalStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub keys: TokenKeys,
    pub policy: MissingContextPolicy,
    pub provisioner: Arc<Provisioner>,
    pub listener: Option<ListenerStatus>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    control_plane: PgPool,
    registry: Arc<ConnectionRegistry>,
    authenticator: Authenticator,
    reconciler: Arc<StartupReconciler>,
    reaper: ConnectionReaper,
    provisioner: Arc<Provisioner>,
    policy: MissingContextPolicy,
    listener: Option<ListenerStatus>,
}

impl AppState {
    pub fn new(platform: Platform) -> Self {
        let Platform {
            control_plane,
            directory,
            principals,
            registry,
            keys,
            policy,
            provisioner,
            listener,
        } = platform;

        Self {
            inner: Arc::new(AppStateInner {
                authenticator: Authenticator::new(keys, principals, Arc::clone(&directory)),
                reconciler: Arc::new(StartupReconciler::new(directory, Arc::clone(&registry))),
                reaper: ConnectionReaper::new(Arc::clone(&registry)),
                control_plane,
                registry,
                provisioner,
                policy,
                listener,
            }),
        }
    }

    pub fn control_plane(&self) -> &PgPool {
        &self.inner.control_plane
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.authenticator
    }

    pub fn reconciler(&self) -> &Arc<StartupReconciler> {
        &self.inner.reconciler
    }

    pub fn reaper(&self) -> &ConnectionReaper {
        &self.inner.reaper
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.inner.provisioner
    }

    pub fn policy(&self) -> MissingContextPolicy {
        self.inner.policy
    }

    pub fn listener(&self) -> Option<&ListenerStatus> {
        self.inner.listener.as_ref()
    }

    /// Router for one request bound to `scope`.
    pub fn routing_context(&self, scope: TenantScope, touched: TouchedConnections) -> RoutingContext {
        RoutingContext::new(
            Arc::clone(&self.inner.registry),
            self.inner.control_plane.clone(),
            scope,
            self.inner.policy,
            touched,
        )
    }
}

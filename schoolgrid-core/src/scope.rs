//! Request-scoped tenant binding.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tenant::TenantId;

/// The tenant a single request is bound to.
///
/// Set once by the authentication stage and never mutated for the rest of the
/// request. Holds at most one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tenant", rename_all = "snake_case")]
pub enum TenantScope {
    /// No principal resolved (exempt route, or nothing bound yet).
    Unbound,
    /// Global operator: bound to the control plane, never to a tenant.
    Operator,
    /// Normal principal bound to one school.
    Tenant(TenantId),
}

impl TenantScope {
    pub fn tenant(&self) -> Option<TenantId> {
        match self {
            TenantScope::Tenant(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_operator(&self) -> bool {
        matches!(self, TenantScope::Operator)
    }
}

impl Default for TenantScope {
    fn default() -> Self {
        TenantScope::Unbound
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantScope::Unbound => f.write_str("unbound"),
            TenantScope::Operator => f.write_str("operator"),
            TenantScope::Tenant(id) => write!(f, "tenant:{}", id),
        }
    }
}

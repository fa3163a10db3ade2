//! schoolgrid-core: shared types for the multi-tenant routing layer.

pub mod config;
pub mod error;
pub mod plane;
pub mod scope;
pub mod tenant;

pub use config::{MissingContextPolicy, PlatformConfig, DEFAULT_CHANNEL};
pub use error::{CoreError, Result};
pub use plane::{Module, Plane, PlaneEntity};
pub use scope::TenantScope;
pub use tenant::{ConnectionDescriptor, DbKey, Tenant, TenantId, DEFAULT_DB_HOST, DEFAULT_DB_PORT};

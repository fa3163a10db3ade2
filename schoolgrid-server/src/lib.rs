//! schoolgrid-server: multi-tenant connection routing for the school
//! management platform.
//!
//! One control-plane database holds identity, billing and the tenant
//! directory; every school has its own database. This crate decides, per
//! request and per data access, which of those databases is touched:
//!
//! - [`registry`] keeps one live pool per reachable school
//! - [`reconciler`] fills it from the directory before tenant traffic
//! - [`listener`] grows it at runtime from provisioning announcements
//! - [`auth`] binds each request to exactly one tenant scope
//! - [`routing`] maps each data access to a physical database
//! - [`reaper`] recycles broken tenant pools after each response

pub mod auth;
pub mod db;
pub mod http;
pub mod listener;
pub mod provision;
pub mod reaper;
pub mod reconciler;
pub mod registry;
pub mod routing;
pub mod state;

pub use http::{build_router, run_server, ApiError, ServerConfig, ServerError};
pub use registry::{ConnectionRegistry, Registration, RegistryError};
pub use routing::{RoutingContext, RoutingError, Target};
pub use state::{AppState, Platform};

//! API error type with IntoResponse
//!
//! Every failure leaves the service as `{ "error": <code>, "message": <text> }`.
//! Internal details are logged, never returned.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use schoolgrid_core::TenantId;
use serde_json::json;

use crate::auth::AuthError;
use crate::db::DirectoryError;
use crate::provision::ProvisionError;
use crate::reconciler::SetupError;
use crate::registry::RegistryError;
use crate::routing::RoutingError;

/// API error type with automatic HTTP status mapping
#[derive(Debug)]
pub enum ApiError {
    /// Startup reconciliation failed (500, retried by the next request)
    Setup(String),

    /// Missing, invalid or expired token (401)
    NotAuthenticated(String),

    /// Principal has no usable tenant, or the request is unbound (400)
    TenantBinding(String),

    /// Tenant is not provisioned or not reachable yet (503)
    TenantNotRegistered(TenantId),

    /// Authenticated but not allowed (403)
    Forbidden { reason: String },

    /// Request body failed validation (400)
    Validation(String),

    /// Already exists (409)
    Conflict(String),

    /// Resource not found (404)
    NotFound { resource: &'static str, id: String },

    /// Route belongs to another service (501)
    NotImplemented(&'static str),

    /// Internal error (500)
    Internal { message: String },
}

impl ApiError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl ToString) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Setup(_) | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotAuthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::TenantBinding(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::TenantNotRegistered(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup_error",
            Self::NotAuthenticated(_) => "not_authenticated",
            Self::TenantBinding(_) => "tenant_binding",
            Self::TenantNotRegistered(_) => "tenant_not_registered",
            Self::Forbidden { .. } => "forbidden",
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::NotImplemented(_) => "not_implemented",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Setup(detail) => {
                tracing::error!("Setup error: {}", detail);
                "tenant registry is not ready, retry shortly".to_string()
            }
            Self::Internal { message } => {
                // Log the actual error, return generic message
                tracing::error!("Internal error: {}", message);
                "an internal error occurred".to_string()
            }
            Self::NotAuthenticated(m) | Self::TenantBinding(m) | Self::Validation(m) | Self::Conflict(m) => {
                m.clone()
            }
            Self::TenantNotRegistered(tenant) => {
                format!("school {} is not provisioned or not reachable", tenant)
            }
            Self::Forbidden { reason } => reason.clone(),
            Self::NotFound { resource, id } => format!("{} '{}' not found", resource, id),
            Self::NotImplemented(what) => format!("{} is not served by this service", what),
        };

        let body = json!({
            "error": self.code(),
            "message": message,
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingToken
            | AuthError::InvalidToken(_)
            | AuthError::UnknownPrincipal
            | AuthError::InactivePrincipal => Self::NotAuthenticated(e.to_string()),
            AuthError::NoTenantBinding | AuthError::UnknownTenant(_) => Self::TenantBinding(e.to_string()),
            AuthError::Store(err) => Self::internal(err),
        }
    }
}

impl From<RoutingError> for ApiError {
    fn from(e: RoutingError) -> Self {
        match e {
            RoutingError::MissingContext { .. } => Self::TenantBinding(e.to_string()),
            RoutingError::NotRegistered(tenant) => Self::TenantNotRegistered(tenant),
            RoutingError::CrossTenantRelation { .. } | RoutingError::TenantMismatch { .. } => {
                Self::forbidden(e.to_string())
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        RoutingError::from(e).into()
    }
}

impl From<SetupError> for ApiError {
    fn from(e: SetupError) -> Self {
        Self::Setup(e.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Conflict(msg) => Self::Conflict(msg),
            DirectoryError::UnknownSchool(tenant) => Self::NotFound {
                resource: "school",
                id: tenant.to_string(),
            },
            other => Self::internal(other),
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(e: ProvisionError) -> Self {
        match e {
            ProvisionError::Invalid(err) => Self::Validation(err.to_string()),
            ProvisionError::Conflict(msg) => Self::Conflict(msg),
            ProvisionError::NotFound(tenant) | ProvisionError::UnknownSchool(tenant) => Self::NotFound {
                resource: "school",
                id: tenant.to_string(),
            },
            ProvisionError::Directory(err) => err.into(),
            other => Self::internal(other),
        }
    }
}

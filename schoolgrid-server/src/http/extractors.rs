//! Custom Axum extractors

use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use schoolgrid_core::{TenantId, TenantScope};

use super::error::ApiError;
use crate::db::Principal;
use crate::routing::{RoutingContext, TouchedConnections};
use crate::state::AppState;

/// The request's query router, bound to the scope the authentication stage
/// wrote. A request that never passed that stage is `Unbound`.
impl FromRequestParts<AppState> for RoutingContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let scope = parts.extensions.get::<TenantScope>().copied().unwrap_or_default();
        let touched = parts
            .extensions
            .get::<TouchedConnections>()
            .cloned()
            .unwrap_or_default();
        Ok(state.routing_context(scope, touched))
    }
}

/// The authenticated caller.
pub struct CurrentPrincipal(pub Principal);

impl<S> FromRequestParts<S> for CurrentPrincipal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(Self)
            .ok_or_else(|| ApiError::NotAuthenticated("authentication required".into()))
    }
}

/// An authenticated global operator.
pub struct Operator(pub Principal);

impl<S> FromRequestParts<S> for Operator
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentPrincipal(principal) = CurrentPrincipal::from_request_parts(parts, state).await?;
        if !principal.is_operator {
            return Err(ApiError::forbidden("operator access required"));
        }
        Ok(Self(principal))
    }
}

/// Extract and validate a tenant id from path
pub struct ValidTenantId(pub TenantId);

impl<S> FromRequestParts<S> for ValidTenantId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw): Path<String> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::Validation("missing school id".into()))?;

        let id = raw
            .parse::<TenantId>()
            .map_err(|_| ApiError::Validation(format!("'{}' is not a school id", raw)))?;
        Ok(Self(id))
    }
}

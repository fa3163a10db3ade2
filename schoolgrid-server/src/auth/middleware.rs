//! Request stage that binds every request to a tenant scope.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use schoolgrid_core::TenantScope;

use super::is_exempt;
use crate::http::error::ApiError;
use crate::state::AppState;

/// Always writes a fresh [`TenantScope`] into the request, so nothing from a
/// previous request on the same connection or task can leak through.
pub async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if is_exempt(request.uri().path()) {
        request.extensions_mut().insert(TenantScope::Unbound);
        return next.run(request).await;
    }

    match state.authenticator().authenticate(request.headers()).await {
        Ok((principal, scope)) => {
            tracing::debug!(user = principal.id, %scope, "request bound");
            let extensions = request.extensions_mut();
            extensions.insert(scope);
            extensions.insert(principal);
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(error = %err, path = %request.uri().path(), "authentication rejected");
            ApiError::from(err).into_response()
        }
    }
}

//! Platform endpoints: caller introspection, registry status and tenant
//! onboarding.
//!
//! - `GET  /platform/whoami` - principal and bound scope
//! - `GET  /platform/route/{module}` - where `module` resolves for this caller
//! - `GET  /platform/status` - registry, reconciler and listener (operator)
//! - `POST /platform/tenants` - provision a school database (operator)
//! - `POST /platform/tenants/{id}/deactivate` - suspend a school (operator)

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use schoolgrid_core::{MissingContextPolicy, Module, Plane, TenantId, TenantScope};
use serde::Serialize;

use crate::http::error::ApiError;
use crate::http::extractors::{CurrentPrincipal, Operator, ValidTenantId};
use crate::listener::ListenerReport;
use crate::provision::{DeactivateReport, ProvisionReport, ProvisionRequest};
use crate::reconciler::ReconcileReport;
use crate::routing::{RoutingContext, Target};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WhoAmI {
    pub user_id: i64,
    pub user_name: String,
    pub operator: bool,
    pub scope: TenantScope,
}

async fn whoami(CurrentPrincipal(principal): CurrentPrincipal, ctx: RoutingContext) -> Json<WhoAmI> {
    Json(WhoAmI {
        user_id: principal.id,
        user_name: principal.user_name,
        operator: ctx.scope().is_operator(),
        scope: ctx.scope(),
    })
}

#[derive(Debug, Serialize)]
pub struct RouteProbe {
    pub module: Module,
    pub plane: Plane,
    pub target: Target,
}

async fn route_probe(ctx: RoutingContext, Path(module): Path<String>) -> Result<Json<RouteProbe>, ApiError> {
    let module: Module = module
        .parse()
        .map_err(|e: schoolgrid_core::CoreError| ApiError::Validation(e.to_string()))?;
    let conn = ctx.route(module)?;
    Ok(Json(RouteProbe {
        module,
        plane: module.plane(),
        target: conn.target(),
    }))
}

#[derive(Debug, Serialize)]
pub struct PlatformStatus {
    pub registered_tenants: usize,
    pub tenants: Vec<TenantId>,
    pub reconciled: Option<ReconcileReport>,
    pub listener: Option<ListenerReport>,
    pub missing_context: MissingContextPolicy,
}

async fn status(State(state): State<AppState>, _operator: Operator) -> Json<PlatformStatus> {
    let tenants = state.registry().tenants();
    Json(PlatformStatus {
        registered_tenants: tenants.len(),
        tenants,
        reconciled: state.reconciler().report(),
        listener: state.listener().map(|l| l.report()),
        missing_context: state.policy(),
    })
}

async fn provision(
    State(state): State<AppState>,
    Operator(operator): Operator,
    request: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisionReport>), ApiError> {
    let Json(request) = request?;
    tracing::info!(operator = operator.id, tenant = %request.tenant_id, "provision requested");
    let report = state.provisioner().provision(request).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn deactivate(
    State(state): State<AppState>,
    Operator(operator): Operator,
    ValidTenantId(tenant): ValidTenantId,
) -> Result<Json<DeactivateReport>, ApiError> {
    tracing::info!(operator = operator.id, %tenant, "deactivation requested");
    Ok(Json(state.provisioner().deactivate(tenant).await?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/platform/whoami", get(whoami))
        .route("/platform/route/{module}", get(route_probe))
        .route("/platform/status", get(status))
        .route("/platform/tenants", post(provision))
        .route("/platform/tenants/{id}/deactivate", post(deactivate))
}

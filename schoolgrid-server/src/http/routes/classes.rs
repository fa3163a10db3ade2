//! Tenant-plane reads through the query router.
//!
//! Handlers never take a school id to pick a database. A `school_id` in the
//! query string is only cross-checked against the caller's binding.

use axum::extract::rejection::QueryRejection;
use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use schoolgrid_core::{Module, PlaneEntity, TenantId};
use serde::{Deserialize, Serialize};

use crate::http::error::ApiError;
use crate::routing::RoutingContext;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Classroom {
    pub id: i64,
    pub name: String,
}

impl PlaneEntity for Classroom {
    const MODULE: Module = Module::Classes;
}

#[derive(Debug, Default, Deserialize)]
pub struct SchoolQuery {
    pub school_id: Option<TenantId>,
}

/// GET /academics/classes
async fn list_classes(
    ctx: RoutingContext,
    query: Result<Query<SchoolQuery>, QueryRejection>,
) -> Result<Json<Vec<Classroom>>, ApiError> {
    let Query(query) = query?;
    ctx.cross_check(query.school_id)?;
    let conn = ctx.route_entity::<Classroom>()?;

    let classes = sqlx::query_as::<_, Classroom>("SELECT id, name FROM classes ORDER BY name")
        .fetch_all(conn.pool())
        .await
        .map_err(|err| {
            ctx.report_error(&conn, &err);
            ApiError::internal(err)
        })?;
    Ok(Json(classes))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/academics/classes", get(list_classes))
}

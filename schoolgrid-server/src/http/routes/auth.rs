//! Exempt identity entry points.
//!
//! Login, token refresh and password reset are served by the identity
//! service. They are mounted here so the exempt prefixes stay reachable
//! without a token and answer with an explicit 501.

use axum::{routing::post, Router};

use crate::http::error::ApiError;
use crate::state::AppState;

async fn login() -> ApiError {
    ApiError::NotImplemented("login")
}

async fn refresh() -> ApiError {
    ApiError::NotImplemented("token refresh")
}

async fn reset_password() -> ApiError {
    ApiError::NotImplemented("password reset")
}

async fn verify_otp() -> ApiError {
    ApiError::NotImplemented("otp verification")
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login/", post(login))
        .route("/auth/token/refresh/", post(refresh))
        .route("/core/password_manager/reset_password", post(reset_password))
        .route("/core/password_manager/verify_otp", post(verify_otp))
}

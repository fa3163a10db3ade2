//! Authentication stage.
//!
//! Verifies the caller's access token, loads the principal and binds the
//! request to exactly one [`TenantScope`]:
//!
//! - global operator -> `Operator`, whatever the request data says
//! - normal principal -> the school bound to the account at creation
//! - principal without a school -> rejected (400)
//!
//! Exempt routes skip this stage and are bound to `Unbound`.

pub mod middleware;
pub mod token;

use std::sync::Arc;

use axum::http::{header, HeaderMap};
use schoolgrid_core::{TenantId, TenantScope};

use crate::db::{DirectoryError, Principal, PrincipalStore, TenantDirectory};

pub use middleware::authenticate;
pub use token::{Claims, TokenKeys, TokenType};

/// Paths that never carry a principal, matched exactly.
pub const EXEMPT_PATHS: &[&str] = &["/health"];

/// Path prefixes that never carry a principal.
pub const EXEMPT_PREFIXES: &[&str] = &[
    "/auth/login/",
    "/auth/token/refresh/",
    "/core/password_manager/reset_password",
    "/core/password_manager/verify_otp",
    "/static/",
];

pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path) || EXEMPT_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("user not found")]
    UnknownPrincipal,

    #[error("user is inactive")]
    InactivePrincipal,

    #[error("school not associated with user")]
    NoTenantBinding,

    #[error("school {0} not found")]
    UnknownTenant(TenantId),

    #[error("principal lookup failed: {0}")]
    Store(#[from] DirectoryError),
}

/// Pull a bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct Authenticator {
    keys: TokenKeys,
    principals: Arc<dyn PrincipalStore>,
    directory: Arc<dyn TenantDirectory>,
}

impl Authenticator {
    pub fn new(
        keys: TokenKeys,
        principals: Arc<dyn PrincipalStore>,
        directory: Arc<dyn TenantDirectory>,
    ) -> Self {
        Self {
            keys,
            principals,
            directory,
        }
    }

    pub fn keys(&self) -> &TokenKeys {
        &self.keys
    }

    /// Authenticate a request from its headers and derive its scope.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<(Principal, TenantScope), AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        let claims = self.keys.verify_access(token)?;

        let principal = self
            .principals
            .find(claims.user_id()?)
            .await?
            .ok_or(AuthError::UnknownPrincipal)?;
        if !principal.is_active {
            return Err(AuthError::InactivePrincipal);
        }

        let scope = self.scope_for(&principal).await?;
        Ok((principal, scope))
    }

    async fn scope_for(&self, principal: &Principal) -> Result<TenantScope, AuthError> {
        if principal.is_operator {
            return Ok(TenantScope::Operator);
        }
        let tenant = principal.tenant.ok_or(AuthError::NoTenantBinding)?;
        if self.directory.find_by_tenant(tenant).await?.is_none() {
            return Err(AuthError::UnknownTenant(tenant));
        }
        Ok(TenantScope::Tenant(tenant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryDirectory, MemoryPrincipals};
    use crate::registry::tests::descriptor;
    use axum::http::HeaderValue;

    fn authenticator() -> Authenticator {
        let principals = MemoryPrincipals::with_principals([
            Principal::member(1, "teacher.one", TenantId(1)),
            Principal::operator(2, "root"),
            Principal {
                tenant: None,
                ..Principal::member(3, "orphan", TenantId(0))
            },
            Principal {
                is_active: false,
                ..Principal::member(4, "gone", TenantId(1))
            },
            Principal::member(5, "ghost", TenantId(99)),
        ]);
        let directory = MemoryDirectory::with_rows([descriptor(1)]);
        Authenticator::new(
            TokenKeys::new("secret", None, 600),
            Arc::new(principals),
            Arc::new(directory),
        )
    }

    fn headers_for(auth: &Authenticator, user: i64) -> HeaderMap {
        let token = auth.keys().issue(user, TokenType::Access).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn exempt_paths_match_by_prefix() {
        assert!(is_exempt("/auth/login/"));
        assert!(is_exempt("/static/app.js"));
        assert!(is_exempt("/core/password_manager/verify_otp"));
        assert!(!is_exempt("/platform/status"));
        assert!(!is_exempt("/auth/whoami"));
    }

    #[test]
    fn health_is_exempt_only_as_an_exact_path() {
        assert!(is_exempt("/health"));
        assert!(!is_exempt("/healthz"));
        assert!(!is_exempt("/health-admin/tenants"));
        assert!(!is_exempt("/health/../platform/status"));
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn member_is_bound_to_their_school() {
        let auth = authenticator();
        let (principal, scope) = auth.authenticate(&headers_for(&auth, 1)).await.unwrap();
        assert_eq!(principal.user_name, "teacher.one");
        assert_eq!(scope, TenantScope::Tenant(TenantId(1)));
    }

    #[tokio::test]
    async fn operator_is_bound_to_control_plane() {
        let auth = authenticator();
        let (_, scope) = auth.authenticate(&headers_for(&auth, 2)).await.unwrap();
        assert_eq!(scope, TenantScope::Operator);
    }

    #[tokio::test]
    async fn rejections() {
        let auth = authenticator();

        let err = auth.authenticate(&HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingToken));

        let err = auth.authenticate(&headers_for(&auth, 3)).await.unwrap_err();
        assert!(matches!(err, AuthError::NoTenantBinding));

        let err = auth.authenticate(&headers_for(&auth, 4)).await.unwrap_err();
        assert!(matches!(err, AuthError::InactivePrincipal));

        let err = auth.authenticate(&headers_for(&auth, 5)).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownTenant(TenantId(99))));

        let err = auth.authenticate(&headers_for(&auth, 77)).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownPrincipal));
    }
}

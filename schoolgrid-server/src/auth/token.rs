//! Signed access tokens (HS256 JWT).

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use schoolgrid_core::config::AuthSection;
use serde::{Deserialize, Serialize};

use super::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id, as a string per RFC 7519.
    pub sub: String,
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl Claims {
    pub fn user_id(&self) -> Result<i64, AuthError> {
        self.sub
            .parse()
            .map_err(|_| AuthError::InvalidToken("subject is not a user id".into()))
    }
}

#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: Option<String>,
    access_ttl_secs: i64,
}

impl TokenKeys {
    pub fn new(secret: &str, issuer: Option<String>, access_ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
            access_ttl_secs,
        }
    }

    pub fn from_config(auth: &AuthSection) -> Self {
        Self::new(&auth.jwt_secret, auth.issuer.clone(), auth.access_ttl_secs)
    }

    /// Sign a token for `user_id`.
    pub fn issue(&self, user_id: i64, token_type: TokenType) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        self.issue_with_expiry(user_id, token_type, now + self.access_ttl_secs)
    }

    pub fn issue_with_expiry(
        &self,
        user_id: i64,
        token_type: TokenType,
        exp: i64,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.to_string(),
            token_type,
            iat: Utc::now().timestamp(),
            exp,
            iss: self.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Verify signature, expiry and issuer, and require an access token.
    pub fn verify_access(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?
            .claims;

        if claims.token_type != TokenType::Access {
            return Err(AuthError::InvalidToken("not an access token".into()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> TokenKeys {
        TokenKeys::new("test-secret", Some("schoolgrid".into()), 600)
    }

    #[test]
    fn access_token_verifies() {
        let keys = keys();
        let token = keys.issue(42, TokenType::Access).unwrap();
        let claims = keys.verify_access(&token).unwrap();
        assert_eq!(claims.user_id().unwrap(), 42);
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let keys = keys();
        let token = keys.issue(42, TokenType::Refresh).unwrap();
        assert!(matches!(
            keys.verify_access(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let keys = keys();
        let past = Utc::now().timestamp() - 60;
        let token = keys.issue_with_expiry(42, TokenType::Access, past).unwrap();
        assert!(keys.verify_access(&token).is_err());
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let other = TokenKeys::new("other-secret", Some("schoolgrid".into()), 600);
        let token = other.issue(42, TokenType::Access).unwrap();
        assert!(keys().verify_access(&token).is_err());
    }
}

//! Tenant identity and connection descriptors.
//!
//! A tenant is one school. Each tenant owns exactly one physical database,
//! described by a [`ConnectionDescriptor`] row in the control-plane directory.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default host for a tenant database when the directory row omits one.
pub const DEFAULT_DB_HOST: &str = "127.0.0.1";

/// Default Postgres port.
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Postgres identifiers are truncated at 63 bytes; keys must fit.
const MAX_DB_KEY_LEN: usize = 63;

static DB_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("static pattern"));

/// Identifier of a tenant (school) in the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl TenantId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(TenantId)
            .map_err(|_| CoreError::invalid("tenant id", format!("'{}' is not an integer", s)))
    }
}

impl From<i64> for TenantId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Logical database name of a tenant, also the payload of a
/// registration notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DbKey(String);

impl DbKey {
    /// Parse a key, trimming surrounding whitespace.
    ///
    /// Keys are lowercase ASCII letters, digits and underscores, 1 to 63 bytes.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let key = raw.trim();
        if key.is_empty() {
            return Err(CoreError::invalid("db key", "cannot be empty"));
        }
        if key.len() > MAX_DB_KEY_LEN {
            return Err(CoreError::invalid(
                "db key",
                format!("exceeds {} characters", MAX_DB_KEY_LEN),
            ));
        }
        if !DB_KEY_PATTERN.is_match(key) {
            return Err(CoreError::invalid(
                "db key",
                "only lowercase letters, digits and underscores are allowed",
            ));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DbKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DbKey::parse(&value)
    }
}

impl From<DbKey> for String {
    fn from(key: DbKey) -> Self {
        key.0
    }
}

/// A school as recorded in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub is_active: bool,
    /// Principal that owns (administers) the school, if assigned yet.
    pub owner_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// An active school with no owner yet.
    pub fn new(id: TenantId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            is_active: true,
            owner_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How to reach one tenant's physical database.
///
/// Each row carries its own credentials; there is no shared template.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub tenant_id: TenantId,
    pub db_name: DbKey,
    pub db_user: String,
    pub db_password: String,
    #[serde(default = "default_host")]
    pub db_host: String,
    #[serde(default = "default_port")]
    pub db_port: u16,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_host() -> String {
    DEFAULT_DB_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_DB_PORT
}

fn default_active() -> bool {
    true
}

impl ConnectionDescriptor {
    /// Build an active descriptor with default host and port.
    pub fn new(
        tenant_id: TenantId,
        db_name: DbKey,
        db_user: impl Into<String>,
        db_password: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            tenant_id,
            db_name,
            db_user: db_user.into(),
            db_password: db_password.into(),
            db_host: default_host(),
            db_port: default_port(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.db_host = host.into();
        self.db_port = port;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

// Credentials never reach logs.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("tenant_id", &self.tenant_id)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("is_active", &self.is_active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_key_accepts_trimmed_lowercase() {
        let key = DbKey::parse("  greenfield_12_db\n").unwrap();
        assert_eq!(key.as_str(), "greenfield_12_db");
    }

    #[test]
    fn db_key_rejects_garbage() {
        assert!(DbKey::parse("").is_err());
        assert!(DbKey::parse("Robert'); DROP TABLE").is_err());
        assert!(DbKey::parse(&"a".repeat(64)).is_err());
    }

    #[test]
    fn tenant_id_parses() {
        assert_eq!("42".parse::<TenantId>().unwrap(), TenantId(42));
        assert!("forty-two".parse::<TenantId>().is_err());
    }

    #[test]
    fn descriptor_debug_hides_password() {
        let d = ConnectionDescriptor::new(
            TenantId(1),
            DbKey::parse("north_1_db").unwrap(),
            "north",
            "hunter2",
        );
        let rendered = format!("{:?}", d);
        assert!(!rendered.contains("hunter2"));
        assert_eq!(d.db_host, DEFAULT_DB_HOST);
        assert_eq!(d.db_port, DEFAULT_DB_PORT);
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let d: ConnectionDescriptor = serde_json::from_str(
            r#"{"tenant_id": 3, "db_name": "south_3_db", "db_user": "u", "db_password": "p"}"#,
        )
        .unwrap();
        assert_eq!(d.db_port, 5432);
        assert!(d.is_active);
    }
}

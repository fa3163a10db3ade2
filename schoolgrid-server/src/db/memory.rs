//! In-process directory and principal store.
//!
//! Used by tests and by local development without a control-plane database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use schoolgrid_core::{ConnectionDescriptor, DbKey, Tenant, TenantId};

use super::directory::{DirectoryError, TenantDirectory};
use super::principals::{Principal, PrincipalStore};

#[derive(Default)]
pub struct MemoryDirectory {
    schools: RwLock<BTreeMap<TenantId, Tenant>>,
    rows: RwLock<BTreeMap<TenantId, ConnectionDescriptor>>,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = ConnectionDescriptor>) -> Self {
        let directory = Self::new();
        for row in rows {
            directory.upsert(row);
        }
        directory
    }

    /// Insert or replace a row without conflict checks. A school record is
    /// created for it if there is none.
    pub fn upsert(&self, descriptor: ConnectionDescriptor) {
        if let Ok(mut schools) = self.schools.write() {
            schools
                .entry(descriptor.tenant_id)
                .or_insert_with(|| Tenant::new(descriptor.tenant_id, format!("school {}", descriptor.tenant_id)));
        }
        if let Ok(mut rows) = self.rows.write() {
            rows.insert(descriptor.tenant_id, descriptor);
        }
    }

    /// Record a school that has no database yet.
    pub fn add_school(&self, school: Tenant) {
        if let Ok(mut schools) = self.schools.write() {
            schools.insert(school.id, school);
        }
    }

    /// Make every call fail, as if the control plane were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("control plane unreachable".into()));
        }
        Ok(())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<TenantId, ConnectionDescriptor>>, DirectoryError>
    {
        self.check()?;
        self.rows
            .read()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))
    }
}

#[async_trait]
impl TenantDirectory for MemoryDirectory {
    async fn active_descriptors(&self) -> Result<Vec<ConnectionDescriptor>, DirectoryError> {
        Ok(self.read()?.values().filter(|d| d.is_active).cloned().collect())
    }

    async fn find_by_key(&self, key: &DbKey) -> Result<Option<ConnectionDescriptor>, DirectoryError> {
        Ok(self.read()?.values().find(|d| &d.db_name == key).cloned())
    }

    async fn find_by_tenant(
        &self,
        tenant: TenantId,
    ) -> Result<Option<ConnectionDescriptor>, DirectoryError> {
        Ok(self.read()?.get(&tenant).cloned())
    }

    async fn find_school(&self, tenant: TenantId) -> Result<Option<Tenant>, DirectoryError> {
        self.check()?;
        let schools = self
            .schools
            .read()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?;
        Ok(schools.get(&tenant).cloned())
    }

    async fn insert(&self, descriptor: &ConnectionDescriptor) -> Result<(), DirectoryError> {
        self.check()?;
        if self.find_school(descriptor.tenant_id).await?.is_none() {
            return Err(DirectoryError::UnknownSchool(descriptor.tenant_id));
        }
        let mut rows = self
            .rows
            .write()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?;
        if rows.contains_key(&descriptor.tenant_id)
            || rows.values().any(|d| d.db_name == descriptor.db_name)
        {
            return Err(DirectoryError::Conflict(format!(
                "tenant {} or database '{}' already has a directory row",
                descriptor.tenant_id, descriptor.db_name
            )));
        }
        rows.insert(descriptor.tenant_id, descriptor.clone());
        Ok(())
    }

    async fn set_active(&self, tenant: TenantId, active: bool) -> Result<bool, DirectoryError> {
        self.check()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?;
        Ok(match rows.get_mut(&tenant) {
            Some(row) => {
                row.is_active = active;
                row.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }
}

#[derive(Default)]
pub struct MemoryPrincipals {
    users: RwLock<HashMap<i64, Principal>>,
}

impl MemoryPrincipals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_principals(principals: impl IntoIterator<Item = Principal>) -> Self {
        let store = Self::new();
        for principal in principals {
            store.insert(principal);
        }
        store
    }

    pub fn insert(&self, principal: Principal) {
        if let Ok(mut users) = self.users.write() {
            users.insert(principal.id, principal);
        }
    }
}

#[async_trait]
impl PrincipalStore for MemoryPrincipals {
    async fn find(&self, user_id: i64) -> Result<Option<Principal>, DirectoryError> {
        let users = self
            .users
            .read()
            .map_err(|_| DirectoryError::Unavailable("principal lock poisoned".into()))?;
        Ok(users.get(&user_id).cloned())
    }
}

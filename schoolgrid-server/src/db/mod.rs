//! Database layer - pools, control-plane stores, migrations
//!
//! # Design Principles
//!
//! - One pool per physical database, never a shared Arc<Mutex<Connection>>
//! - Rely on DB constraints, handle conflicts - no check-then-insert
//! - Migrations run in a transaction and are recorded per database

pub mod directory;
pub mod memory;
pub mod migrations;
pub mod pool;
pub mod principals;

pub use directory::{DirectoryError, PgTenantDirectory, TenantDirectory};
pub use memory::{MemoryDirectory, MemoryPrincipals};
pub use pool::{create_pool_with_options, LazyPoolFactory, PoolFactory};
pub use principals::{PgPrincipalStore, Principal, PrincipalStore};

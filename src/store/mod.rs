//! Persistence layer: replace-all collections plus the workspace table.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{Collection, Snapshot, Store, TenantStore};

//! lestockage - Work-Item Storage Layer
//!
//! *Le Stockage* (The Storage) - Bulk existence queries and upserts over fetched work items

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// In-memory store used by tests and dry runs.
pub mod memory;
/// Work-item identities, data kinds, and stored records.
pub mod model;
/// SQLite-backed store and schema management.
pub mod schema;
/// The store capability trait and its error type.
pub mod store;

pub use memory::MemoryStore;
pub use model::{DataKind, WorkItemId, WorkItemRecord};
pub use schema::{SqliteStore, StorageConfig};
pub use store::{Result, Store, StoreError, StoreQuery};

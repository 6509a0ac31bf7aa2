// ============================================================================
// Aggregation Store Backends
// ============================================================================
//
// - MemoryStore:   in-process map behind tokio RwLocks
// - PostgresStore: append-only `documents` table, one transaction per upsert
//
// ============================================================================

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

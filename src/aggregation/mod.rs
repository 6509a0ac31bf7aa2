// ============================================================================
// Document Aggregation Infrastructure
// ============================================================================
//
// The store abstraction and its backends.
// The merge rules themselves live in src/domain/document/
//
// ============================================================================

mod core;
mod store;

pub use self::core::*;
pub use self::store::*;

// ============================================================================
// Aggregation Core - Store Abstraction
// ============================================================================
//
// One trait, two operations. Backends live in ../store/
//
// ============================================================================

pub mod aggregation_store;

pub use aggregation_store::AggregationStore;

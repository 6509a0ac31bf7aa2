// ============================================================================
// Document Domain - Aggregation of Repeated Fetches
// ============================================================================
//
// This module contains ALL document-specific code:
// - Value objects (Observation, AggregateState, AggregatedDocument)
// - Errors (StoreError)
// - Merge policy (merge / AggregateState::absorb)
// - Processor (DocumentProcessor)
//
// Storage backends live in src/aggregation/
//
// ============================================================================

pub mod value_objects;
pub mod errors;
pub mod merge;
pub mod processor;

pub use value_objects::*;
pub use errors::*;
pub use merge::*;
pub use processor::*;

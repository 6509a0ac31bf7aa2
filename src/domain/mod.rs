// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Domain types and rules, independent of how state is stored.
//
// ============================================================================

pub mod document;

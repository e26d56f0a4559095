// =============================================================================
// Operational API — health and status
// =============================================================================

pub mod health;

// =============================================================================
// Auto-tune pipeline — ingest, AFR analysis, VE corrections, export
// =============================================================================

pub mod export;
pub mod transient;
pub mod ve_math;
pub mod workflow;

// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Every failure the core distinguishes maps to one variant here. I/O wrappers
// (retry, circuit breaker) recover transient kinds; logic errors propagate.
// The stable `kind()` string is part of the structured error record consumed
// by external shells.
// =============================================================================

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Typed error for the tuning core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input the caller must fix; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A run, session, or snapshot id that does not exist.
    #[error("{resource} '{id}' not found")]
    NotFound { resource: String, id: String },

    /// Socket bind/join failure, unresolved interface. Fatal to the current
    /// subscribe; the health monitor decides whether to reopen.
    #[error("transport error: {0}")]
    Transport(String),

    /// Short header or a declared length larger than the datagram. Counted
    /// and dropped by the transport, surfaced only from codec helpers.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A circuit breaker blocked the call without executing it.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// Wall-clock budget exceeded.
    #[error("timed out after {0:.1?}")]
    Timeout(Duration),

    /// Analysis could not proceed (missing AFR column, empty grid, ...).
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// Unexpected condition; logged with context, session goes to error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable kind tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Transport(_) => "transport",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::Analysis(_) => "analysis",
            Self::Internal(_) => "internal",
        }
    }

    /// Build the structured record external shells consume.
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Structured error payload (kind + message) for snapshots and manifests.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
}

pub type EngineResult<T> = Result<T, EngineError>;

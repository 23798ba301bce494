//! Error taxonomy for the oracle boundary and template instantiation.
//!
//! Two families:
//! - `OracleError`: anything the answer oracle can do wrong. Split into
//!   transient (worth retrying with backoff) and permanent (propagate, mark
//!   the affected unit failed).
//! - `FillError`: a template/transcript pairing that cannot be instantiated.
//!   Excluded from that candidate's aggregate, never treated as zero
//!   divergence.
//!
//! Per-item failures are isolated and recorded; only repeated whole-generation
//! failure escalates to a run-level terminal state (see `search::controller`).

/// Failures at the answer-oracle boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    /// Backend rejected the call due to rate limiting
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Call exceeded its deadline
    #[error("oracle call timed out after {0}s")]
    Timeout(u64),

    /// Response could not be parsed into the expected shape
    #[error("malformed oracle response: {0}")]
    Malformed(String),

    /// Authentication/authorization failure
    #[error("oracle auth failure: {0}")]
    Auth(String),

    /// Backend process/transport failure (spawn error, dead connection)
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

impl OracleError {
    /// Transient errors are retried with bounded exponential backoff at the
    /// adapter boundary; permanent ones propagate immediately.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleError::RateLimited(_) | OracleError::Timeout(_) | OracleError::Unavailable(_)
        )
    }
}

/// Failures instantiating a template for a transcript.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FillError {
    /// Filled text does not match the template's slot structure
    #[error("slot mismatch: {0}")]
    SlotMismatch(String),

    /// Transcript lacks a field the template requires
    #[error("missing field: {0}")]
    MissingField(String),

    /// The oracle-backed filler itself failed
    #[error("fill oracle error: {0}")]
    Oracle(#[from] OracleError),
}

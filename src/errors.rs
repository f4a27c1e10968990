use thiserror::Error;

/// Failure conditions of the analysis engine. Every variant is recoverable
/// at method, class, or query granularity; none aborts a whole run.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Step or size limit exceeded; the offending direction degrades to an
    /// unknown equation.
    #[error("analysis exceeded its complexity budget")]
    TooComplex,

    /// Cooperative cancellation observed mid-analysis.
    #[error("analysis cancelled")]
    Cancelled,

    /// The instruction stream violates stack-machine discipline. Isolated
    /// at the class boundary: that class contributes no equations.
    #[error("malformed method body: {0}")]
    Malformed(String),

    /// A global solve pulled in more equations than the per-query budget.
    /// The caller must treat this as "no facts inferable", not an error.
    #[error("query expanded past the equations budget")]
    TooManyEquations,

    /// Persisted record written by an incompatible format version.
    #[error("unsupported equation record version {found} (expected {expected})")]
    WrongVersion { found: u16, expected: u16 },

    /// Persisted record is truncated or internally inconsistent.
    #[error("corrupt equation record: {0}")]
    Corrupt(String),
}

impl AnalysisError {
    /// Whether this failure should degrade the one affected direction to
    /// an unknown equation instead of discarding the whole class.
    pub fn degrades_single_direction(&self) -> bool {
        matches!(self, AnalysisError::TooComplex)
    }
}

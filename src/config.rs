use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Hard bound on worklist steps for one per-method analysis.
pub const STEPS_LIMIT: usize = 30_000;
/// Hard bound on dependency literals in one pending equation.
pub const EQUATION_SIZE_LIMIT: usize = 30;
/// Hard bound on equations pulled into one global solve.
pub const EQUATIONS_PER_QUERY_LIMIT: usize = 1_000;
/// Cancellation is polled once per this many worklist steps.
pub const CANCEL_POLL_INTERVAL: usize = 128;

/// Cooperative cancellation signal shared with bounded loops.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Tunable limits for one analysis invocation. The defaults mirror the
/// empirically chosen production constants; none of them is a semantic
/// contract.
#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    pub steps_limit: usize,
    pub equation_size_limit: usize,
    pub equations_per_query_limit: usize,
    pub cancel: CancelToken,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            steps_limit: STEPS_LIMIT,
            equation_size_limit: EQUATION_SIZE_LIMIT,
            equations_per_query_limit: EQUATIONS_PER_QUERY_LIMIT,
            cancel: CancelToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AnalysisConfig, CancelToken};

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn default_limits_are_positive() {
        let config = AnalysisConfig::default();
        assert!(config.steps_limit > 0);
        assert!(config.equation_size_limit > 0);
        assert!(config.equations_per_query_limit > 0);
    }
}

//! Newton solver configuration and diagnostics.

use serde::{Deserialize, Serialize};

/// Configuration for the dual Newton iteration and its retry policy.
///
/// The retry thresholds are behavioral contracts: downstream numerical parity
/// depends on the ten-attempt budget and the `1e-6`/`1e-8` stopping rules.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Relative tolerance on the multiplier step for declaring convergence.
    pub xtol: f64,
    /// Maximum residual evaluations per root-finder attempt.
    pub max_evaluations: usize,
    /// Total attempts before returning the best-effort solution.
    pub max_attempts: usize,
    /// Worst relative margin error below which a stalled solve is acceptable.
    pub margin_tolerance: f64,
    /// Minimum improvement of the worst relative error that justifies another attempt.
    pub improvement_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            xtol: 1.490_12e-8,
            max_evaluations: 256,
            max_attempts: 10,
            margin_tolerance: 1e-6,
            improvement_tolerance: 1e-8,
        }
    }
}

impl SolverOptions {
    /// Overrides the step tolerance while keeping other defaults.
    pub fn with_xtol(mut self, xtol: f64) -> Self {
        self.xtol = xtol;
        self
    }

    /// Overrides the per-attempt evaluation budget.
    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }

    /// Overrides the retry budget.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Diagnostics returned alongside the calibrated weights.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolveDiagnostics {
    /// Root-finder attempts performed.
    pub attempts: usize,
    /// Residual evaluations across all attempts.
    pub evaluations: usize,
    /// Worst relative error over all margins at the returned solution.
    pub worst_relative_error: f64,
    /// Whether the final attempt converged or the worst relative error is
    /// within the margin tolerance. A `false` value flags a best-effort
    /// result that callers should inspect before trusting the weights.
    pub converged: bool,
}

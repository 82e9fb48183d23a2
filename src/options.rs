//! Aggregated calibration configuration.

use serde::{Deserialize, Serialize};

use crate::distance::CalibrationMethod;
use crate::solving::SolverOptions;

/// Full parameter set for one calibration run: the distance function, the
/// categorical-margin reconciliation policy, and the solver knobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    /// Distance function mapping multiplier exposure to a weight ratio.
    pub method: CalibrationMethod,
    /// Whether categorical targets that disagree with the total population
    /// are proportionally rescaled instead of rejected.
    pub use_proportions: bool,
    /// Newton solver configuration.
    pub solver: SolverOptions,
}

impl CalibrationParameters {
    /// Overrides the calibration method while keeping other defaults.
    pub fn with_method(mut self, method: CalibrationMethod) -> Self {
        self.method = method;
        self
    }

    /// Enables or disables proportional rescaling of categorical targets.
    pub fn with_use_proportions(mut self, use_proportions: bool) -> Self {
        self.use_proportions = use_proportions;
        self
    }

    /// Overrides the solver options.
    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }
}

//! Generalized raking: Newton iteration on the dual of the calibration problem.
//!
//! Solving `X' (d .* F(X lambda)) = targets` for the multipliers `lambda`
//! yields adjusted weights `d .* F(X lambda)` whose aggregates match the
//! margin targets as closely as the chosen distance function allows.

use std::collections::BTreeMap;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use crate::data::SurveyData;
use crate::distance::CalibrationMethod;
use crate::error::{CalibrationError, Result};
use crate::margins::{Margin, MarginSet, TOTAL_POPULATION_KEY};
use crate::options::CalibrationParameters;
use crate::solving::{SolveDiagnostics, SolverOptions};

/// Singular values below this fraction of the largest one are treated as zero
/// when solving the Newton step. The expanded design matrix is rank-deficient
/// by construction (category dummies sum to the constant column), so the step
/// is a least-squares solve rather than a direct factorization.
const SINGULAR_CUTOFF: f64 = 1e-12;

/// Result of a raking run.
#[derive(Clone, Debug)]
pub struct RakingSolution {
    /// Adjusted weights in the original observation order. Dropped
    /// observations keep their initial value (including NaN markers).
    pub weights: DVector<f64>,
    /// Solved Lagrange multipliers, one per expanded constraint.
    pub multipliers: DVector<f64>,
    /// Constraint labels parallel to the multipliers (`variable`,
    /// `variable=category`, and the trailing total-population entry).
    pub labels: Vec<String>,
    /// Realized (possibly rescaled) targets by variable, including the
    /// resolved total under [`TOTAL_POPULATION_KEY`].
    pub realized_margins: BTreeMap<String, Margin>,
    /// The total population the weights were calibrated to.
    pub total_population: f64,
    /// Convergence diagnostics for the run.
    pub diagnostics: SolveDiagnostics,
}

/// Computes adjusted weights so that weighted aggregates match the margins.
///
/// Observations with a missing or non-positive initial weight, or a missing
/// value on any margin variable, do not participate; their weight is returned
/// unchanged. On transient non-convergence the solver retries from the last
/// multiplier estimate and ultimately returns the best-effort solution; check
/// [`SolveDiagnostics::converged`] when exactness matters.
pub fn rake(
    data: &SurveyData,
    margins: &MarginSet,
    initial_weight: &str,
    parameters: &CalibrationParameters,
) -> Result<RakingSolution> {
    parameters.method.validate()?;
    if margins.is_empty() {
        return Err(CalibrationError::EmptyMargins);
    }

    let weight_column = data.column(initial_weight)?;
    let observations = data.observations();

    let mut valid_weight = vec![true; observations];
    for (index, weight) in weight_column.iter().enumerate() {
        if !(weight.is_finite() && *weight > 0.0) {
            valid_weight[index] = false;
        }
    }
    let dropped_weights = valid_weight.iter().filter(|ok| !**ok).count();
    if dropped_weights > 0 {
        info!("{dropped_weights} observations dropped for missing or non-positive initial weight");
    }

    let mut complete_margins = vec![true; observations];
    for (variable, _) in margins.iter() {
        let values = data.column(variable)?;
        for (index, value) in values.iter().enumerate() {
            if value.is_nan() {
                complete_margins[index] = false;
            }
        }
    }
    let dropped_margins = complete_margins.iter().filter(|ok| !**ok).count();
    if dropped_margins > 0 {
        info!("{dropped_margins} observations dropped for missing margin values");
    }

    let retained: Vec<usize> = (0..observations)
        .filter(|&i| valid_weight[i] && complete_margins[i])
        .collect();
    if retained.is_empty() {
        return Err(CalibrationError::NoRetainedObservations);
    }

    let d = DVector::from_iterator(retained.len(), retained.iter().map(|&i| weight_column[i]));
    let total = margins.total_population().unwrap_or_else(|| d.sum());
    let expanded = margins.expand(data, &retained, total, parameters.use_proportions)?;
    let design = &expanded.design;
    let targets = &expanded.targets;

    let options = &parameters.solver;
    let mut multipliers = DVector::zeros(targets.len());
    let mut attempts = 0;
    let mut evaluations = 0;
    let mut newton_converged = false;
    let mut previous_worst = f64::INFINITY;
    let mut worst = f64::INFINITY;

    loop {
        attempts += 1;
        let outcome = newton_attempt(
            design,
            &d,
            targets,
            parameters.method,
            &mut multipliers,
            options,
        );
        evaluations += outcome.evaluations;
        worst = worst_relative_error(design, &d, targets, parameters.method, &multipliers);

        // A vanishing step only counts as convergence when the margins are
        // actually met; a saturated distance function can zero the Jacobian
        // far away from any solution.
        if matches!(outcome.status, NewtonStatus::StepConverged)
            && worst <= options.margin_tolerance
        {
            newton_converged = true;
            break;
        }
        debug!("attempt {attempts}: worst relative margin error {worst:.3e}");
        if attempts >= options.max_attempts {
            break;
        }
        if worst < options.margin_tolerance
            && previous_worst - worst < options.improvement_tolerance
        {
            break;
        }
        previous_worst = worst;
    }

    let converged = newton_converged || worst <= options.margin_tolerance;
    info!(
        "calibration finished after {attempts} attempts ({evaluations} evaluations), \
         worst relative margin error {worst:.3e}"
    );

    let ratios = parameters.method.apply(&(design * &multipliers));
    let adjusted = d.component_mul(&ratios);
    let mut weights = weight_column.clone();
    for (position, &index) in retained.iter().enumerate() {
        weights[index] = adjusted[position];
    }

    let mut realized_margins = expanded.realized;
    realized_margins.insert(TOTAL_POPULATION_KEY.to_string(), Margin::Scalar(total));

    Ok(RakingSolution {
        weights,
        multipliers,
        labels: expanded.labels,
        realized_margins,
        total_population: total,
        diagnostics: SolveDiagnostics {
            attempts,
            evaluations,
            worst_relative_error: worst,
            converged,
        },
    })
}

enum NewtonStatus {
    /// The multiplier step shrank below the relative tolerance.
    StepConverged,
    /// The evaluation budget ran out before convergence.
    BudgetExhausted,
    /// The residual or the step became non-finite or unsolvable.
    Stalled,
}

struct NewtonOutcome {
    status: NewtonStatus,
    evaluations: usize,
}

/// One bounded Newton run from (and mutating) the current multipliers.
fn newton_attempt(
    design: &DMatrix<f64>,
    d: &DVector<f64>,
    targets: &DVector<f64>,
    method: CalibrationMethod,
    multipliers: &mut DVector<f64>,
    options: &SolverOptions,
) -> NewtonOutcome {
    let mut evaluations = 0;

    while evaluations < options.max_evaluations {
        let potentials = design * &*multipliers;
        let weights = d.component_mul(&method.apply(&potentials));
        evaluations += 1;

        let residual = design.transpose() * weights - targets;
        if !residual.iter().all(|value| value.is_finite()) {
            return NewtonOutcome {
                status: NewtonStatus::Stalled,
                evaluations,
            };
        }

        // Jacobian: X' diag(d .* F'(X lambda)) X
        let slopes = d.component_mul(&method.apply_derivative(&potentials));
        let mut scaled = design.clone();
        for (mut row, slope) in scaled.row_iter_mut().zip(slopes.iter()) {
            row *= *slope;
        }
        let jacobian = design.transpose() * scaled;

        let svd = jacobian.svd(true, true);
        let cutoff = svd.singular_values.max() * SINGULAR_CUTOFF;
        let step = match svd.solve(&-residual, cutoff) {
            Ok(step) => step,
            Err(_) => {
                return NewtonOutcome {
                    status: NewtonStatus::Stalled,
                    evaluations,
                }
            }
        };
        if !step.iter().all(|value| value.is_finite()) {
            return NewtonOutcome {
                status: NewtonStatus::Stalled,
                evaluations,
            };
        }

        let progress = step.norm();
        *multipliers += step;
        if progress <= options.xtol * (1.0 + multipliers.norm()) {
            return NewtonOutcome {
                status: NewtonStatus::StepConverged,
                evaluations,
            };
        }
    }

    NewtonOutcome {
        status: NewtonStatus::BudgetExhausted,
        evaluations,
    }
}

/// Worst relative deviation of realized margins from their targets. Margins
/// with a zero target fall back to absolute deviation.
fn worst_relative_error(
    design: &DMatrix<f64>,
    d: &DVector<f64>,
    targets: &DVector<f64>,
    method: CalibrationMethod,
    multipliers: &DVector<f64>,
) -> f64 {
    let weights = d.component_mul(&method.apply(&(design * multipliers)));
    let realized = design.transpose() * weights;
    targets
        .iter()
        .zip(realized.iter())
        .map(|(target, value)| {
            let deviation = (value - target).abs();
            if *target != 0.0 {
                deviation / target.abs()
            } else {
                deviation
            }
        })
        .fold(0.0, f64::max)
}

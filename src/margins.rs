//! Margin targets and their expansion into calibration constraints.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::SurveyData;
use crate::error::{CalibrationError, Result};

/// Key under which the population total appears in realized-margin output.
/// User data must not carry a column by this name.
pub const TOTAL_POPULATION_KEY: &str = "total_population";

/// A single calibration target for one variable.
///
/// A scalar margin constrains the weighted sum of the variable itself. A
/// categorical margin constrains the weighted population mass of each discrete
/// category; categories are keyed by their integer code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Margin {
    /// Target for `sum(value[i] * weight[i])`.
    Scalar(f64),
    /// Per-category population targets, keyed by category code.
    Categorical(BTreeMap<i64, f64>),
}

impl Margin {
    /// Builds a categorical margin from `(category, target)` pairs.
    pub fn categorical(pairs: impl IntoIterator<Item = (i64, f64)>) -> Self {
        Self::Categorical(pairs.into_iter().collect())
    }

    /// Number of constraints this margin expands into.
    pub fn constraint_count(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Categorical(targets) => targets.len(),
        }
    }
}

/// Ordered collection of margins plus an optional explicit population total.
///
/// Margins are kept in sorted variable order so that the expanded constraint
/// layout, and with it the multiplier vector, is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarginSet {
    margins: BTreeMap<String, Margin>,
    total_population: Option<f64>,
}

impl MarginSet {
    /// Creates an empty margin set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the margin for a variable.
    pub fn insert(&mut self, variable: impl Into<String>, margin: Margin) {
        self.margins.insert(variable.into(), margin);
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with_margin(mut self, variable: impl Into<String>, margin: Margin) -> Self {
        self.insert(variable, margin);
        self
    }

    /// Sets an explicit total-population target.
    pub fn set_total_population(&mut self, total: f64) {
        self.total_population = Some(total);
    }

    /// Builder-style variant of [`set_total_population`](Self::set_total_population).
    pub fn with_total_population(mut self, total: f64) -> Self {
        self.set_total_population(total);
        self
    }

    /// The explicit total-population target, if any.
    pub fn total_population(&self) -> Option<f64> {
        self.total_population
    }

    /// Returns the margin registered for a variable.
    pub fn get(&self, variable: &str) -> Option<&Margin> {
        self.margins.get(variable)
    }

    /// Number of registered margin variables (the total does not count).
    pub fn len(&self) -> usize {
        self.margins.len()
    }

    /// True when neither a margin nor a total-population target is registered.
    pub fn is_empty(&self) -> bool {
        self.margins.is_empty() && self.total_population.is_none()
    }

    /// Iterates over `(variable, margin)` pairs in sorted variable order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Margin)> {
        self.margins.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Expands the margin set into calibration constraints over the retained
    /// observations.
    ///
    /// Each scalar margin contributes its variable column; each categorical
    /// margin contributes one 0/1 dummy column per category. A synthetic
    /// always-1 column bound to `total` is appended last, enforcing the
    /// population constraint even when no explicit margin covers it.
    /// Categorical targets whose sum disagrees with `total` are proportionally
    /// rescaled when `use_proportions` is set, and rejected otherwise.
    pub(crate) fn expand(
        &self,
        data: &SurveyData,
        retained: &[usize],
        total: f64,
        use_proportions: bool,
    ) -> Result<ExpandedMargins> {
        let n = retained.len();
        let mut columns: Vec<DVector<f64>> = Vec::new();
        let mut targets: Vec<f64> = Vec::new();
        let mut labels: Vec<String> = Vec::new();
        let mut realized: BTreeMap<String, Margin> = BTreeMap::new();

        for (variable, margin) in self.iter() {
            let values = data.column(variable)?;
            match margin {
                Margin::Scalar(target) => {
                    columns.push(DVector::from_iterator(
                        n,
                        retained.iter().map(|&i| values[i]),
                    ));
                    targets.push(*target);
                    labels.push(variable.to_string());
                    realized.insert(variable.to_string(), Margin::Scalar(*target));
                }
                Margin::Categorical(category_targets) => {
                    let sum: f64 = category_targets.values().sum();
                    let mismatch = (sum - total).abs() > 1e-9 * total.abs().max(1.0);
                    if mismatch && !use_proportions {
                        return Err(CalibrationError::MarginInconsistency {
                            variable: variable.to_string(),
                            expected: total,
                            found: sum,
                        });
                    }
                    let factor = if mismatch { total / sum } else { 1.0 };
                    let mut rescaled = BTreeMap::new();
                    for (&category, &target) in category_targets {
                        let code = category as f64;
                        columns.push(DVector::from_iterator(
                            n,
                            retained
                                .iter()
                                .map(|&i| if values[i] == code { 1.0 } else { 0.0 }),
                        ));
                        targets.push(target * factor);
                        labels.push(format!("{variable}={category}"));
                        rescaled.insert(category, target * factor);
                    }
                    realized.insert(variable.to_string(), Margin::Categorical(rescaled));
                }
            }
        }

        columns.push(DVector::from_element(n, 1.0));
        targets.push(total);
        labels.push(TOTAL_POPULATION_KEY.to_string());

        Ok(ExpandedMargins {
            design: DMatrix::from_columns(&columns),
            targets: DVector::from_vec(targets),
            labels,
            realized,
        })
    }
}

/// Result of expanding a [`MarginSet`] over the retained observations.
#[derive(Clone, Debug)]
pub(crate) struct ExpandedMargins {
    /// Design matrix, one row per retained observation, one column per constraint.
    pub design: DMatrix<f64>,
    /// Constraint targets, parallel to the design columns.
    pub targets: DVector<f64>,
    /// Constraint labels, parallel to the design columns.
    pub labels: Vec<String>,
    /// Rescaled targets by variable, for diagnostics.
    pub realized: BTreeMap<String, Margin>,
}

//! Calibration orchestration: bridging a live simulation to the raking solver.

use std::collections::{BTreeMap, BTreeSet};

use log::info;
use nalgebra::DVector;

use crate::data::{SurveyData, SurveyDataBuilder};
use crate::error::{CalibrationError, Result};
use crate::margins::{Margin, MarginSet};
use crate::options::CalibrationParameters;
use crate::raking::rake;
use crate::solving::SolveDiagnostics;

/// Capability surface the orchestrator needs from the hosting simulation.
///
/// The orchestrator composes with this trait instead of reaching into the
/// simulation's internals; any weight-holding runtime can implement it.
pub trait SimulationContext {
    /// Entity level (person, household, ...) a variable is defined over.
    fn variable_entity(&self, variable: &str) -> Result<String>;
    /// Whether a variable takes discrete category codes.
    fn is_categorical(&self, variable: &str) -> Result<bool>;
    /// Current weight vector for an entity and period.
    fn get_weight(&self, entity: &str, period: &str) -> Result<DVector<f64>>;
    /// Current values of a variable for a period.
    fn get_variable_values(&self, variable: &str, period: &str) -> Result<DVector<f64>>;
    /// Overwrites the weight input for an entity and period.
    fn set_weight(&mut self, entity: &str, period: &str, weights: &DVector<f64>) -> Result<()>;
    /// Drops cached values derived from the given variable so they are
    /// recomputed consistently on next access.
    fn invalidate_derived(&mut self, variable: &str, period: &str) -> Result<()>;
}

/// Target plus diagnostic aggregates for one margin variable.
#[derive(Clone, Debug, PartialEq)]
pub struct MarginDiagnostics {
    /// The registered (or realized, after a run) target.
    pub target: Margin,
    /// Aggregate under the current weights.
    pub actual: Margin,
    /// Aggregate under the pre-calibration weights.
    pub initial: Margin,
}

/// Stateful calibration orchestrator bound to one simulation context.
///
/// Holds the pre-calibration weights for [`reset`](Self::reset), accumulates
/// the latest calibrated weights across [`calibrate`](Self::calibrate) calls,
/// and commits them with [`set_calibrated_weights`](Self::set_calibrated_weights).
pub struct Calibration<S: SimulationContext> {
    simulation: S,
    weight_variable: String,
    entity: String,
    period: String,
    filter_variable: Option<String>,
    margins: BTreeMap<String, MarginDiagnostics>,
    total_population: Option<f64>,
    parameters: CalibrationParameters,
    initial_weights: DVector<f64>,
    weights: DVector<f64>,
    diagnostics: Option<SolveDiagnostics>,
}

impl<S: SimulationContext> Calibration<S> {
    /// Binds a new orchestrator to a simulation, capturing the current
    /// weights of `weight_variable` as the pre-calibration reference.
    pub fn new(
        simulation: S,
        weight_variable: impl Into<String>,
        period: impl Into<String>,
        parameters: CalibrationParameters,
    ) -> Result<Self> {
        let weight_variable = weight_variable.into();
        let period = period.into();
        let entity = simulation.variable_entity(&weight_variable)?;
        let initial_weights = simulation.get_weight(&entity, &period)?;
        let weights = initial_weights.clone();

        Ok(Self {
            simulation,
            weight_variable,
            entity,
            period,
            filter_variable: None,
            margins: BTreeMap::new(),
            total_population: None,
            parameters,
            initial_weights,
            weights,
            diagnostics: None,
        })
    }

    /// Entity the calibrated weight is defined over.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Current (latest calibrated) weight vector.
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    /// Pre-calibration weight vector.
    pub fn initial_weights(&self) -> &DVector<f64> {
        &self.initial_weights
    }

    /// Diagnostics of the most recent solver run, if any.
    pub fn solve_diagnostics(&self) -> Option<&SolveDiagnostics> {
        self.diagnostics.as_ref()
    }

    /// Target and aggregates registered for a margin variable.
    pub fn margin(&self, variable: &str) -> Option<&MarginDiagnostics> {
        self.margins.get(variable)
    }

    /// Restricts calibration to units where `variable` is non-zero. Units
    /// outside the filter keep their weight unchanged.
    pub fn set_filter_variable(&mut self, variable: impl Into<String>) -> Result<()> {
        let variable = variable.into();
        self.check_entity(&variable)?;
        self.filter_variable = Some(variable);
        self.refresh_margin_diagnostics()?;
        Ok(())
    }

    /// Sets the overall population target.
    pub fn set_total_population(&mut self, total: f64) {
        self.total_population = Some(total);
    }

    /// Registers (or replaces) a margin for a variable.
    ///
    /// Categorical variables expect one target per current category, in
    /// ascending category order over the filtered population; scalar
    /// variables expect exactly one target value.
    pub fn set_target_margin(&mut self, variable: &str, targets: &[f64]) -> Result<()> {
        self.check_entity(variable)?;
        let values = self.variable_values(variable)?;
        let filter = self.filter_mask()?;

        let target = if self.simulation.is_categorical(variable)? {
            let categories = observed_categories(&values, &filter);
            if targets.len() != categories.len() {
                return Err(CalibrationError::dimension_mismatch(
                    "categorical margin targets",
                    categories.len(),
                    targets.len(),
                ));
            }
            Margin::categorical(categories.into_iter().zip(targets.iter().copied()))
        } else {
            if targets.len() != 1 {
                return Err(CalibrationError::dimension_mismatch(
                    "scalar margin target",
                    1,
                    targets.len(),
                ));
            }
            Margin::Scalar(targets[0])
        };

        let diagnostics = MarginDiagnostics {
            actual: aggregate(&target, &values, &self.weights, &filter),
            initial: aggregate(&target, &values, &self.initial_weights, &filter),
            target,
        };
        self.margins.insert(variable.to_string(), diagnostics);
        Ok(())
    }

    /// Runs the solver against the current margins and stores the calibrated
    /// weights. Units outside the filter mask keep their previous weight.
    pub fn calibrate(&mut self) -> Result<()> {
        if self.margins.is_empty() && self.total_population.is_none() {
            return Err(CalibrationError::EmptyMargins);
        }

        let filter = self.filter_mask()?;
        let selected: Vec<usize> = (0..self.weights.len()).filter(|&i| filter[i]).collect();

        let data = self.build_solver_table(&selected)?;
        let margin_set = self.margin_set();

        let solution = rake(&data, &margin_set, &self.weight_variable, &self.parameters)?;

        for (position, &index) in selected.iter().enumerate() {
            self.weights[index] = solution.weights[position];
        }
        info!(
            "calibrated `{}` over {} of {} units",
            self.weight_variable,
            selected.len(),
            self.weights.len()
        );

        // Adopt the realized (possibly rescaled) targets so later runs and
        // reports agree with what the solver actually enforced.
        for (variable, diagnostics) in &mut self.margins {
            if let Some(realized) = solution.realized_margins.get(variable) {
                diagnostics.target = realized.clone();
            }
        }
        self.diagnostics = Some(solution.diagnostics);
        self.refresh_margin_diagnostics()?;
        Ok(())
    }

    /// Commits the calibrated weights into the simulation and invalidates
    /// weight variables derived from them.
    pub fn set_calibrated_weights(&mut self) -> Result<()> {
        self.simulation
            .set_weight(&self.entity, &self.period, &self.weights)?;
        self.simulation
            .invalidate_derived(&self.weight_variable, &self.period)
    }

    /// Restores the pre-calibration weights, both here and in the simulation.
    pub fn reset(&mut self) -> Result<()> {
        self.weights = self.initial_weights.clone();
        self.simulation
            .set_weight(&self.entity, &self.period, &self.weights)?;
        self.simulation
            .invalidate_derived(&self.weight_variable, &self.period)
    }

    fn check_entity(&self, variable: &str) -> Result<()> {
        let entity = self.simulation.variable_entity(variable)?;
        if entity != self.entity {
            return Err(CalibrationError::not_supported(format!(
                "variable `{variable}` at entity `{entity}` while calibrating `{}` at entity `{}`",
                self.weight_variable, self.entity
            )));
        }
        Ok(())
    }

    fn variable_values(&self, variable: &str) -> Result<DVector<f64>> {
        let values = self
            .simulation
            .get_variable_values(variable, &self.period)?;
        if values.len() != self.weights.len() {
            return Err(CalibrationError::dimension_mismatch(
                "margin variable length",
                self.weights.len(),
                values.len(),
            ));
        }
        Ok(values)
    }

    fn filter_mask(&self) -> Result<Vec<bool>> {
        match &self.filter_variable {
            None => Ok(vec![true; self.weights.len()]),
            Some(variable) => {
                let values = self.variable_values(variable)?;
                Ok(values.iter().map(|&v| v != 0.0 && !v.is_nan()).collect())
            }
        }
    }

    fn margin_set(&self) -> MarginSet {
        let mut set = MarginSet::new();
        for (variable, diagnostics) in &self.margins {
            set.insert(variable.clone(), diagnostics.target.clone());
        }
        if let Some(total) = self.total_population {
            set.set_total_population(total);
        }
        set
    }

    fn build_solver_table(&self, selected: &[usize]) -> Result<SurveyData> {
        let mut builder = SurveyDataBuilder::new().column(
            self.weight_variable.clone(),
            restrict(&self.weights, selected),
        );
        for variable in self.margins.keys() {
            let values = self.variable_values(variable)?;
            builder = builder.column(variable.clone(), restrict(&values, selected));
        }
        builder.build()
    }

    fn refresh_margin_diagnostics(&mut self) -> Result<()> {
        let filter = self.filter_mask()?;
        let variables: Vec<String> = self.margins.keys().cloned().collect();
        for variable in variables {
            let values = self.variable_values(&variable)?;
            let diagnostics = self.margins.get_mut(&variable).expect("registered margin");
            diagnostics.actual = aggregate(&diagnostics.target, &values, &self.weights, &filter);
            diagnostics.initial =
                aggregate(&diagnostics.target, &values, &self.initial_weights, &filter);
        }
        Ok(())
    }
}

/// Sorted distinct category codes observed over the filtered population.
fn observed_categories(values: &DVector<f64>, filter: &[bool]) -> Vec<i64> {
    let mut categories = BTreeSet::new();
    for (value, selected) in values.iter().zip(filter) {
        if *selected && !value.is_nan() {
            categories.insert(value.round() as i64);
        }
    }
    categories.into_iter().collect()
}

/// Weighted aggregate of a variable in the shape of its margin target.
fn aggregate(target: &Margin, values: &DVector<f64>, weights: &DVector<f64>, filter: &[bool]) -> Margin {
    match target {
        Margin::Scalar(_) => {
            let sum = values
                .iter()
                .zip(weights.iter())
                .zip(filter)
                .filter(|((value, weight), selected)| {
                    **selected && !value.is_nan() && !weight.is_nan()
                })
                .map(|((value, weight), _)| value * weight)
                .sum();
            Margin::Scalar(sum)
        }
        Margin::Categorical(targets) => Margin::Categorical(
            targets
                .keys()
                .map(|&category| {
                    let code = category as f64;
                    let mass = values
                        .iter()
                        .zip(weights.iter())
                        .zip(filter)
                        .filter(|((value, weight), selected)| {
                            **selected && **value == code && !weight.is_nan()
                        })
                        .map(|((_, weight), _)| *weight)
                        .sum();
                    (category, mass)
                })
                .collect(),
        ),
    }
}

/// Gathers the entries of `vector` at `indices`.
fn restrict(vector: &DVector<f64>, indices: &[usize]) -> DVector<f64> {
    DVector::from_iterator(indices.len(), indices.iter().map(|&i| vector[i]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::CalibrationMethod;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    /// Minimal weight-holding runtime for exercising the orchestrator.
    struct MockSimulation {
        weights: DVector<f64>,
        columns: BTreeMap<String, DVector<f64>>,
        categorical: BTreeSet<String>,
        entities: BTreeMap<String, String>,
        invalidated: Vec<(String, String)>,
    }

    impl MockSimulation {
        fn new() -> Self {
            let mut columns = BTreeMap::new();
            columns.insert(
                "region".to_string(),
                DVector::from_row_slice(&[1.0, 1.0, 2.0, 2.0, 2.0, 1.0]),
            );
            columns.insert(
                "income".to_string(),
                DVector::from_row_slice(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0]),
            );
            columns.insert(
                "surveyed".to_string(),
                DVector::from_row_slice(&[1.0, 1.0, 1.0, 1.0, 1.0, 0.0]),
            );
            let mut entities = BTreeMap::new();
            for variable in ["household_weight", "region", "income", "surveyed"] {
                entities.insert(variable.to_string(), "household".to_string());
            }
            entities.insert("person_weight".to_string(), "person".to_string());

            Self {
                weights: DVector::from_row_slice(&[1.0, 2.0, 3.0, 2.0, 1.0, 1.0]),
                columns,
                categorical: BTreeSet::from(["region".to_string()]),
                entities,
                invalidated: Vec::new(),
            }
        }
    }

    impl SimulationContext for MockSimulation {
        fn variable_entity(&self, variable: &str) -> Result<String> {
            self.entities
                .get(variable)
                .cloned()
                .ok_or_else(|| CalibrationError::context(format!("unknown variable `{variable}`")))
        }

        fn is_categorical(&self, variable: &str) -> Result<bool> {
            Ok(self.categorical.contains(variable))
        }

        fn get_weight(&self, entity: &str, _period: &str) -> Result<DVector<f64>> {
            if entity != "household" {
                return Err(CalibrationError::context(format!(
                    "no weight for entity `{entity}`"
                )));
            }
            Ok(self.weights.clone())
        }

        fn get_variable_values(&self, variable: &str, _period: &str) -> Result<DVector<f64>> {
            self.columns
                .get(variable)
                .cloned()
                .ok_or_else(|| CalibrationError::context(format!("unknown variable `{variable}`")))
        }

        fn set_weight(&mut self, entity: &str, _period: &str, weights: &DVector<f64>) -> Result<()> {
            if entity != "household" {
                return Err(CalibrationError::context(format!(
                    "no weight for entity `{entity}`"
                )));
            }
            self.weights = weights.clone();
            Ok(())
        }

        fn invalidate_derived(&mut self, variable: &str, period: &str) -> Result<()> {
            self.invalidated.push((variable.to_string(), period.to_string()));
            Ok(())
        }
    }

    fn orchestrator() -> Calibration<MockSimulation> {
        let parameters =
            CalibrationParameters::default().with_method(CalibrationMethod::RakingRatio);
        Calibration::new(MockSimulation::new(), "household_weight", "2023", parameters).unwrap()
    }

    #[test]
    fn registers_categorical_margins_with_observed_categories() {
        let mut calibration = orchestrator();
        calibration
            .set_target_margin("region", &[4.0, 8.0])
            .unwrap();

        let diagnostics = calibration.margin("region").unwrap();
        assert_eq!(
            diagnostics.target,
            Margin::categorical([(1, 4.0), (2, 8.0)])
        );
        // Initial masses: region 1 holds weights 1 + 2 + 1, region 2 holds 3 + 2 + 1.
        assert_eq!(
            diagnostics.initial,
            Margin::categorical([(1, 4.0), (2, 6.0)])
        );
    }

    #[test]
    fn rejects_mismatched_categorical_target_length() {
        let mut calibration = orchestrator();
        let result = calibration.set_target_margin("region", &[4.0, 8.0, 1.0]);
        assert!(matches!(
            result,
            Err(CalibrationError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn rejects_margins_on_a_different_entity() {
        let mut calibration = orchestrator();
        let result = calibration.set_target_margin("person_weight", &[1.0]);
        assert!(matches!(result, Err(CalibrationError::NotSupported { .. })));
    }

    #[test]
    fn calibrate_without_margins_is_a_programmer_error() {
        let mut calibration = orchestrator();
        assert!(matches!(
            calibration.calibrate(),
            Err(CalibrationError::EmptyMargins)
        ));
    }

    #[test]
    fn calibrate_meets_margins_and_updates_diagnostics() {
        let mut calibration = orchestrator();
        calibration.set_target_margin("region", &[4.0, 8.0]).unwrap();
        calibration.set_target_margin("income", &[300.0]).unwrap();
        calibration.set_total_population(12.0);

        calibration.calibrate().unwrap();

        assert!(calibration.solve_diagnostics().unwrap().converged);
        let region = calibration.margin("region").unwrap();
        match (&region.actual, &region.target) {
            (Margin::Categorical(actual), Margin::Categorical(target)) => {
                for (category, mass) in actual {
                    assert_relative_eq!(*mass, target[category], epsilon = 1e-6);
                }
            }
            _ => panic!("expected categorical diagnostics"),
        }
        let income = calibration.margin("income").unwrap();
        match income.actual {
            Margin::Scalar(sum) => assert_relative_eq!(sum, 300.0, epsilon = 1e-4),
            _ => panic!("expected scalar diagnostics"),
        }
        assert_relative_eq!(calibration.weights().sum(), 12.0, epsilon = 1e-6);
    }

    #[test]
    fn filtered_units_keep_their_weight() {
        let mut calibration = orchestrator();
        calibration.set_filter_variable("surveyed").unwrap();
        calibration.set_target_margin("income", &[250.0]).unwrap();

        calibration.calibrate().unwrap();

        // Unit 5 is outside the filter and must be untouched, exactly.
        assert_eq!(calibration.weights()[5], 1.0);
        let filtered_income: f64 = (0..5)
            .map(|i| calibration.weights()[i] * [10.0, 20.0, 30.0, 40.0, 50.0][i])
            .sum();
        assert_relative_eq!(filtered_income, 250.0, epsilon = 1e-6);
    }

    #[test]
    fn commit_and_reset_round_trip() {
        let mut calibration = orchestrator();
        calibration.set_target_margin("income", &[300.0]).unwrap();
        calibration.calibrate().unwrap();

        calibration.set_calibrated_weights().unwrap();
        assert_eq!(calibration.simulation.weights, calibration.weights);
        assert_eq!(
            calibration.simulation.invalidated,
            vec![("household_weight".to_string(), "2023".to_string())]
        );

        calibration.reset().unwrap();
        assert_eq!(calibration.weights, calibration.initial_weights);
        assert_eq!(
            calibration.simulation.weights,
            DVector::from_row_slice(&[1.0, 2.0, 3.0, 2.0, 1.0, 1.0])
        );
    }

    #[test]
    fn calibrating_twice_is_stable() {
        let mut calibration = orchestrator();
        calibration.set_target_margin("region", &[4.0, 8.0]).unwrap();
        calibration.set_total_population(12.0);

        calibration.calibrate().unwrap();
        let first = calibration.weights().clone();
        calibration.calibrate().unwrap();

        for (a, b) in first.iter().zip(calibration.weights().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-8);
        }
    }
}

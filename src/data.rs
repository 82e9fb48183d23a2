//! Column-oriented survey data containers and validation utilities used by the solver.

use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::error::{CalibrationError, Result};
use crate::margins::TOTAL_POPULATION_KEY;

/// Represents observation-level survey data: one numeric column per variable,
/// all columns of equal length. Missing values are encoded as NaN.
#[derive(Clone, Debug)]
pub struct SurveyData {
    columns: BTreeMap<String, DVector<f64>>,
    observations: usize,
}

impl SurveyData {
    /// Creates a `SurveyData` instance from validated columns.
    pub fn new(columns: BTreeMap<String, DVector<f64>>) -> Result<Self> {
        let mut builder = SurveyDataBuilder::new();
        for (name, values) in columns {
            builder = builder.column(name, values);
        }
        builder.build()
    }

    /// Number of observations (rows).
    pub fn observations(&self) -> usize {
        self.observations
    }

    /// Whether the table holds any column.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Whether a column with the given name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Returns a read-only view of a column, failing on unknown names.
    pub fn column(&self, name: &str) -> Result<&DVector<f64>> {
        self.columns
            .get(name)
            .ok_or_else(|| CalibrationError::unknown_column(name))
    }

    /// Iterates over column names in deterministic (sorted) order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

/// Builder that validates column shapes and names before constructing [`SurveyData`].
#[derive(Debug, Default)]
pub struct SurveyDataBuilder {
    columns: Vec<(String, DVector<f64>)>,
}

impl SurveyDataBuilder {
    /// Start building an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column from an owned vector.
    pub fn column(mut self, name: impl Into<String>, values: DVector<f64>) -> Self {
        self.columns.push((name.into(), values));
        self
    }

    /// Adds a column from a slice of values.
    pub fn column_from_slice(self, name: impl Into<String>, values: &[f64]) -> Self {
        self.column(name, DVector::from_row_slice(values))
    }

    /// Finalizes construction after validating lengths and reserved names.
    pub fn build(self) -> Result<SurveyData> {
        let mut columns = BTreeMap::new();
        let mut observations = None;

        for (name, values) in self.columns {
            if name == TOTAL_POPULATION_KEY {
                return Err(CalibrationError::reserved(name));
            }
            let expected = *observations.get_or_insert(values.len());
            if values.len() != expected {
                return Err(CalibrationError::dimension_mismatch(
                    "column length",
                    expected,
                    values.len(),
                ));
            }
            columns.insert(name, values);
        }

        Ok(SurveyData {
            columns,
            observations: observations.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_validates_and_constructs() {
        let data = SurveyDataBuilder::new()
            .column_from_slice("x", &[1.0, 2.0, 3.0])
            .column_from_slice("weight", &[10.0, 20.0, 30.0])
            .build()
            .expect("valid data");

        assert_eq!(data.observations(), 3);
        assert!(data.contains("x"));
        assert_eq!(data.column("weight").unwrap()[1], 20.0);
        let names: Vec<_> = data.column_names().collect();
        assert_eq!(names, vec!["weight", "x"]);
    }

    #[test]
    fn builder_rejects_ragged_columns() {
        let result = SurveyDataBuilder::new()
            .column_from_slice("x", &[1.0, 2.0])
            .column_from_slice("y", &[1.0, 2.0, 3.0])
            .build();
        assert!(matches!(
            result,
            Err(CalibrationError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn builder_rejects_reserved_names() {
        let result = SurveyDataBuilder::new()
            .column_from_slice("total_population", &[1.0])
            .build();
        assert!(matches!(result, Err(CalibrationError::ReservedName { .. })));
    }

    #[test]
    fn unknown_column_lookup_fails() {
        let data = SurveyDataBuilder::new()
            .column_from_slice("x", &[1.0])
            .build()
            .unwrap();
        assert!(matches!(
            data.column("missing"),
            Err(CalibrationError::UnknownColumn { .. })
        ));
    }
}

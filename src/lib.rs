//! Generalized raking (calibration on margins) for survey weights.
//!
//! This crate adjusts survey sampling weights so that weighted aggregates of
//! chosen variables match externally known population totals. It offers tools
//! to
//!
//! - hold column-oriented survey data (`data` module),
//! - describe scalar and categorical margin targets (`margins` module),
//! - solve the calibration problem with linear, raking-ratio, or bounded
//!   logit distance functions (`raking` module), and
//! - orchestrate calibration against a live weight-holding simulation
//!   (`calibration` module).
//!
//! The solver works on the dual formulation: a Newton iteration over one
//! Lagrange multiplier per margin constraint, with a bounded retry loop for
//! runs that stall short of convergence. Non-convergence is reported through
//! diagnostics rather than an error, so close-enough results stay usable.
//!
//! # Quick start
//!
//! ```no_run
//! use rakers::{CalibrationMethod, CalibrationParameters, Margin, MarginSet};
//! use rakers::data::SurveyDataBuilder;
//! use rakers::raking::rake;
//!
//! let data = SurveyDataBuilder::new()
//!     .column_from_slice("weight", &[10.0, 8.0, 11.0, 9.0])
//!     .column_from_slice("sex", &[1.0, 2.0, 1.0, 2.0])
//!     .column_from_slice("income", &[20.0, 30.0, 40.0, 10.0])
//!     .build()
//!     .expect("validated survey data");
//!
//! let margins = MarginSet::new()
//!     .with_margin("sex", Margin::categorical([(1, 20.0), (2, 18.0)]))
//!     .with_margin("income", Margin::Scalar(1000.0));
//!
//! let parameters = CalibrationParameters::default()
//!     .with_method(CalibrationMethod::RakingRatio);
//!
//! let solution = rake(&data, &margins, "weight", &parameters).expect("solvable margins");
//! println!(
//!     "worst relative margin error: {:.2e}",
//!     solution.diagnostics.worst_relative_error
//! );
//! ```
//!
//! Orchestration against a simulation goes through the
//! [`SimulationContext`] trait: implement it for your runtime, then register
//! margins and call [`Calibration::calibrate`].

pub mod calibration;
pub mod data;
pub mod distance;
pub mod error;
pub mod margins;
pub mod options;
pub mod raking;
pub mod solving;

pub use calibration::{Calibration, MarginDiagnostics, SimulationContext};
pub use distance::CalibrationMethod;
pub use error::{CalibrationError, Result};
pub use margins::{Margin, MarginSet, TOTAL_POPULATION_KEY};
pub use options::CalibrationParameters;
pub use raking::{rake, RakingSolution};
pub use solving::{SolveDiagnostics, SolverOptions};

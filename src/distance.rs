//! Distance functions mapping adjustment potentials to weight ratios.
//!
//! Each calibration method pairs a ratio function `F` with its derivative
//! `F'`. `F(0) = 1` for every method, so zero multipliers leave the weights
//! untouched.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};

/// Distance-function family selecting how far weights may move.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CalibrationMethod {
    /// `F(u) = 1 + u`; unbounded, may produce negative weights.
    Linear,
    /// `F(u) = exp(u)`; keeps weights positive.
    RakingRatio,
    /// Bounded sigmoid keeping the weight ratio inside `(lower, upper)`.
    /// Requires `lower < 1 < upper` strictly.
    Logit { lower: f64, upper: f64 },
}

impl Default for CalibrationMethod {
    fn default() -> Self {
        Self::Linear
    }
}

impl CalibrationMethod {
    /// Checks the method's preconditions before any solving occurs.
    pub fn validate(&self) -> Result<()> {
        if let Self::Logit { lower, upper } = *self {
            if !(lower.is_finite() && upper.is_finite() && lower < 1.0 && 1.0 < upper) {
                return Err(CalibrationError::InvalidBounds { lower, upper });
            }
        }
        Ok(())
    }

    /// Weight-ratio function `F` evaluated at one potential.
    pub fn adjustment(&self, u: f64) -> f64 {
        match *self {
            Self::Linear => 1.0 + u,
            Self::RakingRatio => u.exp(),
            Self::Logit { lower, upper } => {
                let e = (logit_scale(lower, upper) * u).exp();
                if e.is_infinite() {
                    return upper;
                }
                (lower * (upper - 1.0) + upper * (1.0 - lower) * e)
                    / (upper - 1.0 + (1.0 - lower) * e)
            }
        }
    }

    /// Derivative `F'` evaluated at one potential.
    pub fn adjustment_derivative(&self, u: f64) -> f64 {
        match *self {
            Self::Linear => 1.0,
            Self::RakingRatio => u.exp(),
            Self::Logit { lower, upper } => {
                let a = logit_scale(lower, upper);
                let e = (a * u).exp();
                if e.is_infinite() {
                    return 0.0;
                }
                let numerator = lower * (upper - 1.0) + upper * (1.0 - lower) * e;
                let denominator = upper - 1.0 + (1.0 - lower) * e;
                let numerator_prime = upper * (1.0 - lower) * a * e;
                let denominator_prime = (1.0 - lower) * a * e;
                (numerator_prime * denominator - numerator * denominator_prime)
                    / (denominator * denominator)
            }
        }
    }

    /// Element-wise `F` over a vector of potentials.
    pub(crate) fn apply(&self, potentials: &DVector<f64>) -> DVector<f64> {
        potentials.map(|u| self.adjustment(u))
    }

    /// Element-wise `F'` over a vector of potentials.
    pub(crate) fn apply_derivative(&self, potentials: &DVector<f64>) -> DVector<f64> {
        potentials.map(|u| self.adjustment_derivative(u))
    }
}

fn logit_scale(lower: f64, upper: f64) -> f64 {
    (upper - lower) / ((1.0 - lower) * (upper - 1.0))
}

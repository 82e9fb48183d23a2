use thiserror::Error;

/// Unified error type for `rakers` operations.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Raised when no margin and no total-population target have been supplied.
    #[error("at least one margin or a total population target is required")]
    EmptyMargins,

    /// Raised when categorical margin targets disagree with the total
    /// population and proportional rescaling is disabled.
    #[error(
        "margins for `{variable}` sum to {found} but the total population is {expected}; \
         enable proportional rescaling or fix the targets"
    )]
    MarginInconsistency {
        variable: String,
        expected: f64,
        found: f64,
    },

    /// Raised when a data column collides with an internally reserved name.
    #[error("column name `{name}` is reserved")]
    ReservedName { name: String },

    /// Raised when a margin is requested on a variable whose entity differs
    /// from the calibrated weight's entity.
    #[error("no weight propagation path for {context}")]
    NotSupported { context: String },

    /// Raised when `logit` bounds are missing or do not satisfy `lower < 1 < upper`.
    #[error("logit bounds must satisfy lower < 1 < upper, found [{lower}, {upper}]")]
    InvalidBounds { lower: f64, upper: f64 },

    /// Raised when a named column or variable is absent from the data.
    #[error("column `{name}` not found in the survey data")]
    UnknownColumn { name: String },

    /// Raised when provided arrays have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when preprocessing drops every observation.
    #[error("no observation left after dropping missing weights and margin values")]
    NoRetainedObservations,

    /// Raised when the simulation context fails to honor a request.
    #[error("simulation context error: {message}")]
    Context { message: String },
}

impl CalibrationError {
    /// Helper to format a [`DimensionMismatch`](CalibrationError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for rejecting reserved column names.
    pub fn reserved(name: impl Into<String>) -> Self {
        Self::ReservedName { name: name.into() }
    }

    /// Helper for unknown column lookups.
    pub fn unknown_column(name: impl Into<String>) -> Self {
        Self::UnknownColumn { name: name.into() }
    }

    /// Helper for unsupported weight propagation paths.
    pub fn not_supported(context: impl Into<String>) -> Self {
        Self::NotSupported {
            context: context.into(),
        }
    }

    /// Helper for errors surfaced by a [`SimulationContext`](crate::calibration::SimulationContext).
    pub fn context(message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, CalibrationError>;

//! Error type shared by the kernels, the estimator and the test systems.

#[cfg(feature = "python")]
use pyo3::prelude::PyErr;
use thiserror::Error;

/// Enum for errors in this crate
#[derive(Error, Debug)]
pub enum TramError {
    /// Error returned when TramDirectBuilder.build() was called improperly
    #[error("Could not build TramDirect: {0}")]
    BuilderError(String),

    /// Error returned when a python exception is not handled
    #[cfg(feature = "python")]
    #[error("Unexpected Python exception was not handled")]
    UnhandledPythonException {
        #[allow(missing_docs)]
        #[from]
        source: PyErr,
    },

    /// Error returned when an array has the wrong extents
    #[error("{name} has shape {actual:?}; shape should be {expected:?}")]
    ShapeMismatch {
        /// Name of the offending argument
        name: &'static str,
        /// Shape of the argument as passed
        actual: Vec<usize>,
        /// Shape implied by the number of thermodynamic states, configurational states and frames
        expected: Vec<usize>,
    },

    /// Error returned when there are no thermodynamic or no configurational states
    #[error("{name} has shape {shape:?}; at least one thermodynamic and one configurational state are required")]
    EmptyExtent {
        /// Name of the argument that declares the extents
        name: &'static str,
        /// Shape of the argument as passed
        shape: Vec<usize>,
    },

    /// Error returned when a frame is assigned to a configurational state that does not exist
    #[error("state_sequence[{frame}] is {state}, but there are only {n_conf_states} configurational states")]
    StateOutOfRange {
        #[allow(missing_docs)]
        frame: usize,
        #[allow(missing_docs)]
        state: usize,
        #[allow(missing_docs)]
        n_conf_states: usize,
    },

    /// Error returned when a state is left or entered more often than it was visited
    #[error("state_counts[{therm_state}, {conf_state}] is {visits}, but the count matrix has {transitions} transitions {direction} that state")]
    InconsistentCounts {
        #[allow(missing_docs)]
        therm_state: usize,
        #[allow(missing_docs)]
        conf_state: usize,
        #[allow(missing_docs)]
        visits: usize,
        #[allow(missing_docs)]
        transitions: usize,
        /// "out of" for row sums, "into" for column sums
        direction: &'static str,
    },

    /// Error returned when a multiplier or weight is negative, NaN or infinite
    #[error("{name}[{therm_state}, {conf_state}] is {value}; values must be finite and non-negative")]
    InvalidIterate {
        #[allow(missing_docs)]
        name: &'static str,
        #[allow(missing_docs)]
        therm_state: usize,
        #[allow(missing_docs)]
        conf_state: usize,
        #[allow(missing_docs)]
        value: f64,
    },

    /// Error returned when a bias energy is NaN or negative infinity
    #[error("bias_sequence[{frame}, {therm_state}] is {value}")]
    InvalidBias {
        #[allow(missing_docs)]
        frame: usize,
        #[allow(missing_docs)]
        therm_state: usize,
        #[allow(missing_docs)]
        value: f64,
    },

    /// Error returned when a count array passed from Python has a negative entry
    #[error("{name} contains the negative count {value}")]
    NegativeCount {
        #[allow(missing_docs)]
        name: &'static str,
        #[allow(missing_docs)]
        value: i64,
    },
}

impl From<String> for TramError {
    fn from(s: String) -> Self {
        Self::BuilderError(s)
    }
}

/// Result type for the tram-rs crate
pub type Result<T> = std::result::Result<T, TramError>;

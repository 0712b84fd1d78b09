//! The single error surface of the crate.

/// An error type for clear diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum OptimixError {
    #[error("Variable `{name}` not found.")]
    NameNotFound { name: String },

    #[error("Shape mismatch for variable `{name}`: expected shape {expected:?}, found {found:?}.")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Flat vector has {found} elements but the variables hold {expected}.")]
    LengthMismatch { expected: usize, found: usize },

    #[error("Variables must have rank 0, 1 or 2, got rank {ndim}.")]
    InvalidRank { ndim: usize },

    #[error("Invalid bounds ({lower}, {upper}).")]
    InvalidBounds { lower: f64, upper: f64 },

    #[error("L-BFGS-B: too many function evaluations or too many iterations")]
    SolverDivergence { task: String },

    #[error("L-BFGS-B: {task}")]
    SolverInternal { task: String },

    /// Raised by objectives that cannot be evaluated at the requested point.
    #[error("Bad solution: {0}")]
    BadSolution(String),

    #[error("Too many bad solutions")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<OptimixError>,
    },

    #[error("Bad solution at the first iteration.")]
    FirstIterationFailure {
        #[source]
        source: Box<OptimixError>,
    },

    #[error("The number of variables must be equal to one.")]
    InvalidProblemShape { free: usize },
}

impl OptimixError {
    /// Whether a restart from a perturbed point may get past this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OptimixError::BadSolution(_) | OptimixError::SolverInternal { .. }
        )
    }

    /// Attaches a variable name to shape errors raised below the name-aware layer.
    pub(crate) fn with_name(self, name: &str) -> Self {
        match self {
            OptimixError::ShapeMismatch {
                expected, found, ..
            } => OptimixError::ShapeMismatch {
                name: name.to_string(),
                expected,
                found,
            },
            other => other,
        }
    }
}

pub type Result<T, E = OptimixError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::OptimixError;
    use spectral::prelude::*;
    use std::error::Error;

    #[test]
    fn retry_messages_match_historical_wording() {
        let cause = OptimixError::SolverInternal {
            task: "ABNORMAL_TERMINATION_IN_LNSRCH".into(),
        };
        assert_that(&cause.to_string())
            .is_equal_to("L-BFGS-B: ABNORMAL_TERMINATION_IN_LNSRCH".to_string());

        let err = OptimixError::RetryExhausted {
            attempts: 5,
            source: Box::new(cause),
        };
        assert_that(&err.to_string()).is_equal_to("Too many bad solutions".to_string());
        let source = err.source().map(|s| s.to_string());
        assert_that(&source)
            .is_equal_to(Some("L-BFGS-B: ABNORMAL_TERMINATION_IN_LNSRCH".to_string()));
    }

    #[test]
    fn only_solver_hiccups_are_transient() {
        assert!(OptimixError::BadSolution("nan".into()).is_transient());
        assert!(OptimixError::SolverInternal { task: String::new() }.is_transient());
        assert!(!OptimixError::NameNotFound { name: "a".into() }.is_transient());
        assert!(!OptimixError::SolverDivergence { task: String::new() }.is_transient());
    }

    #[test]
    fn shape_errors_pick_up_the_variable_name() {
        let err = OptimixError::ShapeMismatch {
            name: String::new(),
            expected: vec![2],
            found: vec![3],
        }
        .with_name("scale");
        assert!(matches!(err, OptimixError::ShapeMismatch { ref name, .. } if name == "scale"));
    }
}

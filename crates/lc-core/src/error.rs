//! Error types for loyalty-causal

use thiserror::Error;

/// loyalty-causal error type
///
/// One variant per pipeline stage so a caller can tell which component
/// rejected its input.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input or configuration
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed or cyclic causal graph, or missing treatment/outcome node
    #[error("Graph error: {0}")]
    Graph(String),

    /// No adjustment set satisfies the backdoor criterion
    #[error("Identification error: {0}")]
    Identification(String),

    /// Degenerate propensity input or empty matched sample
    #[error("Estimation error: {0}")]
    Estimation(String),

    /// No eligible controls, or the caliper removed every treated unit
    #[error("Matcher error: {0}")]
    Matcher(String),

    /// A perturbed re-run inside a refutation check failed
    #[error("Refutation error in '{check}': {source}")]
    Refutation {
        /// Name of the refutation check.
        check: String,
        /// Error raised by the perturbed pipeline run.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Name of the component that raised this error.
    pub fn component(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Graph(_) => "causal-graph",
            Error::Identification(_) => "identifier",
            Error::Estimation(_) => "estimator",
            Error::Matcher(_) => "matcher",
            Error::Refutation { .. } => "refuter",
        }
    }

    /// Wrap an error raised during a refutation re-run.
    pub fn refutation(check: impl Into<String>, source: Error) -> Self {
        Error::Refutation { check: check.into(), source: Box::new(source) }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

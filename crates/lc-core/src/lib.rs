//! # lc-core
//!
//! Shared foundation for loyalty-causal: the error taxonomy, the
//! one-row-per-user cohort table consumed by the estimation chain, and a few
//! numerically stable helpers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod math;
pub mod types;

pub use error::{Error, Result};
pub use types::{CohortTable, Covariate, CovariateKind, UnitRecord};

/// Workspace version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! # lc-sim
//!
//! Synthetic loyalty-program data: a user-month spend panel with a known
//! enrollment effect, and its aggregation into a pre/post cohort table for
//! estimation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cohort;
pub mod panel;

pub use cohort::{CohortRecord, CohortWindow, PRE_SPEND, cohort_table, prepare_cohort};
pub use panel::{PanelRow, SimulationConfig, simulate_panel};

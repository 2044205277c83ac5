//! Synthetic user-month spend panel.
//!
//! Half of the users (fair coin) enroll in a month drawn uniformly from
//! `1..num_months`; the rest never enroll (`signup_month = 0`). Monthly spend
//! is `Poisson(base_spend_lambda) - month * month_decay_rate`, plus
//! `treatment_effect` in every month strictly after enrollment.

use lc_core::{Error, Result};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

/// Generator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Number of users.
    pub num_users: usize,
    /// Months observed per user, numbered from 1.
    pub num_months: u32,
    /// Poisson mean of baseline monthly spend.
    pub base_spend_lambda: f64,
    /// Linear spend decrease per month.
    pub month_decay_rate: f64,
    /// Additive spend lift after enrollment.
    pub treatment_effect: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_users: 10_000,
            num_months: 12,
            base_spend_lambda: 500.0,
            month_decay_rate: 10.0,
            treatment_effect: 100.0,
        }
    }
}

impl SimulationConfig {
    /// Range checks.
    pub fn validate(&self) -> Result<()> {
        if self.num_users == 0 {
            return Err(Error::Validation("simulation.num_users must be > 0".into()));
        }
        if self.num_months < 2 {
            return Err(Error::Validation(format!(
                "simulation.num_months must be >= 2 to leave a signup month, got {}",
                self.num_months
            )));
        }
        if !(self.base_spend_lambda.is_finite() && self.base_spend_lambda > 0.0) {
            return Err(Error::Validation(format!(
                "simulation.base_spend_lambda must be finite and > 0, got {}",
                self.base_spend_lambda
            )));
        }
        if !self.month_decay_rate.is_finite() || !self.treatment_effect.is_finite() {
            return Err(Error::Validation(
                "simulation.month_decay_rate and treatment_effect must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// One user-month observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelRow {
    /// User id, `0..num_users`.
    pub user_id: u64,
    /// Enrollment month, or 0 for never enrolled.
    pub signup_month: u32,
    /// Observation month, `1..=num_months`.
    pub month: u32,
    /// Spend in this month.
    pub spend: f64,
    /// `signup_month > 0`.
    pub treatment: bool,
}

/// Generate `num_users * num_months` rows, user-major, months ascending.
/// Identical `config` and `seed` give identical panels.
pub fn simulate_panel(config: &SimulationConfig, seed: u64) -> Result<Vec<PanelRow>> {
    config.validate()?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let spend = Poisson::new(config.base_spend_lambda)
        .map_err(|e| Error::Validation(format!("base_spend_lambda: {e}")))?;

    let months = config.num_months as usize;
    let mut rows = Vec::with_capacity(config.num_users * months);
    for user_id in 0..config.num_users as u64 {
        let enrolls = rng.random_bool(0.5);
        let month = rng.random_range(1..config.num_months);
        let signup_month = if enrolls { month } else { 0 };
        let treatment = signup_month > 0;

        for month in 1..=config.num_months {
            let base: f64 = spend.sample(&mut rng);
            let mut value = base - f64::from(month) * config.month_decay_rate;
            if treatment && month > signup_month {
                value += config.treatment_effect;
            }
            rows.push(PanelRow { user_id, signup_month, month, spend: value, treatment });
        }
    }

    tracing::debug!(
        num_users = config.num_users,
        num_months = config.num_months,
        rows = rows.len(),
        seed,
        "simulated panel"
    );
    Ok(rows)
}

//! Common data types for loyalty-causal

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Measurement scale of a pre-treatment covariate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovariateKind {
    /// Continuous or count-valued attribute (e.g. pre-period spend).
    Numeric,
    /// Integer-coded category (e.g. signup timing bucket).
    Categorical,
}

/// Column descriptor for one pre-treatment covariate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Covariate {
    /// Variable name; matches the node name in the causal graph.
    pub name: String,
    /// Measurement scale.
    pub kind: CovariateKind,
}

impl Covariate {
    /// Numeric column.
    pub fn numeric(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: CovariateKind::Numeric }
    }

    /// Integer-coded categorical column.
    pub fn categorical(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: CovariateKind::Categorical }
    }
}

/// One customer-cohort observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    /// Unique customer identifier.
    pub user_id: u64,
    /// Enrolled in the loyalty program.
    pub treatment: bool,
    /// Pre-treatment covariate values, aligned with [`CohortTable::covariates`].
    pub covariates: Vec<f64>,
    /// Post-period outcome (spend).
    pub outcome: f64,
}

/// Aggregated one-row-per-user table consumed by the estimation chain.
///
/// Validated on construction and never mutated afterwards: every derived
/// table (subset, placebo treatment, extra covariate) is a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCohortTable")]
pub struct CohortTable {
    covariates: Vec<Covariate>,
    units: Vec<UnitRecord>,
}

#[derive(Deserialize)]
struct RawCohortTable {
    covariates: Vec<Covariate>,
    units: Vec<UnitRecord>,
}

impl TryFrom<RawCohortTable> for CohortTable {
    type Error = Error;

    fn try_from(raw: RawCohortTable) -> Result<Self> {
        CohortTable::new(raw.covariates, raw.units)
    }
}

impl CohortTable {
    /// Build a validated table.
    pub fn new(covariates: Vec<Covariate>, units: Vec<UnitRecord>) -> Result<Self> {
        let mut names = HashSet::with_capacity(covariates.len());
        for c in &covariates {
            if c.name.trim().is_empty() {
                return Err(Error::Validation("covariate names must be non-empty".to_string()));
            }
            if !names.insert(c.name.as_str()) {
                return Err(Error::Validation(format!("duplicate covariate column '{}'", c.name)));
            }
        }

        let mut ids = HashSet::with_capacity(units.len());
        for u in &units {
            if !ids.insert(u.user_id) {
                return Err(Error::Validation(format!("duplicate user_id {}", u.user_id)));
            }
            if u.covariates.len() != covariates.len() {
                return Err(Error::Validation(format!(
                    "user_id {} has {} covariate values, expected {}",
                    u.user_id,
                    u.covariates.len(),
                    covariates.len()
                )));
            }
            if !u.outcome.is_finite() {
                return Err(Error::Validation(format!(
                    "user_id {} has a non-finite outcome",
                    u.user_id
                )));
            }
            for (c, &v) in covariates.iter().zip(&u.covariates) {
                if !v.is_finite() {
                    return Err(Error::Validation(format!(
                        "user_id {}: covariate '{}' is not finite",
                        u.user_id, c.name
                    )));
                }
                if c.kind == CovariateKind::Categorical && v.fract() != 0.0 {
                    return Err(Error::Validation(format!(
                        "user_id {}: categorical covariate '{}' must be integer-coded, got {v}",
                        u.user_id, c.name
                    )));
                }
            }
        }

        Ok(Self { covariates, units })
    }

    /// Covariate column descriptors.
    pub fn covariates(&self) -> &[Covariate] {
        &self.covariates
    }

    /// All unit records, in insertion order.
    pub fn units(&self) -> &[UnitRecord] {
        &self.units
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// `true` if the table holds no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Column index of a covariate by name.
    pub fn covariate_index(&self, name: &str) -> Option<usize> {
        self.covariates.iter().position(|c| c.name == name)
    }

    /// Values of one covariate column, in unit order.
    pub fn column(&self, index: usize) -> Vec<f64> {
        self.units.iter().map(|u| u.covariates[index]).collect()
    }

    /// Treated units.
    pub fn treated(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.iter().filter(|u| u.treatment)
    }

    /// Control units.
    pub fn controls(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.iter().filter(|u| !u.treatment)
    }

    /// Number of treated units.
    pub fn n_treated(&self) -> usize {
        self.treated().count()
    }

    /// Fraction of treated units (`NaN` when empty).
    pub fn treatment_rate(&self) -> f64 {
        if self.units.is_empty() {
            return f64::NAN;
        }
        self.n_treated() as f64 / self.units.len() as f64
    }

    /// New table with one extra covariate column appended.
    pub fn with_covariate(&self, column: Covariate, values: &[f64]) -> Result<Self> {
        if values.len() != self.units.len() {
            return Err(Error::Validation(format!(
                "column '{}' has {} values, expected {}",
                column.name,
                values.len(),
                self.units.len()
            )));
        }
        let mut covariates = self.covariates.clone();
        covariates.push(column);
        let units = self
            .units
            .iter()
            .zip(values)
            .map(|(u, &v)| {
                let mut unit = u.clone();
                unit.covariates.push(v);
                unit
            })
            .collect();
        Self::new(covariates, units)
    }

    /// New table with the treatment column replaced.
    pub fn with_treatment(&self, treatment: &[bool]) -> Result<Self> {
        if treatment.len() != self.units.len() {
            return Err(Error::Validation(format!(
                "treatment column has {} values, expected {}",
                treatment.len(),
                self.units.len()
            )));
        }
        let units = self
            .units
            .iter()
            .zip(treatment)
            .map(|(u, &t)| UnitRecord { treatment: t, ..u.clone() })
            .collect();
        Ok(Self { covariates: self.covariates.clone(), units })
    }

    /// New table restricted to the given row indices (kept in the given order).
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        let mut units = Vec::with_capacity(indices.len());
        for &i in indices {
            let u = self.units.get(i).ok_or_else(|| {
                Error::Validation(format!("row index {i} out of range 0..{}", self.units.len()))
            })?;
            units.push(u.clone());
        }
        Self::new(self.covariates.clone(), units)
    }
}

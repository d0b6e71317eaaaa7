use crate::data::SampleConditions;
use crate::error::PropellerError;
use crate::testing::utils::unique_in_order;
use ndarray::{Array2, Axis};

pub const INTERCEPT: &str = "Intercept";

/// Numeric encoding of sample membership.
///
/// Rows follow the sample order the design was built against. The leading columns are
/// the condition columns, either one indicator per condition or, in intercept form, an
/// all-ones column followed by indicators for every condition but the first. Any
/// confounder columns follow.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    samples: Vec<String>,
    columns: Vec<String>,
    matrix: Array2<f64>,
    n_conditions: usize,
    intercept: bool,
}

impl DesignMatrix {
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.matrix.ncols()
    }

    /// Number of leading columns that encode the condition (intercept included).
    pub fn n_conditions(&self) -> usize {
        self.n_conditions
    }

    pub fn has_intercept(&self) -> bool {
        self.intercept
    }

    pub fn condition_columns(&self) -> &[String] {
        &self.columns[..self.n_conditions]
    }

    pub fn confounder_columns(&self) -> &[String] {
        &self.columns[self.n_conditions..]
    }

    /// Keep only the given columns, in the given order.
    pub fn select_columns(&self, indices: &[usize]) -> anyhow::Result<DesignMatrix> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.n_columns()) {
            return Err(PropellerError::Input(format!(
                "design has {} columns, cannot select column {}",
                self.n_columns(),
                bad
            ))
            .into());
        }
        Ok(DesignMatrix {
            samples: self.samples.clone(),
            columns: indices.iter().map(|&i| self.columns[i].clone()).collect(),
            matrix: self.matrix.select(Axis(1), indices),
            n_conditions: indices.iter().filter(|&&i| i < self.n_conditions).count(),
            intercept: self.intercept && indices.first() == Some(&0),
        })
    }

    /// The condition indicator columns alone.
    pub fn condition_design(&self) -> DesignMatrix {
        let indices: Vec<usize> = (0..self.n_conditions).collect();
        DesignMatrix {
            samples: self.samples.clone(),
            columns: self.condition_columns().to_vec(),
            matrix: self.matrix.select(Axis(1), &indices),
            n_conditions: self.n_conditions,
            intercept: self.intercept,
        }
    }

    /// Re-express a one-hot design with an intercept: the first condition column becomes
    /// all ones and the remaining columns are kept unchanged. Fitted coefficients then
    /// measure each condition's difference from the first one.
    pub fn to_intercept_form(&self) -> DesignMatrix {
        if self.intercept {
            return self.clone();
        }
        let mut matrix = self.matrix.clone();
        matrix.column_mut(0).fill(1.0);
        let mut columns = self.columns.clone();
        columns[0] = INTERCEPT.to_string();
        DesignMatrix {
            samples: self.samples.clone(),
            columns,
            matrix,
            n_conditions: self.n_conditions,
            intercept: true,
        }
    }
}

/// Build the design matrix for `reindex`, the sample order of the proportion matrix.
///
/// One indicator column is created per distinct condition, ordered by first appearance
/// among the reindexed samples. Each confounder adds indicator columns for all of its
/// levels except the first (named `<confounder>_<level>`). Fails with
/// [`PropellerError::SampleMismatch`] if a sample has no condition.
pub fn create_design(
    conditions: &SampleConditions,
    reindex: &[String],
) -> anyhow::Result<DesignMatrix> {
    let sheet = conditions.reindex(reindex)?;
    let levels = sheet.condition_levels();
    let n = reindex.len();

    let mut columns = levels.clone();
    let mut blocks: Vec<Vec<f64>> = levels
        .iter()
        .map(|level| {
            reindex
                .iter()
                .map(|sample| indicator(sheet.condition_of(sample) == Some(level.as_str())))
                .collect()
        })
        .collect();

    for confounder in sheet.confounders() {
        let values = reindex
            .iter()
            .map(|sample| {
                confounder
                    .value_of(sample)
                    .map(str::to_string)
                    .ok_or_else(|| PropellerError::SampleMismatch {
                        sample: sample.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for level in unique_in_order(&values).into_iter().skip(1) {
            blocks.push(values.iter().map(|v| indicator(*v == level)).collect());
            columns.push(format!("{}_{}", confounder.name, level));
        }
    }

    let matrix = Array2::from_shape_fn((n, blocks.len()), |(i, j)| blocks[j][i]);
    Ok(DesignMatrix {
        samples: reindex.to_vec(),
        columns,
        matrix,
        n_conditions: levels.len(),
        intercept: false,
    })
}

fn indicator(hit: bool) -> f64 {
    if hit { 1.0 } else { 0.0 }
}

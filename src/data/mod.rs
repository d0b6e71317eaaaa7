//! Input containers for proportion testing.
//!
//! Reading files or annotated-data objects is left to the caller; this module only holds
//! the canonical shapes the test works on:
//!
//! - [`CellAnnotations`]: one (sample, condition, cluster) triple per cell
//! - [`CountMatrix`]: samples × categories cell counts
//! - [`SampleConditions`]: condition (and optional confounders) per sample

use crate::error::PropellerError;
use crate::testing::utils::unique_in_order;
use nalgebra_sparse::CsrMatrix;
use ndarray::{Array1, Array2, Axis};
use single_utilities::traits::FloatOpsTS;
use std::collections::{HashMap, HashSet};

mod annotations;

pub use annotations::CellAnnotations;

/// Cell counts with samples as rows and categories (clusters) as columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CountMatrix {
    samples: Vec<String>,
    categories: Vec<String>,
    counts: Array2<f64>,
}

impl CountMatrix {
    /// Create a count matrix, checking labels, that every count is a whole number of cells
    /// and that every sample holds at least one cell.
    pub fn new(
        samples: Vec<String>,
        categories: Vec<String>,
        counts: Array2<f64>,
    ) -> anyhow::Result<Self> {
        let matrix = CountMatrix::averaged(samples, categories, counts)?;
        if let Some(((row, col), value)) = matrix
            .counts
            .indexed_iter()
            .find(|(_, v)| v.fract() != 0.0)
        {
            return Err(PropellerError::Input(format!(
                "count {} for sample '{}', category '{}' is not a whole number of cells",
                value, matrix.samples[row], matrix.categories[col]
            ))
            .into());
        }
        Ok(matrix)
    }

    /// Counts averaged over bootstrap runs, which need not be whole numbers.
    pub(crate) fn averaged(
        samples: Vec<String>,
        categories: Vec<String>,
        counts: Array2<f64>,
    ) -> anyhow::Result<Self> {
        if counts.nrows() != samples.len() || counts.ncols() != categories.len() {
            return Err(PropellerError::Input(format!(
                "count matrix is {}x{} but {} samples and {} categories were given",
                counts.nrows(),
                counts.ncols(),
                samples.len(),
                categories.len()
            ))
            .into());
        }
        if samples.is_empty() || categories.is_empty() {
            return Err(PropellerError::Input("count matrix is empty".into()).into());
        }
        check_unique("sample", &samples)?;
        check_unique("category", &categories)?;

        if let Some(((row, col), value)) = counts
            .indexed_iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(PropellerError::Input(format!(
                "invalid count {} for sample '{}', category '{}'",
                value, samples[row], categories[col]
            ))
            .into());
        }

        for (row, total) in counts.sum_axis(Axis(1)).iter().enumerate() {
            if *total <= 0.0 {
                return Err(PropellerError::Input(format!(
                    "sample '{}' has no cells",
                    samples[row]
                ))
                .into());
            }
        }

        Ok(CountMatrix {
            samples,
            categories,
            counts,
        })
    }

    /// Build a dense count matrix from a sparse samples × categories matrix.
    pub fn from_sparse<T>(
        matrix: &CsrMatrix<T>,
        samples: Vec<String>,
        categories: Vec<String>,
    ) -> anyhow::Result<Self>
    where
        T: FloatOpsTS,
    {
        let mut counts = Array2::<f64>::zeros((matrix.nrows(), matrix.ncols()));
        for (row, col, value) in matrix.triplet_iter() {
            let value = value.to_f64().unwrap_or(f64::NAN);
            if num_traits::Float::is_sign_negative(value) {
                return Err(PropellerError::Input(format!(
                    "negative count at row {}, column {}",
                    row, col
                ))
                .into());
            }
            counts[[row, col]] += value;
        }
        CountMatrix::new(samples, categories, counts)
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn counts(&self) -> &Array2<f64> {
        &self.counts
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn n_categories(&self) -> usize {
        self.categories.len()
    }

    /// Total number of cells per sample.
    pub fn sample_totals(&self) -> Array1<f64> {
        self.counts.sum_axis(Axis(1))
    }

    /// Total number of cells per category over all samples.
    pub fn category_totals(&self) -> Array1<f64> {
        self.counts.sum_axis(Axis(0))
    }

    /// Share of all cells that fall in each category, ignoring sample structure.
    pub fn baseline_proportions(&self) -> Array1<f64> {
        let grand_total = self.counts.sum();
        self.category_totals() / grand_total
    }
}

fn check_unique(kind: &str, labels: &[String]) -> anyhow::Result<()> {
    let mut seen = HashSet::with_capacity(labels.len());
    for label in labels {
        if !seen.insert(label.as_str()) {
            return Err(
                PropellerError::Input(format!("duplicate {} label '{}'", kind, label)).into(),
            );
        }
    }
    Ok(())
}

/// A categorical covariate recorded per sample, adjusted for but not tested.
#[derive(Debug, Clone, PartialEq)]
pub struct Confounder {
    pub name: String,
    values: HashMap<String, String>,
}

impl Confounder {
    pub fn value_of(&self, sample: &str) -> Option<&str> {
        self.values.get(sample).map(String::as_str)
    }
}

/// Condition label (and optional confounders) of every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleConditions {
    samples: Vec<String>,
    conditions: Vec<String>,
    confounders: Vec<Confounder>,
}

impl SampleConditions {
    /// Pair samples with conditions. A sample may be listed more than once as long as
    /// its condition never changes.
    pub fn new<A, B>(samples: A, conditions: B) -> anyhow::Result<Self>
    where
        A: IntoIterator,
        A::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        let samples: Vec<String> = samples.into_iter().map(Into::into).collect();
        let conditions: Vec<String> = conditions.into_iter().map(Into::into).collect();
        if samples.len() != conditions.len() {
            return Err(PropellerError::Input(format!(
                "{} samples but {} condition labels",
                samples.len(),
                conditions.len()
            ))
            .into());
        }

        let pairs = dedup_per_sample("condition", &samples, &conditions)?;
        let (samples, conditions) = pairs.into_iter().unzip();
        Ok(SampleConditions {
            samples,
            conditions,
            confounders: Vec::new(),
        })
    }

    /// Attach a categorical confounder given as one value per listed sample.
    pub fn with_confounder<A, B>(
        mut self,
        name: &str,
        samples: A,
        values: B,
    ) -> anyhow::Result<Self>
    where
        A: IntoIterator,
        A::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        let samples: Vec<String> = samples.into_iter().map(Into::into).collect();
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if samples.len() != values.len() {
            return Err(PropellerError::Input(format!(
                "confounder '{}' has {} samples but {} values",
                name,
                samples.len(),
                values.len()
            ))
            .into());
        }
        if self.confounders.iter().any(|c| c.name == name) {
            return Err(
                PropellerError::Input(format!("confounder '{}' given twice", name)).into(),
            );
        }

        let values = dedup_per_sample(name, &samples, &values)?
            .into_iter()
            .collect::<HashMap<_, _>>();
        self.confounders.push(Confounder {
            name: name.to_string(),
            values,
        });
        Ok(self)
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn confounders(&self) -> &[Confounder] {
        &self.confounders
    }

    pub fn condition_of(&self, sample: &str) -> Option<&str> {
        self.samples
            .iter()
            .position(|s| s == sample)
            .map(|i| self.conditions[i].as_str())
    }

    /// Distinct condition labels in order of first appearance.
    pub fn condition_levels(&self) -> Vec<String> {
        unique_in_order(&self.conditions)
    }

    pub fn n_conditions(&self) -> usize {
        self.condition_levels().len()
    }

    /// Restrict to `samples`, in that order, failing on any sample without a condition.
    pub fn reindex(&self, samples: &[String]) -> anyhow::Result<SampleConditions> {
        let conditions = samples
            .iter()
            .map(|sample| {
                self.condition_of(sample)
                    .map(str::to_string)
                    .ok_or_else(|| PropellerError::SampleMismatch {
                        sample: sample.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SampleConditions {
            samples: samples.to_vec(),
            conditions,
            confounders: self.confounders.clone(),
        })
    }
}

fn dedup_per_sample(
    what: &str,
    samples: &[String],
    values: &[String],
) -> anyhow::Result<Vec<(String, String)>> {
    let mut seen: HashMap<&str, &str> = HashMap::with_capacity(samples.len());
    let mut pairs = Vec::new();
    for (sample, value) in samples.iter().zip(values) {
        match seen.get(sample.as_str()) {
            Some(previous) if *previous != value.as_str() => {
                return Err(PropellerError::Input(format!(
                    "sample '{}' has more than one {}: '{}' and '{}'",
                    sample, what, previous, value
                ))
                .into());
            }
            Some(_) => {}
            None => {
                seen.insert(sample, value);
                pairs.push((sample.clone(), value.clone()));
            }
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra_sparse::CooMatrix;
    use ndarray::array;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_count_matrix_rejects_empty_sample() {
        let counts = array![[3.0, 1.0], [0.0, 0.0]];
        let err = CountMatrix::new(labels(&["s1", "s2"]), labels(&["A", "B"]), counts)
            .unwrap_err();
        assert!(err.to_string().contains("sample 's2' has no cells"));
    }

    #[test]
    fn test_count_matrix_rejects_fractional_counts() {
        let counts = array![[0.2, 0.3, 0.1], [0.25, 0.25, 0.2]];
        let err = CountMatrix::new(labels(&["s1", "s2"]), labels(&["A", "B", "C"]), counts)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PropellerError>(),
            Some(PropellerError::Input(_))
        ));
        assert!(err.to_string().contains("not a whole number"));

        let mut coo = CooMatrix::new(1, 2);
        coo.push(0, 0, 1.5f64);
        coo.push(0, 1, 2.0);
        let csr = CsrMatrix::from(&coo);
        assert!(CountMatrix::from_sparse(&csr, labels(&["s1"]), labels(&["A", "B"])).is_err());
    }

    #[test]
    fn test_averaged_counts_may_be_fractional() {
        let counts = array![[10.5, 3.25], [0.75, 8.0]];
        let m = CountMatrix::averaged(labels(&["s1", "s2"]), labels(&["A", "B"]), counts).unwrap();
        assert_relative_eq!(m.sample_totals()[0], 13.75);
    }

    #[test]
    fn test_count_matrix_rejects_shape_mismatch() {
        let counts = array![[3.0, 1.0]];
        assert!(CountMatrix::new(labels(&["s1"]), labels(&["A"]), counts).is_err());
    }

    #[test]
    fn test_baseline_proportions() {
        let counts = array![[3.0, 1.0], [1.0, 5.0]];
        let m = CountMatrix::new(labels(&["s1", "s2"]), labels(&["A", "B"]), counts).unwrap();
        let baseline = m.baseline_proportions();
        assert_relative_eq!(baseline[0], 0.4);
        assert_relative_eq!(baseline[1], 0.6);
    }

    #[test]
    fn test_from_sparse_matches_dense() {
        let mut coo = CooMatrix::new(2, 3);
        coo.push(0, 0, 4.0f64);
        coo.push(0, 2, 1.0);
        coo.push(1, 1, 7.0);
        let csr = CsrMatrix::from(&coo);

        let m = CountMatrix::from_sparse(&csr, labels(&["s1", "s2"]), labels(&["A", "B", "C"]))
            .unwrap();
        assert_eq!(m.counts(), &array![[4.0, 0.0, 1.0], [0.0, 7.0, 0.0]]);
        assert_eq!(m.sample_totals(), array![5.0, 7.0]);
    }

    #[test]
    fn test_sample_conditions_conflict() {
        let err = SampleConditions::new(["s1", "s1"], ["ctrl", "stim"]).unwrap_err();
        assert!(err.to_string().contains("more than one condition"));
    }

    #[test]
    fn test_reindex_reports_missing_sample() {
        let sheet = SampleConditions::new(["s1", "s2"], ["ctrl", "stim"]).unwrap();
        let err = sheet.reindex(&labels(&["s2", "s3"])).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PropellerError>(),
            Some(&PropellerError::SampleMismatch {
                sample: "s3".into()
            })
        );

        let reordered = sheet.reindex(&labels(&["s2", "s1"])).unwrap();
        assert_eq!(reordered.condition_levels(), vec!["stim", "ctrl"]);
    }
}

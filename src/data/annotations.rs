use super::{CountMatrix, SampleConditions};
use crate::error::PropellerError;
use crate::testing::utils::unique_in_order;
use ndarray::Array2;
use std::collections::HashMap;

/// Per-cell labels: which sample a cell came from, the sample's condition and the
/// cell's cluster (cell type).
#[derive(Debug, Clone, PartialEq)]
pub struct CellAnnotations {
    samples: Vec<String>,
    conditions: Vec<String>,
    clusters: Vec<String>,
}

impl CellAnnotations {
    pub fn new<A, B, C>(samples: A, conditions: B, clusters: C) -> anyhow::Result<Self>
    where
        A: IntoIterator,
        A::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        let samples: Vec<String> = samples.into_iter().map(Into::into).collect();
        let conditions: Vec<String> = conditions.into_iter().map(Into::into).collect();
        let clusters: Vec<String> = clusters.into_iter().map(Into::into).collect();

        if samples.is_empty() {
            return Err(PropellerError::Input("no cells given".into()).into());
        }
        if samples.len() != conditions.len() || samples.len() != clusters.len() {
            return Err(PropellerError::Input(format!(
                "annotation columns differ in length: {} samples, {} conditions, {} clusters",
                samples.len(),
                conditions.len(),
                clusters.len()
            ))
            .into());
        }

        Ok(CellAnnotations {
            samples,
            conditions,
            clusters,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    pub fn clusters(&self) -> &[String] {
        &self.clusters
    }

    /// Cross-tabulate cells into a samples × clusters count matrix. Samples and clusters
    /// keep their order of first appearance.
    pub fn count_matrix(&self) -> anyhow::Result<CountMatrix> {
        let samples = unique_in_order(&self.samples);
        let clusters = unique_in_order(&self.clusters);

        let sample_index: HashMap<&str, usize> = samples
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        let cluster_index: HashMap<&str, usize> = clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();

        let mut counts = Array2::<f64>::zeros((samples.len(), clusters.len()));
        for (sample, cluster) in self.samples.iter().zip(&self.clusters) {
            counts[[sample_index[sample.as_str()], cluster_index[cluster.as_str()]]] += 1.0;
        }

        CountMatrix::new(samples, clusters, counts)
    }

    /// Condition of every sample, failing if a sample's cells disagree on it.
    pub fn sample_conditions(&self) -> anyhow::Result<SampleConditions> {
        SampleConditions::new(self.samples.iter().cloned(), self.conditions.iter().cloned())
    }
}

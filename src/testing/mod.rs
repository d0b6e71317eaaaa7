use single_utilities::traits::FloatOps;
use std::collections::HashMap;

pub mod correction;
pub mod inference;

pub mod utils;

/// Which moderated test a comparison uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Two conditions, moderated t-test of their difference.
    TTest,
    /// Three or more conditions, moderated F-test that all conditions are equal.
    Anova,
}

impl TestMode {
    /// Pick the test for a number of condition levels.
    pub fn for_conditions(n_conditions: usize) -> Self {
        if n_conditions == 2 {
            TestMode::TTest
        } else {
            TestMode::Anova
        }
    }

    /// Name of the statistic column in a result table.
    pub fn statistic_column(&self) -> &'static str {
        match self {
            TestMode::TTest => "t_statistics",
            TestMode::Anova => "F_statistics",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TestMode::TTest => "t_test",
            TestMode::Anova => "anova",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultipleTestResults<T> {
    /// Test statistics for each category
    pub statistics: Vec<T>,
    /// Raw (unadjusted) p-values
    pub p_values: Vec<T>,
    /// Adjusted p-values (after multiple testing correction)
    pub adjusted_p_values: Option<Vec<T>>,
    /// Residual plus prior degrees of freedom per category
    pub degrees_of_freedom: Option<Vec<T>>,
    /// Global metadata about the test
    pub global_metadata: HashMap<String, String>,
}

impl<T> MultipleTestResults<T>
where
    T: FloatOps,
{
    /// Create a new results object from statistics and p-values
    pub fn new(statistics: Vec<T>, p_values: Vec<T>) -> Self {
        MultipleTestResults {
            statistics,
            p_values,
            adjusted_p_values: None,
            degrees_of_freedom: None,
            global_metadata: HashMap::new(),
        }
    }

    /// Add adjusted p-values to the results
    pub fn with_adjusted_p_values(mut self, adjusted_p_values: Vec<T>) -> Self {
        self.adjusted_p_values = Some(adjusted_p_values);
        self
    }

    pub fn with_degrees_of_freedom(mut self, degrees_of_freedom: Vec<T>) -> Self {
        self.degrees_of_freedom = Some(degrees_of_freedom);
        self
    }

    /// Add global metadata about the test
    pub fn with_global_metadata(mut self, key: &str, value: &str) -> Self {
        self.global_metadata
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.p_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.p_values.is_empty()
    }

    /// Adjusted p-values if present, raw ones otherwise.
    fn ranking_p_values(&self) -> &[T] {
        match &self.adjusted_p_values {
            Some(adj_p) => adj_p,
            None => &self.p_values,
        }
    }

    /// Get indices of significant categories at the given threshold
    pub fn significant_indices(&self, alpha: T) -> Vec<usize> {
        self.ranking_p_values()
            .iter()
            .enumerate()
            .filter_map(|(i, &p)| if p < alpha { Some(i) } else { None })
            .collect()
    }

    /// Get the number of significant categories at the given threshold
    pub fn num_significant(&self, alpha: T) -> usize {
        self.significant_indices(alpha).len()
    }

    /// Get top n categories by p-value, ties keep their original order
    pub fn top_features(&self, n: usize) -> Vec<usize> {
        let p_values = self.ranking_p_values();

        let mut indices: Vec<usize> = (0..p_values.len()).collect();
        indices.sort_by(|&a, &b| {
            p_values[a]
                .partial_cmp(&p_values[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        indices.truncate(n);
        indices
    }
}

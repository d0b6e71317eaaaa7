use crate::data::CountMatrix;
use crate::error::PropellerError;
use crate::model::DesignMatrix;
use crate::testing::inference::ModeratedFit;
use crate::testing::{MultipleTestResults, TestMode};
use crate::transform::Transform;
use ndarray::{Array1, Array2, ArrayView1};

pub const BASELINE_COLUMN: &str = "Baseline_props";
pub const MEAN_PROPS_PREFIX: &str = "Mean_props_";
pub const PROP_RATIO_COLUMN: &str = "Prop_ratio";
pub const P_VALUE_COLUMN: &str = "p_values";
pub const ADJUSTED_P_VALUE_COLUMN: &str = "Adjusted_p_values";

/// Per-category test results, one row per category.
///
/// Columns are, in order: `Baseline_props`, one `Mean_props_<condition>` per condition,
/// `Prop_ratio` (two conditions only), `t_statistics` or `F_statistics`, `p_values` and
/// `Adjusted_p_values`.
#[derive(Debug, Clone)]
pub struct ResultTable {
    categories: Vec<String>,
    conditions: Vec<String>,
    baseline_props: Array1<f64>,
    /// Categories × conditions.
    mean_props: Array2<f64>,
    prop_ratio: Option<Array1<f64>>,
    mode: TestMode,
    df_numerator: Option<usize>,
    tests: MultipleTestResults<f64>,
}

/// One category's row of a [`ResultTable`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow<'a> {
    pub category: &'a str,
    pub baseline_prop: f64,
    pub mean_props: Vec<(&'a str, f64)>,
    pub prop_ratio: Option<f64>,
    pub statistic: f64,
    pub p_value: f64,
    pub adjusted_p_value: f64,
}

impl ResultTable {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        categories: Vec<String>,
        conditions: Vec<String>,
        baseline_props: Array1<f64>,
        mean_props: Array2<f64>,
        prop_ratio: Option<Array1<f64>>,
        mode: TestMode,
        df_numerator: Option<usize>,
        tests: MultipleTestResults<f64>,
    ) -> anyhow::Result<Self> {
        let m = categories.len();
        let adjusted_len = tests.adjusted_p_values.as_ref().map(Vec::len);
        let consistent = baseline_props.len() == m
            && mean_props.dim() == (m, conditions.len())
            && prop_ratio.as_ref().is_none_or(|r| r.len() == m)
            && tests.statistics.len() == m
            && tests.p_values.len() == m
            && adjusted_len == Some(m);
        if !consistent {
            return Err(PropellerError::Input(format!(
                "result columns do not all have one entry for each of the {} categories",
                m
            ))
            .into());
        }

        Ok(ResultTable {
            categories,
            conditions,
            baseline_props,
            mean_props,
            prop_ratio,
            mode,
            df_numerator,
            tests,
        })
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    pub fn n_categories(&self) -> usize {
        self.categories.len()
    }

    pub fn mode(&self) -> TestMode {
        self.mode
    }

    /// Numerator degrees of freedom of the F-test, `None` for a t-test.
    pub fn df_numerator(&self) -> Option<usize> {
        self.df_numerator
    }

    pub fn baseline_props(&self) -> &Array1<f64> {
        &self.baseline_props
    }

    /// Mean proportions, categories × conditions.
    pub fn mean_props(&self) -> &Array2<f64> {
        &self.mean_props
    }

    pub fn mean_props_of(&self, condition: &str) -> Option<ArrayView1<'_, f64>> {
        self.conditions
            .iter()
            .position(|c| c == condition)
            .map(|j| self.mean_props.column(j))
    }

    pub fn prop_ratio(&self) -> Option<&Array1<f64>> {
        self.prop_ratio.as_ref()
    }

    pub fn statistics(&self) -> &[f64] {
        &self.tests.statistics
    }

    pub fn p_values(&self) -> &[f64] {
        &self.tests.p_values
    }

    pub fn adjusted_p_values(&self) -> &[f64] {
        self.tests
            .adjusted_p_values
            .as_deref()
            .unwrap_or(&self.tests.p_values)
    }

    pub fn tests(&self) -> &MultipleTestResults<f64> {
        &self.tests
    }

    /// Column names in table order.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = vec![BASELINE_COLUMN.to_string()];
        names.extend(
            self.conditions
                .iter()
                .map(|c| format!("{}{}", MEAN_PROPS_PREFIX, c)),
        );
        if self.prop_ratio.is_some() {
            names.push(PROP_RATIO_COLUMN.to_string());
        }
        names.push(self.mode.statistic_column().to_string());
        names.push(P_VALUE_COLUMN.to_string());
        names.push(ADJUSTED_P_VALUE_COLUMN.to_string());
        names
    }

    /// Values of a column by name.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        if name == BASELINE_COLUMN {
            return Some(self.baseline_props.to_vec());
        }
        if let Some(condition) = name.strip_prefix(MEAN_PROPS_PREFIX) {
            return self.mean_props_of(condition).map(|col| col.to_vec());
        }
        if name == PROP_RATIO_COLUMN {
            return self.prop_ratio.as_ref().map(Array1::to_vec);
        }
        if name == self.mode.statistic_column() {
            return Some(self.statistics().to_vec());
        }
        match name {
            P_VALUE_COLUMN => Some(self.p_values().to_vec()),
            ADJUSTED_P_VALUE_COLUMN => Some(self.adjusted_p_values().to_vec()),
            _ => None,
        }
    }

    pub fn row(&self, category: &str) -> Option<ResultRow<'_>> {
        let g = self.categories.iter().position(|c| c == category)?;
        Some(ResultRow {
            category: &self.categories[g],
            baseline_prop: self.baseline_props[g],
            mean_props: self
                .conditions
                .iter()
                .enumerate()
                .map(|(j, c)| (c.as_str(), self.mean_props[[g, j]]))
                .collect(),
            prop_ratio: self.prop_ratio.as_ref().map(|r| r[g]),
            statistic: self.tests.statistics[g],
            p_value: self.tests.p_values[g],
            adjusted_p_value: self.adjusted_p_values()[g],
        })
    }

    /// Categories whose adjusted p-value is below `alpha`, in table order.
    pub fn significant(&self, alpha: f64) -> Vec<&str> {
        self.tests
            .significant_indices(alpha)
            .into_iter()
            .map(|g| self.categories[g].as_str())
            .collect()
    }

    /// The `n` categories with the smallest adjusted p-values.
    pub fn top_categories(&self, n: usize) -> Vec<&str> {
        self.tests
            .top_features(n)
            .into_iter()
            .map(|g| self.categories[g].as_str())
            .collect()
    }
}

/// Everything a proportion test produced.
///
/// For simulated results `counts`, `props`, `prop_trans` and `weights` are the elementwise
/// means over all bootstrap runs, indexed by the pseudo-replicates, and `design` is the
/// design of one run.
#[derive(Debug, Clone)]
pub struct PropellerResult {
    pub results: ResultTable,
    pub counts: CountMatrix,
    pub props: Array2<f64>,
    pub prop_trans: Array2<f64>,
    pub weights: Array2<f64>,
    pub design: DesignMatrix,
    pub transform: Transform,
    /// Moderation details of a direct run; absent for pooled simulations.
    pub moderated: Option<ModeratedFit>,
    pub simulated: bool,
    /// Pipeline runs performed, retried bootstrap draws included.
    pub n_attempts: usize,
}

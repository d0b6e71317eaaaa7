//! Weighted least squares, fitted independently for every category.
//!
//! All categories share the design matrix, so when they also share the weights the
//! unscaled covariance `(XᵗWX)⁻¹` is computed once. Category-specific weights (the logit
//! weights depend on the category's proportion) give every category its own covariance.

use crate::error::PropellerError;
use crate::model::DesignMatrix;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Relative singular value below which a design direction counts as degenerate.
const RANK_TOLERANCE: f64 = 1e-7;

/// Per-category linear model fit of a response matrix against a shared design.
#[derive(Debug, Clone)]
pub struct LinearFit {
    /// Coefficients, categories × design columns.
    pub coefficients: Array2<f64>,
    /// Residual standard deviation per category.
    pub sigma: Array1<f64>,
    /// Residual degrees of freedom, samples minus design rank.
    pub df_residual: f64,
    /// Unscaled coefficient covariance, one shared matrix or one per category.
    pub cov_unscaled: Vec<Array2<f64>>,
    /// Names of the design columns.
    pub columns: Vec<String>,
    pub rank: usize,
}

impl LinearFit {
    pub fn n_categories(&self) -> usize {
        self.coefficients.nrows()
    }

    pub fn n_coefficients(&self) -> usize {
        self.coefficients.ncols()
    }

    pub fn has_shared_covariance(&self) -> bool {
        self.cov_unscaled.len() == 1
    }

    /// `(XᵗWX)⁻¹` that applies to the given category.
    pub fn unscaled_covariance(&self, category: usize) -> &Array2<f64> {
        if self.has_shared_covariance() {
            &self.cov_unscaled[0]
        } else {
            &self.cov_unscaled[category]
        }
    }

    pub fn residual_variances(&self) -> Array1<f64> {
        self.sigma.mapv(|s| s * s)
    }

    /// Coefficient standard errors, categories × design columns.
    pub fn standard_errors(&self) -> Array2<f64> {
        Array2::from_shape_fn(self.coefficients.raw_dim(), |(g, j)| {
            self.sigma[g] * self.unscaled_covariance(g)[[j, j]].sqrt()
        })
    }
}

/// Fit `Y = Xβ + ε` by weighted least squares for every column of `response`.
///
/// `response` is samples × categories and `weights`, if given, has the same shape.
/// Fails with [`PropellerError::SingularDesign`] when the (weighted) design does not have
/// full column rank, and with [`PropellerError::Input`] when no residual degrees of
/// freedom remain.
pub fn lm_fit(
    design: &DesignMatrix,
    response: &Array2<f64>,
    weights: Option<&Array2<f64>>,
) -> anyhow::Result<LinearFit> {
    let n = design.n_samples();
    let k = design.n_columns();
    let m = response.ncols();

    if m == 0 {
        return Err(PropellerError::Input("response has no categories".into()).into());
    }
    if response.nrows() != n {
        return Err(PropellerError::Input(format!(
            "response has {} samples but the design has {}",
            response.nrows(),
            n
        ))
        .into());
    }
    if let Some(w) = weights {
        if w.dim() != response.dim() {
            return Err(PropellerError::Input(format!(
                "weights are {:?} but the response is {:?}",
                w.dim(),
                response.dim()
            ))
            .into());
        }
        if w.iter().any(|&v| !v.is_finite() || v < 0.0) {
            return Err(
                PropellerError::Input("weights must be finite and non-negative".into()).into(),
            );
        }
    }

    if n <= k {
        return Err(PropellerError::Input(format!(
            "model is saturated: {} samples for {} design columns, no residual degrees of freedom",
            n, k
        ))
        .into());
    }

    let x = DMatrix::from_fn(n, k, |i, j| design.matrix()[[i, j]]);
    let shared = weights.is_none_or(columns_identical);

    let column_weights = |g: usize| -> Array1<f64> {
        match weights {
            Some(w) => w.column(g).to_owned(),
            None => Array1::ones(n),
        }
    };

    let shared_solver = if shared {
        Some(NormalEquations::new(&x, column_weights(0).view(), None)?)
    } else {
        None
    };

    let mut coefficients = Array2::<f64>::zeros((m, k));
    let mut sigma = Array1::<f64>::zeros(m);
    let mut cov_unscaled = Vec::with_capacity(if shared { 1 } else { m });
    if let Some(solver) = &shared_solver {
        cov_unscaled.push(solver.covariance());
    }

    for g in 0..m {
        let w = column_weights(g);
        let own_solver;
        let solver = match &shared_solver {
            Some(solver) => solver,
            None => {
                let context = format!(" (category {})", g);
                own_solver = NormalEquations::new(&x, w.view(), Some(context.as_str()))?;
                cov_unscaled.push(own_solver.covariance());
                &own_solver
            }
        };

        let y = DVector::from_iterator(n, response.column(g).iter().copied());
        let (beta, rss) = solver.solve(&x, &y, w.view());
        coefficients
            .row_mut(g)
            .assign(&Array1::from_iter(beta.iter().copied()));
        sigma[g] = (rss / (n - k) as f64).sqrt();
    }

    Ok(LinearFit {
        coefficients,
        sigma,
        df_residual: (n - k) as f64,
        cov_unscaled,
        columns: design.columns().to_vec(),
        rank: k,
    })
}

fn columns_identical(w: &Array2<f64>) -> bool {
    let first = w.column(0);
    w.axis_iter(Axis(1)).all(|col| col == first)
}

/// Cached `(XᵗWX)⁻¹` for one weight vector.
struct NormalEquations {
    inverse: DMatrix<f64>,
}

impl NormalEquations {
    fn new(
        x: &DMatrix<f64>,
        w: ArrayView1<f64>,
        context: Option<&str>,
    ) -> anyhow::Result<Self> {
        let (n, k) = x.shape();
        let sqrt_wx = DMatrix::from_fn(n, k, |i, j| w[i].sqrt() * x[(i, j)]);

        let singular_values = sqrt_wx.clone().svd(false, false).singular_values;
        let max_sv = singular_values.max();
        let rank = singular_values
            .iter()
            .filter(|&&sv| sv > RANK_TOLERANCE * max_sv)
            .count();

        let singular = |rank: usize| PropellerError::SingularDesign {
            rank,
            columns: k,
            context: context.unwrap_or_default().to_string(),
        };
        if rank < k || max_sv <= 0.0 {
            return Err(singular(rank).into());
        }

        let xtwx = sqrt_wx.transpose() * &sqrt_wx;
        let inverse = xtwx.try_inverse().ok_or_else(|| singular(rank))?;
        Ok(NormalEquations { inverse })
    }

    fn covariance(&self) -> Array2<f64> {
        let k = self.inverse.nrows();
        Array2::from_shape_fn((k, k), |(i, j)| self.inverse[(i, j)])
    }

    /// Coefficients and weighted residual sum of squares for one response vector.
    fn solve(&self, x: &DMatrix<f64>, y: &DVector<f64>, w: ArrayView1<f64>) -> (DVector<f64>, f64) {
        let wy = DVector::from_iterator(y.len(), y.iter().zip(w.iter()).map(|(v, wi)| v * wi));
        let beta = &self.inverse * (x.transpose() * wy);
        let residuals = y - x * &beta;
        let rss = residuals
            .iter()
            .zip(w.iter())
            .map(|(r, wi)| wi * r * r)
            .sum::<f64>();
        (beta, rss)
    }
}

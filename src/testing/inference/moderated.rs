//! Moderated t and F tests on top of empirical Bayes variance shrinkage.
//!
//! Both tests replace each category's residual variance by its posterior `s̃²_g` and add
//! the prior degrees of freedom to the residual ones. An infinite total uses the normal
//! (t) or chi-squared (F) limit.

use crate::error::PropellerError;
use crate::model::{ContrastFit, LinearFit};
use crate::testing::TestMode;
use crate::testing::inference::ebayes::{f_upper_tail, squeeze_var, SqueezedVariances};
use nalgebra::{DMatrix, DVector};
use ndarray::Array1;
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use std::collections::HashSet;

/// Moderated statistics for every category.
#[derive(Debug, Clone)]
pub struct ModeratedFit {
    pub mode: TestMode,
    /// Prior degrees of freedom, one per category.
    pub df_prior: Array1<f64>,
    pub s2_prior: f64,
    /// Posterior residual variances.
    pub s2_post: Array1<f64>,
    /// Residual plus prior degrees of freedom.
    pub df_total: Array1<f64>,
    /// t or F statistic per category.
    pub statistics: Array1<f64>,
    pub p_values: Array1<f64>,
    /// Numerator degrees of freedom of the F-test.
    pub df_numerator: Option<usize>,
    pub robust: bool,
}

impl ModeratedFit {
    pub fn n_categories(&self) -> usize {
        self.statistics.len()
    }
}

/// Moderated t-test of a single contrast.
///
/// `t_g = (cᵗβ_g) / (s̃_g · sqrt(cᵗ(XᵗWX)⁻¹c))` with `d + d0_g` degrees of freedom and
/// two-sided p-values.
pub fn ebayes_t(fit: &ContrastFit, robust: bool) -> anyhow::Result<ModeratedFit> {
    let variances = fit.residual_variances();
    let squeezed = squeeze(&variances, fit.df_residual, robust)?;
    let df_total = total_df(&squeezed, fit.df_residual);

    let statistics = Array1::from_shape_fn(fit.n_categories(), |g| {
        fit.coefficients[g] / (squeezed.var_post[g].sqrt() * fit.stdev_unscaled[g])
    });
    let p_values = Array1::from_shape_fn(fit.n_categories(), |g| {
        two_sided_t(statistics[g], df_total[g])
    });

    Ok(ModeratedFit {
        mode: TestMode::TTest,
        df_prior: squeezed.df_prior,
        s2_prior: squeezed.var_prior,
        s2_post: squeezed.var_post,
        df_total,
        statistics,
        p_values,
        df_numerator: None,
        robust: squeezed.robust,
    })
}

/// Moderated F-test that the coefficients at `coefficients` are jointly zero.
///
/// `F_g = β_gᵗ V_g⁻¹ β_g / (q · s̃²_g)` where `β_g` are the tested coefficients, `V_g` their
/// block of the unscaled covariance and `q` their number. The F statistic has `q` and
/// `d + d0_g` degrees of freedom.
pub fn ebayes_f(fit: &LinearFit, coefficients: &[usize], robust: bool) -> anyhow::Result<ModeratedFit> {
    validate_coefficients(fit, coefficients)?;
    let q = coefficients.len();

    let variances = fit.residual_variances();
    let squeezed = squeeze(&variances, fit.df_residual, robust)?;
    let df_total = total_df(&squeezed, fit.df_residual);

    let shared_inverse = if fit.has_shared_covariance() {
        Some(block_inverse(fit, 0, coefficients)?)
    } else {
        None
    };

    let mut statistics = Array1::zeros(fit.n_categories());
    for g in 0..fit.n_categories() {
        let inverse = match &shared_inverse {
            Some(inverse) => inverse.clone(),
            None => block_inverse(fit, g, coefficients)?,
        };
        let beta = DVector::from_iterator(
            q,
            coefficients.iter().map(|&j| fit.coefficients[[g, j]]),
        );
        let quadratic = beta.dot(&(&inverse * &beta));
        statistics[g] = quadratic / (q as f64 * squeezed.var_post[g]);
    }

    let p_values = Array1::from_shape_fn(fit.n_categories(), |g| {
        f_upper_tail(statistics[g], q as f64, df_total[g])
    });

    Ok(ModeratedFit {
        mode: TestMode::Anova,
        df_prior: squeezed.df_prior,
        s2_prior: squeezed.var_prior,
        s2_post: squeezed.var_post,
        df_total,
        statistics,
        p_values,
        df_numerator: Some(q),
        robust: squeezed.robust,
    })
}

fn squeeze(variances: &Array1<f64>, df: f64, robust: bool) -> anyhow::Result<SqueezedVariances> {
    let values = variances.to_vec();
    squeeze_var(&values, df, robust)
}

fn total_df(squeezed: &SqueezedVariances, df_residual: f64) -> Array1<f64> {
    squeezed.df_prior.mapv(|d0| d0 + df_residual)
}

/// Two-sided p-value of `t` with `df` degrees of freedom.
fn two_sided_t(t: f64, df: f64) -> f64 {
    if t.is_nan() {
        return 1.0;
    }
    if t.is_infinite() {
        return 0.0;
    }
    let tail = if df.is_infinite() {
        Normal::new(0.0, 1.0).ok().map(|d| d.sf(t.abs()))
    } else {
        StudentsT::new(0.0, 1.0, df).ok().map(|d| d.sf(t.abs()))
    };
    tail.map(|p| (2.0 * p).clamp(0.0, 1.0)).unwrap_or(1.0)
}

fn validate_coefficients(fit: &LinearFit, coefficients: &[usize]) -> anyhow::Result<()> {
    if coefficients.is_empty() {
        return Err(PropellerError::InvalidContrast("no coefficients to test".into()).into());
    }
    let k = fit.n_coefficients();
    if let Some(&j) = coefficients.iter().find(|&&j| j >= k) {
        return Err(PropellerError::InvalidContrast(format!(
            "coefficient {} is out of range for a design with {} columns",
            j, k
        ))
        .into());
    }
    let distinct: HashSet<usize> = coefficients.iter().copied().collect();
    if distinct.len() != coefficients.len() {
        return Err(PropellerError::InvalidContrast(format!(
            "coefficients {:?} contain duplicates",
            coefficients
        ))
        .into());
    }
    Ok(())
}

/// Inverse of the tested block of the unscaled covariance of category `g`.
fn block_inverse(fit: &LinearFit, g: usize, coefficients: &[usize]) -> anyhow::Result<DMatrix<f64>> {
    let cov = fit.unscaled_covariance(g);
    let q = coefficients.len();
    let block = DMatrix::from_fn(q, q, |r, c| cov[[coefficients[r], coefficients[c]]]);
    block.try_inverse().ok_or_else(|| {
        PropellerError::SingularDesign {
            rank: q.saturating_sub(1),
            columns: q,
            context: format!(" (covariance of coefficients {:?})", coefficients),
        }
        .into()
    })
}

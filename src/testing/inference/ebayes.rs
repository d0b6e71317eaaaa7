//! Empirical Bayes estimation of a shared prior for per-category residual variances.
//!
//! Residual variances `s²_g` with `d` degrees of freedom are modelled as draws from a
//! scaled F distribution, `s²_g / s0² ~ F(d, d0)`. The prior degrees of freedom `d0` and
//! scale `s0²` are estimated by matching the first two moments of `log s²_g`; this needs
//! the trigamma function to be inverted numerically. Each variance is then shrunk towards
//! the prior:
//!
//! `s̃²_g = (d0 · s0² + d · s²_g) / (d0 + d)`
//!
//! The robust estimator winsorises the log-variances before matching moments and lowers
//! the prior degrees of freedom of categories whose variance looks like an outlier, so a
//! handful of extreme categories neither distort the prior nor get shrunk into it.

use crate::error::PropellerError;
use crate::testing::inference::special::{brent_root, digamma, trigamma, trigamma_inverse};
use crate::testing::utils::{average_ranks, mean, median, quantile_sorted, sample_variance};
use ndarray::Array1;
use statrs::distribution::{ChiSquared, Continuous, ContinuousCDF, FisherSnedecor, Normal};
use std::cmp::Ordering;

/// Variances below this fraction of the median are raised to it before taking logs.
const VARIANCE_FLOOR: f64 = 1e-5;
/// Lower and upper tail proportions winsorised by the robust estimator.
const WINSOR_TAIL: (f64, f64) = (0.05, 0.1);
/// Search interval for the prior degrees of freedom of outlying categories.
const OUTLIER_DF_RANGE: (f64, f64) = (0.05, 1e6);
/// Minimum number of categories for robust estimation.
pub const MIN_ROBUST_CATEGORIES: usize = 3;

/// Fitted scaled F distribution for a set of variances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FDistFit {
    /// Prior variance `s0²`.
    pub scale: f64,
    /// Prior degrees of freedom `d0`, possibly infinite.
    pub df2: f64,
}

/// Moderated variances and the prior they were shrunk towards.
#[derive(Debug, Clone)]
pub struct SqueezedVariances {
    /// Prior degrees of freedom per category; all equal unless estimated robustly.
    pub df_prior: Array1<f64>,
    pub var_prior: f64,
    pub var_post: Array1<f64>,
    pub robust: bool,
}

/// Estimate `s0²` and `d0` by the method of moments on `log s²`.
///
/// A single variance gives no information about spread, so `d0 = 0`. If the observed
/// spread of the log-variances does not exceed what `d` degrees of freedom alone explain,
/// `d0` is infinite. Fails with [`PropellerError::RootFinding`] when the moments are
/// degenerate, for instance when every variance is zero.
pub fn fit_f_dist(variances: &[f64], df1: f64) -> anyhow::Result<FDistFit> {
    match variances.len() {
        0 => Err(PropellerError::Input("no variances to moderate".into()).into()),
        1 => Ok(FDistFit {
            scale: variances[0],
            df2: 0.0,
        }),
        _ => {
            let e = log_variance_residuals(variances, df1)?;
            let emean = mean(&e);
            let evar = sample_variance(&e) - trigamma(df1 / 2.0);
            prior_from_moments(emean, evar)
        }
    }
}

/// Robust counterpart of [`fit_f_dist`] returning one prior degrees of freedom per
/// category.
///
/// Log-variances are winsorised at the 5% lower and 10% upper tails. The winsorised mean
/// and variance are corrected to the values a normal sample would have before winsorising
/// and then matched like in [`fit_f_dist`].
///
/// Each category's F-ratio `s²_g / s0²` is then compared against the fitted distribution:
/// the ratio of its tail probability to its empirical tail probability (capped at one)
/// is the chance that it is not an outlier. Outliers are given the prior degrees of
/// freedom `d0_out` at which the largest F-ratio sits at the median of `F(d, d0_out)`.
/// The two are mixed on the shrinkage scale `λ = d0 / (d0 + d)`, which stays finite when
/// `d0` is infinite, and `λ` is made non-increasing in the F-ratio so that only large
/// variances escape the prior.
pub fn fit_f_dist_robust(
    variances: &[f64],
    df1: f64,
) -> anyhow::Result<(FDistFit, Array1<f64>)> {
    let n = variances.len();
    if n < MIN_ROBUST_CATEGORIES {
        return Err(PropellerError::Input(format!(
            "robust estimation needs at least {} categories, got {}",
            MIN_ROBUST_CATEGORIES, n
        ))
        .into());
    }

    let e = log_variance_residuals(variances, df1)?;
    let mut sorted = e.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let lower = quantile_sorted(&sorted, WINSOR_TAIL.0);
    let upper = quantile_sorted(&sorted, 1.0 - WINSOR_TAIL.1);
    let winsorised: Vec<f64> = e.iter().map(|v| v.clamp(lower, upper)).collect();

    let (shift, spread) = normal_winsor_moments(WINSOR_TAIL.0, WINSOR_TAIL.1)?;
    let sd = (sample_variance(&winsorised) / spread).sqrt();
    let emean = mean(&winsorised) - shift * sd;
    let evar = sd * sd - trigamma(df1 / 2.0);
    let fit = prior_from_moments(emean, evar)?;

    let f_stat: Vec<f64> = variances.iter().map(|&s2| s2 / fit.scale).collect();
    let ranks = average_ranks(&f_stat);
    let prob_not_outlier: Vec<f64> = f_stat
        .iter()
        .zip(&ranks)
        .map(|(&f, &r)| {
            let empirical = (n as f64 - r + 0.5) / n as f64;
            (f_upper_tail(f, df1, fit.df2) / empirical).min(1.0)
        })
        .collect();

    if prob_not_outlier.iter().all(|&p| p >= 1.0) {
        return Ok((fit, Array1::from_elem(n, fit.df2)));
    }

    let max_f = f_stat.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let df2_outlier = outlier_df(max_f, df1, fit.df2);
    log::debug!(
        "robust prior: d0 = {:.4}, outlier d0 = {:.4}",
        fit.df2,
        df2_outlier
    );

    let lambda_prior = shrinkage_fraction(fit.df2, df1);
    let lambda_outlier = shrinkage_fraction(df2_outlier, df1);
    let mut lambda: Vec<f64> = prob_not_outlier
        .iter()
        .map(|&p| p * lambda_prior + (1.0 - p) * lambda_outlier)
        .collect();

    let mut by_f_desc: Vec<usize> = (0..n).collect();
    by_f_desc.sort_by(|&a, &b| f_stat[b].partial_cmp(&f_stat[a]).unwrap_or(Ordering::Equal));
    let mut running = 0.0f64;
    for &g in &by_f_desc {
        running = running.max(lambda[g]);
        lambda[g] = running;
    }

    let df_prior = Array1::from_iter(lambda.iter().map(|&l| {
        if l >= 1.0 {
            f64::INFINITY
        } else {
            df1 * l / (1.0 - l)
        }
    }));
    Ok((fit, df_prior))
}

/// Shrink residual variances with `df` degrees of freedom towards a fitted prior.
///
/// Robust estimation needs at least three categories; with fewer it falls back to the
/// ordinary estimator and logs a warning.
pub fn squeeze_var(variances: &[f64], df: f64, robust: bool) -> anyhow::Result<SqueezedVariances> {
    let n = variances.len();
    let robust = if robust && n < MIN_ROBUST_CATEGORIES {
        log::warn!(
            "Robust eBayes needs {} or more categories, got {}. Normal eBayes will be performed",
            MIN_ROBUST_CATEGORIES,
            n
        );
        false
    } else {
        robust
    };

    let (fit, df_prior) = if robust {
        fit_f_dist_robust(variances, df)?
    } else {
        let fit = fit_f_dist(variances, df)?;
        (fit, Array1::from_elem(n, fit.df2))
    };

    let var_post = Array1::from_iter(variances.iter().zip(df_prior.iter()).map(|(&s2, &d0)| {
        if d0.is_infinite() {
            fit.scale
        } else {
            (d0 * fit.scale + df * s2) / (d0 + df)
        }
    }));

    Ok(SqueezedVariances {
        df_prior,
        var_prior: fit.scale,
        var_post,
        robust,
    })
}

/// `log s² - E[log χ²_d / d]`, the quantity whose moments identify the prior.
fn log_variance_residuals(variances: &[f64], df1: f64) -> anyhow::Result<Vec<f64>> {
    if !(df1 > 0.0) || variances.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(PropellerError::RootFinding(format!(
            "cannot match moments of {} variances with {} residual degrees of freedom",
            variances.len(),
            df1
        ))
        .into());
    }

    let mid = median(variances);
    if !(mid > 0.0) {
        return Err(PropellerError::RootFinding(
            "residual variances are zero for most categories, no moments to match".into(),
        )
        .into());
    }

    let floor = VARIANCE_FLOOR * mid;
    let offset = digamma(df1 / 2.0) - (df1 / 2.0).ln();
    Ok(variances
        .iter()
        .map(|&s2| s2.max(floor).ln() - offset)
        .collect())
}

fn prior_from_moments(emean: f64, evar: f64) -> anyhow::Result<FDistFit> {
    if !emean.is_finite() || evar.is_nan() {
        return Err(PropellerError::RootFinding(format!(
            "log-variance moments are not finite (mean {}, excess variance {})",
            emean, evar
        ))
        .into());
    }

    if evar > 0.0 {
        let df2 = 2.0 * trigamma_inverse(evar)?;
        let scale = (emean + digamma(df2 / 2.0) - (df2 / 2.0).ln()).exp();
        Ok(FDistFit { scale, df2 })
    } else {
        Ok(FDistFit {
            scale: emean.exp(),
            df2: f64::INFINITY,
        })
    }
}

/// Weight `d0 / (d0 + d)` the posterior variance puts on the prior.
fn shrinkage_fraction(df_prior: f64, df: f64) -> f64 {
    if df_prior.is_infinite() {
        1.0
    } else {
        df_prior / (df_prior + df)
    }
}

/// Mean and variance of a standard normal winsorised at the given tail proportions.
fn normal_winsor_moments(lower_p: f64, upper_p: f64) -> anyhow::Result<(f64, f64)> {
    let z = Normal::new(0.0, 1.0)?;
    let a = z.inverse_cdf(lower_p);
    let b = z.inverse_cdf(1.0 - upper_p);
    let (phi_a, phi_b) = (z.pdf(a), z.pdf(b));
    let body = 1.0 - lower_p - upper_p;

    let m = lower_p * a + upper_p * b + (phi_a - phi_b);
    let second = lower_p * a * a + upper_p * b * b + body + a * phi_a - b * phi_b;
    Ok((m, second - m * m))
}

/// Upper tail probability of `F(df1, df2)`, using the chi-squared limit for infinite `df2`.
pub(crate) fn f_upper_tail(f: f64, df1: f64, df2: f64) -> f64 {
    if f.is_nan() {
        return 1.0;
    }
    if f.is_infinite() {
        return 0.0;
    }
    let p = if df2.is_infinite() {
        ChiSquared::new(df1).ok().map(|d| d.sf(f * df1))
    } else {
        FisherSnedecor::new(df1, df2).ok().map(|d| d.sf(f))
    };
    p.filter(|p| !p.is_nan())
        .map(|p| p.clamp(0.0, 1.0))
        .unwrap_or(1.0)
}

/// Prior degrees of freedom that place `max_f` at the median of `F(df1, d)`.
///
/// Falls back to `df2` when no such value lies below it.
fn outlier_df(max_f: f64, df1: f64, df2: f64) -> f64 {
    let at_median = |log_d: f64| 0.5 - f_upper_tail(max_f, df1, log_d.exp());
    let lower = OUTLIER_DF_RANGE.0.ln();
    let upper = df2.min(OUTLIER_DF_RANGE.1).ln();
    if upper <= lower {
        return df2;
    }
    match brent_root(at_median, lower, upper, 1e-8, 100) {
        Ok(log_d) => log_d.exp().min(df2),
        Err(err) => {
            log::debug!("no outlier prior below d0 = {}: {}", df2, err);
            df2
        }
    }
}

//! Bootstrap pseudo-replicates and pooling for data without replicates.
//!
//! With one sample per condition there are no residual degrees of freedom, so each sample
//! is resampled into `n_reps` pseudo-replicates named `<sample>_rep_<i>`. Each one draws
//! as many cells as its parent holds from the parent's proportions, which is a
//! multinomial draw preserving the sample total. The full test is run on `n_sims`
//! independently drawn data sets in parallel and the runs are pooled:
//!
//! - mean proportions by inverse-variance weighting of the per-run estimates
//! - statistics, raw p-values and adjusted p-values each by their own per-category median,
//!   so `p_values` is the median of the runs' raw p-values and `Adjusted_p_values` the
//!   median of their BH-adjusted ones (the adjustment is not repeated after pooling)
//! - counts, proportions, transformed proportions and weights by elementwise means
//!
//! Every attempt of every run slot gets its own seed derived from the base seed, so results
//! do not depend on how rayon schedules the runs. A run failing with a recoverable error is
//! redrawn. Redraws come out of one budget shared by all runs, sized so the simulation
//! makes at most `max_attempts_per_run × n_sims` attempts in total; a single unlucky run
//! may use more than `max_attempts_per_run` of them. Once the budget is spent the
//! simulation fails with [`PropellerError::SimulationExhausted`].

use crate::data::{CountMatrix, SampleConditions};
use crate::error::{is_recoverable, PropellerError};
use crate::propeller::{proportion_ratio, require_conditions, run_propeller};
use crate::propeller::{PropellerConfig, PropellerResult, ResultTable};
use crate::testing::utils::{mean, median, sample_variance};
use crate::testing::{MultipleTestResults, TestMode};
use ndarray::Array2;
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Binomial;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Infix between a sample name and the 1-based pseudo-replicate number.
pub const REP_SEPARATOR: &str = "_rep_";

/// Name of the `rep`-th (1-based) pseudo-replicate of `sample`.
pub fn pseudo_sample_name(sample: &str, rep: usize) -> String {
    format!("{}{}{}", sample, REP_SEPARATOR, rep)
}

/// Draw `n_reps` pseudo-replicates of every sample.
///
/// Every pseudo-replicate is a multinomial draw of the parent's total from the parent's
/// proportions, sampled as a chain of conditional binomials over the categories.
/// Pseudo-replicates inherit their parent's condition and confounder values and keep the
/// parent's category order, including categories that receive no cells.
pub fn generate_reps<R>(
    counts: &CountMatrix,
    conditions: &SampleConditions,
    n_reps: usize,
    rng: &mut R,
) -> anyhow::Result<(CountMatrix, SampleConditions)>
where
    R: Rng + ?Sized,
{
    if n_reps == 0 {
        return Err(PropellerError::Input("n_reps must be at least 1".into()).into());
    }
    let sheet = conditions.reindex(counts.samples())?;
    let n_categories = counts.n_categories();
    let n_rows = counts.n_samples() * n_reps;

    let mut names = Vec::with_capacity(n_rows);
    let mut parents = Vec::with_capacity(n_rows);
    let mut drawn = Array2::<f64>::zeros((n_rows, n_categories));

    for (s, sample) in counts.samples().iter().enumerate() {
        let row = counts.counts().row(s);
        let total = row.sum().round().max(1.0) as u64;
        let last = row.iter().rposition(|&v| v > 0.0).unwrap_or(0);

        for rep in 1..=n_reps {
            let r = names.len();
            let mut remaining = total;
            let mut rest = row.sum();
            for (c, &count) in row.iter().enumerate().take(last + 1) {
                let share = if c == last {
                    1.0
                } else {
                    (count / rest).clamp(0.0, 1.0)
                };
                let k = Binomial::new(remaining, share)?.sample(rng);
                drawn[[r, c]] = k as f64;
                remaining -= k;
                rest -= count;
            }
            names.push(pseudo_sample_name(sample, rep));
            parents.push(sample.as_str());
        }
    }

    let condition_of = |parent: &str| -> anyhow::Result<String> {
        sheet
            .condition_of(parent)
            .map(str::to_string)
            .ok_or_else(|| {
                PropellerError::SampleMismatch {
                    sample: parent.to_string(),
                }
                .into()
            })
    };
    let rep_conditions = parents
        .iter()
        .map(|&p| condition_of(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut rep_sheet = SampleConditions::new(names.clone(), rep_conditions)?;

    for confounder in sheet.confounders() {
        let values = parents
            .iter()
            .map(|&p| {
                confounder.value_of(p).map(str::to_string).ok_or_else(|| {
                    PropellerError::SampleMismatch {
                        sample: p.to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        rep_sheet = rep_sheet.with_confounder(&confounder.name, names.clone(), values)?;
    }

    let rep_counts = CountMatrix::new(names, counts.categories().to_vec(), drawn)?;
    Ok((rep_counts, rep_sheet))
}

/// Run the test on `n_sims` bootstrapped data sets and pool the runs.
///
/// Uses `config.transform` as given; [`crate::propeller::propeller_counts`] switches it to
/// arcsin before calling this. Recoverable failures are redrawn from a budget shared by
/// all runs of `(max_attempts_per_run - 1) × n_sims` redraws, see the module docs.
pub fn sim_propeller(
    counts: &CountMatrix,
    conditions: &SampleConditions,
    config: &PropellerConfig,
) -> anyhow::Result<PropellerResult> {
    config.validate()?;
    let sheet = conditions.reindex(counts.samples())?;
    require_conditions(&sheet)?;

    let base_seed = config.seed.unwrap_or_else(rand::random);
    log::info!(
        "Generating {} replicates and running {} simulations",
        config.n_reps,
        config.n_sims
    );
    let start = Instant::now();
    let redraws = (config.max_attempts_per_run - 1).saturating_mul(config.n_sims);
    let budget = RedrawBudget::new(redraws);

    let runs = (0..config.n_sims)
        .into_par_iter()
        .map(|run| {
            simulate_run(run, &budget, base_seed, |rng| {
                let (rep_counts, rep_sheet) = generate_reps(counts, &sheet, config.n_reps, rng)?;
                run_propeller(&rep_counts, &rep_sheet, config)
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    log::info!(
        "Finished {} simulations in {:.2} seconds",
        config.n_sims,
        start.elapsed().as_secs_f64()
    );
    pool_runs(counts, runs)
}

/// One pooled run slot and the draws it took.
struct SimulationRun {
    output: PropellerResult,
    attempts: usize,
}

/// Redraws still available to all run slots together.
struct RedrawBudget {
    remaining: AtomicUsize,
}

impl RedrawBudget {
    fn new(redraws: usize) -> Self {
        RedrawBudget {
            remaining: AtomicUsize::new(redraws),
        }
    }

    /// Take one redraw, `false` once the budget is spent.
    fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok()
    }
}

/// Run slot `run`, redrawing on recoverable failures while the shared budget lasts.
fn simulate_run<F>(
    run: usize,
    budget: &RedrawBudget,
    base_seed: u64,
    mut attempt_run: F,
) -> anyhow::Result<SimulationRun>
where
    F: FnMut(&mut StdRng) -> anyhow::Result<PropellerResult>,
{
    let mut attempt = 0;
    loop {
        let mut rng = StdRng::seed_from_u64(attempt_seed(base_seed, run, attempt));
        attempt += 1;
        match attempt_run(&mut rng) {
            Ok(output) => {
                return Ok(SimulationRun {
                    output,
                    attempts: attempt,
                });
            }
            Err(err) if is_recoverable(&err) => {
                if !budget.take() {
                    return Err(PropellerError::SimulationExhausted {
                        run,
                        attempts: attempt,
                        reason: err.to_string(),
                    }
                    .into());
                }
                log::debug!("simulation run {} attempt {} redrawn: {}", run, attempt, err);
            }
            Err(err) => return Err(err.context(format!("simulation run {}", run))),
        }
    }
}

/// `seed ⊕ splitmix64(run · 2³² + attempt)`.
fn attempt_seed(base_seed: u64, run: usize, attempt: usize) -> u64 {
    base_seed ^ splitmix64(((run as u64) << 32) | attempt as u64)
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Pool finished runs into one result.
///
/// `p_values` holds the per-category median of the runs' raw p-values and
/// `Adjusted_p_values` the median of their adjusted p-values, not a re-adjustment of the
/// pooled raw values.
fn pool_runs(counts: &CountMatrix, runs: Vec<SimulationRun>) -> anyhow::Result<PropellerResult> {
    let n_attempts = runs.iter().map(|r| r.attempts).sum();
    let outputs: Vec<PropellerResult> = runs.into_iter().map(|r| r.output).collect();
    let first = outputs
        .first()
        .ok_or_else(|| PropellerError::Input("no simulation runs to pool".into()))?;
    let results: Vec<&ResultTable> = outputs.iter().map(|o| &o.results).collect();

    let mean_props = combine(&results.iter().map(|r| r.mean_props()).collect::<Vec<_>>())?;
    let mode = first.results.mode();
    let prop_ratio = (mode == TestMode::TTest).then(|| proportion_ratio(&mean_props, &[1, -1]));

    let statistics = median_per_category(results.iter().map(|r| r.statistics()));
    let p_values = median_per_category(results.iter().map(|r| r.p_values()));
    let adjusted = median_per_category(results.iter().map(|r| r.adjusted_p_values()));
    let tests = MultipleTestResults::new(statistics, p_values)
        .with_adjusted_p_values(adjusted)
        .with_global_metadata("test_type", mode.name())
        .with_global_metadata("transform", first.transform.name())
        .with_global_metadata("pooling", "median");

    let table = ResultTable::new(
        counts.categories().to_vec(),
        first.results.conditions().to_vec(),
        counts.baseline_proportions(),
        mean_props,
        prop_ratio,
        mode,
        first.results.df_numerator(),
        tests,
    )?;

    let mean_counts = mean_matrices(&outputs.iter().map(|o| o.counts.counts()).collect::<Vec<_>>())?;
    let counts_mean = CountMatrix::averaged(
        first.counts.samples().to_vec(),
        first.counts.categories().to_vec(),
        mean_counts,
    )?;

    Ok(PropellerResult {
        results: table,
        counts: counts_mean,
        props: mean_matrices(&outputs.iter().map(|o| &o.props).collect::<Vec<_>>())?,
        prop_trans: mean_matrices(&outputs.iter().map(|o| &o.prop_trans).collect::<Vec<_>>())?,
        weights: mean_matrices(&outputs.iter().map(|o| &o.weights).collect::<Vec<_>>())?,
        design: first.design.clone(),
        transform: first.transform,
        moderated: None,
        simulated: true,
        n_attempts,
    })
}

/// Pool per-run estimates (categories × conditions each) cell by cell.
///
/// Every run's estimate is weighted by the inverse of the between-run variance of that
/// cell, see [`inverse_variance_pool`].
pub fn combine(estimates: &[&Array2<f64>]) -> anyhow::Result<Array2<f64>> {
    let shape = check_same_shape(estimates)?;
    let mut pooled = Array2::<f64>::zeros(shape);
    for ((g, j), value) in pooled.indexed_iter_mut() {
        let cell: Vec<f64> = estimates.iter().map(|e| e[[g, j]]).collect();
        let variance = sample_variance(&cell);
        *value = inverse_variance_pool(&cell, &vec![variance; cell.len()])?;
    }
    Ok(pooled)
}

/// Fixed-effect pooling `Σ w_i · x_i` with `w_i = (1 / v_i) / Σ_k (1 / v_k)`.
///
/// Falls back to the plain mean when any variance is zero, negative or not finite.
pub fn inverse_variance_pool(estimates: &[f64], variances: &[f64]) -> anyhow::Result<f64> {
    if estimates.is_empty() || estimates.len() != variances.len() {
        return Err(PropellerError::Input(format!(
            "cannot pool {} estimates with {} variances",
            estimates.len(),
            variances.len()
        ))
        .into());
    }
    if variances.iter().any(|&v| !(v.is_finite() && v > 0.0)) {
        return Ok(mean(estimates));
    }

    let precision: Vec<f64> = variances.iter().map(|v| 1.0 / v).collect();
    let total: f64 = precision.iter().sum();
    Ok(estimates
        .iter()
        .zip(&precision)
        .map(|(x, w)| x * w / total)
        .sum())
}

/// Elementwise mean of equally shaped matrices.
pub fn mean_matrices(matrices: &[&Array2<f64>]) -> anyhow::Result<Array2<f64>> {
    let shape = check_same_shape(matrices)?;
    let mut sum = Array2::<f64>::zeros(shape);
    for m in matrices {
        sum += *m;
    }
    Ok(sum / matrices.len() as f64)
}

fn check_same_shape(matrices: &[&Array2<f64>]) -> anyhow::Result<(usize, usize)> {
    let first = matrices
        .first()
        .ok_or_else(|| PropellerError::Input("no matrices to pool".into()))?;
    let shape = first.dim();
    if let Some(other) = matrices.iter().find(|m| m.dim() != shape) {
        return Err(PropellerError::Input(format!(
            "cannot pool matrices of shape {:?} and {:?}",
            shape,
            other.dim()
        ))
        .into());
    }
    Ok(shape)
}

fn median_per_category<'a, I>(runs: I) -> Vec<f64>
where
    I: Iterator<Item = &'a [f64]>,
{
    let runs: Vec<&[f64]> = runs.collect();
    let n = runs.first().map_or(0, |r| r.len());
    (0..n)
        .map(|g| median(&runs.iter().map(|r| r[g]).collect::<Vec<_>>()))
        .collect()
}

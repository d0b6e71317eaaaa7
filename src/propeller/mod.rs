//! Differential proportion testing across conditions.
//!
//! [`propeller`] and [`propeller_counts`] are the entry points. They check that at least
//! two conditions are present, then either run the test directly ([`run_propeller`]) or,
//! when every condition holds a single sample, bootstrap pseudo-replicates and pool many
//! runs ([`crate::simulation::sim_propeller`]).

use crate::data::{CellAnnotations, CountMatrix, SampleConditions};
use crate::error::PropellerError;
use crate::model::{contrasts_fit, create_design, lm_fit, DesignMatrix};
use crate::simulation::sim_propeller;
use crate::testing::correction::benjamini_hochberg_correction;
use crate::testing::inference::ebayes::MIN_ROBUST_CATEGORIES;
use crate::testing::inference::{ebayes_f, ebayes_t, ModeratedFit};
use crate::testing::{MultipleTestResults, TestMode};
use crate::transform::{transformed_proportions, Transform, TransformedProportions};
use ndarray::{Array1, Array2};

mod config;
mod result;

pub use config::PropellerConfig;
pub use result::{PropellerResult, ResultRow, ResultTable};

/// Test per-cell annotations for differences in cluster proportions between conditions.
pub fn propeller(cells: &CellAnnotations, config: &PropellerConfig) -> anyhow::Result<PropellerResult> {
    let counts = cells.count_matrix()?;
    let conditions = cells.sample_conditions()?;
    propeller_counts(&counts, &conditions, config)
}

/// Test pre-aggregated counts for differences in category proportions between conditions.
///
/// Fails with [`PropellerError::Input`] before any computation when fewer than two
/// conditions are present among the counted samples. Data with one sample per condition
/// is simulated with the arcsin transform whatever `config.transform` says.
pub fn propeller_counts(
    counts: &CountMatrix,
    conditions: &SampleConditions,
    config: &PropellerConfig,
) -> anyhow::Result<PropellerResult> {
    config.validate()?;
    let sheet = conditions.reindex(counts.samples())?;
    let n_conditions = require_conditions(&sheet)?;

    if n_conditions == counts.n_samples() {
        log::warn!(
            "Data has no replicates, {} pseudo-replicates per sample will be simulated {} times",
            config.n_reps,
            config.n_sims
        );
        if config.transform != Transform::Arcsin {
            log::warn!(
                "Transform '{}' replaced by 'arcsin' for simulated replicates",
                config.transform
            );
        }
        let sim_config = config.clone().with_transform(Transform::Arcsin);
        return sim_propeller(counts, &sheet, &sim_config);
    }

    log::info!(
        "There are {} conditions. {} will be performed",
        n_conditions,
        match TestMode::for_conditions(n_conditions) {
            TestMode::TTest => "T-Test",
            TestMode::Anova => "ANOVA",
        }
    );
    run_propeller(counts, &sheet, config)
}

/// Run the moderated test once on replicated counts.
///
/// Two conditions get a moderated t-test of the contrast `[1, -1]` (zero on confounder
/// columns); more conditions get a moderated F-test on the intercept-form design.
pub fn run_propeller(
    counts: &CountMatrix,
    conditions: &SampleConditions,
    config: &PropellerConfig,
) -> anyhow::Result<PropellerResult> {
    let tp = transformed_proportions(counts, config.transform)?;
    let design = create_design(conditions, counts.samples())?;
    if design.n_conditions() < 2 {
        return Err(too_few_conditions(design.n_conditions()).into());
    }

    let weights = config.weighted.then_some(&tp.weights);
    let (results, moderated) = if design.n_conditions() == 2 {
        let mut contrast = vec![0; design.n_columns()];
        contrast[0] = 1;
        contrast[1] = -1;
        t_test(&tp, &design, &contrast, config.robust, weights)?
    } else {
        let coefficients: Vec<usize> = (1..design.n_conditions()).collect();
        anova(&tp, &design, &coefficients, config.robust, weights)?
    };
    log::debug!(
        "{} on {} categories finished, {} significant at 0.05",
        moderated.mode.name(),
        results.n_categories(),
        results.significant(0.05).len()
    );

    Ok(PropellerResult {
        results,
        counts: tp.counts,
        props: tp.props,
        prop_trans: tp.prop_trans,
        weights: tp.weights,
        design,
        transform: tp.transform,
        moderated: Some(moderated),
        simulated: false,
        n_attempts: 1,
    })
}

/// Moderated t-test of one contrast between two conditions.
///
/// Mean proportions come from an unweighted fit of the raw proportions on the columns the
/// contrast uses, and `Prop_ratio` is `Π mean_j ^ contrast_j` over those columns.
pub fn t_test(
    tp: &TransformedProportions,
    design: &DesignMatrix,
    contrast: &[i32],
    robust: bool,
    weights: Option<&Array2<f64>>,
) -> anyhow::Result<(ResultTable, ModeratedFit)> {
    let robust = robust_allowed(robust, tp.n_categories());
    let fit = lm_fit(design, &tp.prop_trans, weights)?;
    let moderated = ebayes_t(&contrasts_fit(&fit, contrast)?, robust)?;

    let used: Vec<usize> = contrast
        .iter()
        .enumerate()
        .filter(|&(_, &c)| c != 0)
        .map(|(j, _)| j)
        .collect();
    let prop_design = design.select_columns(&used)?;
    let prop_fit = lm_fit(&prop_design, &tp.props, None)?;
    let exponents: Vec<i32> = used.iter().map(|&j| contrast[j]).collect();
    let ratio = proportion_ratio(&prop_fit.coefficients, &exponents);

    let table = assemble_table(
        tp,
        prop_design.columns().to_vec(),
        prop_fit.coefficients,
        Some(ratio),
        &moderated,
    )?;
    Ok((table, moderated))
}

/// Moderated F-test that all conditions share the same proportion.
///
/// `coefficients` index the intercept-form design, normally conditions `2..K`. Mean
/// proportions come from an unweighted fit of the raw proportions on the condition
/// indicator columns.
pub fn anova(
    tp: &TransformedProportions,
    design: &DesignMatrix,
    coefficients: &[usize],
    robust: bool,
    weights: Option<&Array2<f64>>,
) -> anyhow::Result<(ResultTable, ModeratedFit)> {
    let robust = robust_allowed(robust, tp.n_categories());
    let prop_design = design.condition_design();
    let prop_fit = lm_fit(&prop_design, &tp.props, None)?;

    let fit = lm_fit(&design.to_intercept_form(), &tp.prop_trans, weights)?;
    let moderated = ebayes_f(&fit, coefficients, robust)?;

    let table = assemble_table(
        tp,
        prop_design.columns().to_vec(),
        prop_fit.coefficients,
        None,
        &moderated,
    )?;
    Ok((table, moderated))
}

/// `Π_j mean_props[g, j] ^ exponents[j]` per category.
pub(crate) fn proportion_ratio(mean_props: &Array2<f64>, exponents: &[i32]) -> Array1<f64> {
    Array1::from_shape_fn(mean_props.nrows(), |g| {
        exponents
            .iter()
            .enumerate()
            .map(|(j, &e)| mean_props[[g, j]].powi(e))
            .product()
    })
}

fn assemble_table(
    tp: &TransformedProportions,
    conditions: Vec<String>,
    mean_props: Array2<f64>,
    prop_ratio: Option<Array1<f64>>,
    moderated: &ModeratedFit,
) -> anyhow::Result<ResultTable> {
    let p_values = moderated.p_values.to_vec();
    let adjusted = benjamini_hochberg_correction(&p_values)?;
    let tests = MultipleTestResults::new(moderated.statistics.to_vec(), p_values)
        .with_adjusted_p_values(adjusted)
        .with_degrees_of_freedom(moderated.df_total.to_vec())
        .with_global_metadata("test_type", moderated.mode.name())
        .with_global_metadata("transform", tp.transform.name());

    ResultTable::new(
        tp.counts.categories().to_vec(),
        conditions,
        tp.counts.baseline_proportions(),
        mean_props,
        prop_ratio,
        moderated.mode,
        moderated.df_numerator,
        tests,
    )
}

fn robust_allowed(robust: bool, n_categories: usize) -> bool {
    if robust && n_categories < MIN_ROBUST_CATEGORIES {
        log::warn!(
            "Robust eBayes needs {} or more categories, got {}. Normal eBayes will be performed",
            MIN_ROBUST_CATEGORIES,
            n_categories
        );
        return false;
    }
    robust
}

pub(crate) fn require_conditions(sheet: &SampleConditions) -> anyhow::Result<usize> {
    let n = sheet.n_conditions();
    if n < 2 {
        return Err(too_few_conditions(n).into());
    }
    Ok(n)
}

fn too_few_conditions(n: usize) -> PropellerError {
    PropellerError::Input(format!(
        "There has to be at least two conditions to compare, found {}",
        n
    ))
}

//! Proportions and their variance-stabilising transforms.
//!
//! Raw counts are row-normalised to proportions and then moved to a scale on which a
//! linear model with roughly constant variance is reasonable:
//!
//! - **logit**: `ln(p / (1 - p))`, with `p` clipped into `[1/(2N), 1 - 1/(2N)]` where `N`
//!   is the sample's total cell count, so empty and saturated categories stay finite
//! - **arcsin**: `asin(sqrt(p))`, defined on the closed interval so no correction is needed
//!
//! Weights approximate the inverse sampling variance of each transformed value and can be
//! handed to the linear model fitter.

use crate::data::CountMatrix;
use crate::error::PropellerError;
use ndarray::{Array2, Axis};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    Logit,
    Arcsin,
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Logit => "logit",
            Transform::Arcsin => "arcsin",
        }
    }

    /// Transform a proportion observed in a sample holding `total` cells.
    pub fn apply(&self, p: f64, total: f64) -> f64 {
        match self {
            Transform::Logit => {
                let bound = logit_bound(total);
                let p = p.clamp(bound, 1.0 - bound);
                (p / (1.0 - p)).ln()
            }
            Transform::Arcsin => p.sqrt().asin(),
        }
    }

    /// Map a transformed value back to a proportion.
    pub fn inverse(&self, y: f64) -> f64 {
        match self {
            Transform::Logit => 1.0 / (1.0 + (-y).exp()),
            Transform::Arcsin => {
                let s = y.sin();
                s * s
            }
        }
    }

    /// Approximate inverse variance of a transformed proportion, given the category's
    /// proportion `p` and the sample size `total`.
    ///
    /// The delta method gives `Var(asin(sqrt(p̂))) ≈ 1 / (4N)` and
    /// `Var(logit(p̂)) ≈ 1 / (N p (1 - p))`.
    pub fn weight(&self, p: f64, total: f64) -> f64 {
        match self {
            Transform::Logit => total * p * (1.0 - p),
            Transform::Arcsin => 4.0 * total,
        }
    }
}

/// Distance of the logit clip from 0 and 1, `1/(2N)`, never past one half.
fn logit_bound(total: f64) -> f64 {
    (0.5 / total).min(0.5)
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transform {
    type Err = PropellerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "logit" => Ok(Transform::Logit),
            "arcsin" | "asin" => Ok(Transform::Arcsin),
            _ => Err(PropellerError::InvalidTransform(s.to_string())),
        }
    }
}

/// Counts together with their proportions, transformed proportions and weights, all
/// indexed by the count matrix's samples and categories.
#[derive(Debug, Clone)]
pub struct TransformedProportions {
    pub counts: CountMatrix,
    pub props: Array2<f64>,
    pub prop_trans: Array2<f64>,
    pub weights: Array2<f64>,
    pub transform: Transform,
}

impl TransformedProportions {
    pub fn n_samples(&self) -> usize {
        self.counts.n_samples()
    }

    pub fn n_categories(&self) -> usize {
        self.counts.n_categories()
    }

    /// Whether every category shares the same weight for a given sample.
    pub fn has_shared_weights(&self) -> bool {
        self.weights
            .axis_iter(Axis(0))
            .all(|row| row.iter().all(|&w| w == row[0]))
    }
}

/// Compute proportions, transformed proportions and weights from a count matrix.
///
/// For the logit weights the category's proportion is estimated from all samples pooled,
/// clipped like the transform itself so categories absent everywhere keep a positive weight.
pub fn transformed_proportions(
    counts: &CountMatrix,
    transform: Transform,
) -> anyhow::Result<TransformedProportions> {
    let totals = counts.sample_totals();
    let props = counts.counts() / &totals.view().insert_axis(Axis(1));

    let prop_trans = Array2::from_shape_fn(props.raw_dim(), |(s, c)| {
        transform.apply(props[[s, c]], totals[s])
    });

    let grand_total = totals.sum();
    let bound = logit_bound(grand_total);
    let pooled = counts
        .baseline_proportions()
        .mapv(|p| p.clamp(bound, 1.0 - bound));
    let weights = Array2::from_shape_fn(props.raw_dim(), |(s, c)| {
        transform.weight(pooled[c], totals[s])
    });

    Ok(TransformedProportions {
        counts: counts.clone(),
        props,
        prop_trans,
        weights,
        transform,
    })
}

/// Parse the transform by name and compute the transformed proportions.
pub fn get_transformed_props(
    counts: &CountMatrix,
    transform: &str,
) -> anyhow::Result<TransformedProportions> {
    let transform: Transform = transform.parse()?;
    transformed_proportions(counts, transform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn example_counts() -> CountMatrix {
        CountMatrix::new(
            vec!["s1".into(), "s2".into(), "s3".into()],
            vec!["A".into(), "B".into(), "C".into()],
            array![[10.0, 30.0, 60.0], [0.0, 5.0, 15.0], [8.0, 8.0, 4.0]],
        )
        .unwrap()
    }

    #[test]
    fn test_rows_sum_to_one() {
        let tp = transformed_proportions(&example_counts(), Transform::Logit).unwrap();
        for row in tp.props.axis_iter(Axis(0)) {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_logit_clips_zero_counts() {
        let tp = transformed_proportions(&example_counts(), Transform::Logit).unwrap();
        // s2 has 20 cells, so zero is moved to 1/40
        let expected = (1.0_f64 / 40.0 / (1.0 - 1.0 / 40.0)).ln();
        assert_relative_eq!(tp.prop_trans[[1, 0]], expected, epsilon = 1e-12);
        assert!(tp.prop_trans.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_arcsin_values() {
        let tp = transformed_proportions(&example_counts(), Transform::Arcsin).unwrap();
        assert_relative_eq!(tp.prop_trans[[1, 0]], 0.0);
        assert_relative_eq!(tp.prop_trans[[0, 0]], 0.1_f64.sqrt().asin(), epsilon = 1e-12);
        assert!(tp.has_shared_weights());
        assert_relative_eq!(tp.weights[[0, 1]], 400.0);
    }

    #[test]
    fn test_logit_weights_are_category_specific() {
        let tp = transformed_proportions(&example_counts(), Transform::Logit).unwrap();
        assert!(!tp.has_shared_weights());
        // pooled proportion of B is 43 / 140
        let p = 43.0 / 140.0;
        assert_relative_eq!(tp.weights[[2, 1]], 20.0 * p * (1.0 - p), epsilon = 1e-12);
    }

    #[test]
    fn test_transforms_are_monotonic_and_invertible() {
        for transform in [Transform::Logit, Transform::Arcsin] {
            let mut previous = f64::NEG_INFINITY;
            for i in 1..100 {
                let p = i as f64 / 100.0;
                let y = transform.apply(p, 1000.0);
                assert!(y > previous, "{} is not increasing at {}", transform, p);
                previous = y;
                assert_relative_eq!(transform.inverse(y), p, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_logit_clip_for_tiny_totals() {
        assert_relative_eq!(Transform::Logit.apply(0.3, 0.5), 0.0, epsilon = 1e-12);
        assert!(Transform::Logit.apply(0.0, 1.0).is_finite());
    }

    #[test]
    fn test_unknown_transform_name() {
        let err = get_transformed_props(&example_counts(), "probit").unwrap_err();
        assert_eq!(
            err.downcast_ref::<PropellerError>(),
            Some(&PropellerError::InvalidTransform("probit".into()))
        );
        assert_eq!("ARCSIN".parse::<Transform>().unwrap(), Transform::Arcsin);
    }
}

use crate::error::PropellerError;
use crate::model::LinearFit;
use ndarray::{Array1, Array2};

/// A single linear contrast applied to every category of a [`LinearFit`].
#[derive(Debug, Clone)]
pub struct ContrastFit {
    pub contrast: Vec<i32>,
    /// `contrast · β` per category.
    pub coefficients: Array1<f64>,
    /// `sqrt(cᵗ (XᵗWX)⁻¹ c)` per category.
    pub stdev_unscaled: Array1<f64>,
    /// Residual standard deviation per category, unchanged from the fit.
    pub sigma: Array1<f64>,
    pub df_residual: f64,
}

impl ContrastFit {
    pub fn n_categories(&self) -> usize {
        self.coefficients.len()
    }

    /// `σ · sqrt(cᵗ (XᵗWX)⁻¹ c)` per category.
    pub fn standard_errors(&self) -> Array1<f64> {
        &self.sigma * &self.stdev_unscaled
    }

    pub fn residual_variances(&self) -> Array1<f64> {
        self.sigma.mapv(|s| s * s)
    }
}

/// Apply an integer contrast such as `[1, -1]` to a fitted model.
///
/// Fails with [`PropellerError::InvalidContrast`] if the contrast does not have one entry
/// per design column or is all zeros.
pub fn contrasts_fit(fit: &LinearFit, contrast: &[i32]) -> anyhow::Result<ContrastFit> {
    let k = fit.n_coefficients();
    if contrast.len() != k {
        return Err(PropellerError::InvalidContrast(format!(
            "contrast has {} entries but the design has {} columns ({})",
            contrast.len(),
            k,
            fit.columns.join(", ")
        ))
        .into());
    }
    if contrast.iter().all(|&c| c == 0) {
        return Err(PropellerError::InvalidContrast("contrast is all zeros".into()).into());
    }

    let c = Array1::from_iter(contrast.iter().map(|&v| f64::from(v)));
    let coefficients = fit.coefficients.dot(&c);

    let variance_factor = |cov: &Array2<f64>| c.dot(&cov.dot(&c));
    let stdev_unscaled = if fit.has_shared_covariance() {
        let v = variance_factor(fit.unscaled_covariance(0)).sqrt();
        Array1::from_elem(fit.n_categories(), v)
    } else {
        Array1::from_shape_fn(fit.n_categories(), |g| {
            variance_factor(fit.unscaled_covariance(g)).sqrt()
        })
    };

    Ok(ContrastFit {
        contrast: contrast.to_vec(),
        coefficients,
        stdev_unscaled,
        sigma: fit.sigma.clone(),
        df_residual: fit.df_residual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SampleConditions;
    use crate::model::{create_design, lm_fit};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn fit() -> LinearFit {
        let sheet = SampleConditions::new(
            ["s1", "s2", "s3", "s4", "s5"],
            ["a", "a", "b", "b", "b"],
        )
        .unwrap();
        let samples = sheet.samples().to_vec();
        let design = create_design(&sheet, &samples).unwrap();
        let y = array![[0.1, 0.5], [0.3, 0.6], [0.9, 0.2], [1.0, 0.1], [1.1, 0.3]];
        lm_fit(&design, &y, None).unwrap()
    }

    #[test]
    fn test_contrast_is_difference_of_coefficients() {
        let fit = fit();
        let cf = contrasts_fit(&fit, &[1, -1]).unwrap();
        for g in 0..2 {
            assert_eq!(
                cf.coefficients[g],
                fit.coefficients[[g, 0]] - fit.coefficients[[g, 1]]
            );
        }
        // 1/2 + 1/3 for a two and three sample group
        assert_relative_eq!(cf.stdev_unscaled[0], (5.0_f64 / 6.0).sqrt(), epsilon = 1e-12);
        assert_eq!(cf.df_residual, 3.0);
    }

    #[test]
    fn test_contrast_length_must_match() {
        let err = contrasts_fit(&fit(), &[1, -1, 0]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PropellerError>(),
            Some(PropellerError::InvalidContrast(_))
        ));
        assert!(contrasts_fit(&fit(), &[0, 0]).is_err());
    }
}

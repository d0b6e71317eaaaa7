use crate::error::PropellerError;
use anyhow::Result;
use std::cmp::Ordering;

/// Apply Benjamini-Hochberg (BH) procedure for controlling false discovery rate
///
/// The BH procedure controls the false discovery rate (FDR), which is the expected
/// proportion of false positives among all rejected null hypotheses. Adjusted values
/// are returned in the order of the input.
///
/// # Arguments
/// * `p_values` - A slice of p-values to adjust
///
/// # Returns
/// * `Result<Vec<f64>>` - Vector of adjusted p-values
///
/// # Example
/// ```
/// use single_propeller::testing::correction::benjamini_hochberg_correction;
///
/// let p_values = vec![0.01, 0.03, 0.05];
/// let adjusted = benjamini_hochberg_correction(&p_values).unwrap();
/// assert!(adjusted[0] <= adjusted[1] && adjusted[1] <= adjusted[2]);
/// ```
pub fn benjamini_hochberg_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    let n = p_values.len();
    if n == 0 {
        return Err(PropellerError::Input("Empty p-value array".into()).into());
    }

    for (i, &p) in p_values.iter().enumerate() {
        if !(0.0..=1.0).contains(&p) {
            return Err(PropellerError::Input(format!("Invalid p-value at index {}: {}", i, p)).into());
        }
    }

    let mut indexed_p_values: Vec<(usize, f64)> =
        p_values.iter().enumerate().map(|(i, &p)| (i, p)).collect();
    indexed_p_values.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    let mut adjusted_p_values = vec![0.0; n];
    let mut current_min = 1.0;

    // largest to smallest, keeping the running minimum
    for i in (0..n).rev() {
        let (orig_idx, p_val) = indexed_p_values[i];
        let rank = i + 1;

        let adjustment = (p_val * n as f64 / rank as f64).min(1.0);
        current_min = adjustment.min(current_min);
        adjusted_p_values[orig_idx] = current_min;
    }

    Ok(adjusted_p_values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assert_vec_relative_eq(a: &[f64], b: &[f64], epsilon: f64) {
        assert_eq!(a.len(), b.len(), "Vectors have different lengths");
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            if (x - y).abs() > epsilon {
                panic!("Vectors differ at index {}: {} != {}", i, x, y);
            }
        }
    }

    #[test]
    fn test_benjamini_hochberg_empty_input() {
        let result = benjamini_hochberg_correction(&[]);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().to_string(), "Invalid input: Empty p-value array");
    }

    #[test]
    fn test_benjamini_hochberg_invalid_pvalues() {
        for bad in [-0.5, 1.5, f64::NAN] {
            let err = benjamini_hochberg_correction(&[0.01, bad, 0.03]).unwrap_err();
            assert!(err.to_string().contains("Invalid p-value at index 1"));
            assert!(matches!(
                err.downcast_ref::<PropellerError>(),
                Some(PropellerError::Input(_))
            ));
        }
    }

    #[test]
    fn test_benjamini_hochberg_identical_pvalues() {
        let adjusted = benjamini_hochberg_correction(&[0.05, 0.05, 0.05]).unwrap();
        assert_vec_relative_eq(&adjusted, &[0.05, 0.05, 0.05], 1e-10);
    }

    #[test]
    fn test_benjamini_hochberg_ordered_pvalues() {
        let p_values = vec![0.01, 0.02, 0.03, 0.04, 0.05];
        let adjusted = benjamini_hochberg_correction(&p_values).unwrap();
        assert_vec_relative_eq(&adjusted, &[0.05; 5], 1e-10);
    }

    #[test]
    fn test_benjamini_hochberg_unordered_pvalues() {
        let p_values = vec![0.05, 0.01, 0.1, 0.04, 0.02];
        let expected = vec![0.0625, 0.05, 0.1, 0.0625, 0.05];
        let adjusted = benjamini_hochberg_correction(&p_values).unwrap();
        assert_vec_relative_eq(&adjusted, &expected, 1e-10);
    }

    #[test]
    fn test_benjamini_hochberg_edge_cases() {
        let adjusted = benjamini_hochberg_correction(&[1e-10, 1e-9, 1e-8]).unwrap();
        assert!(adjusted.iter().all(|&p| p > 0.0 && p < 0.001));

        let adjusted = benjamini_hochberg_correction(&[0.1, 0.2, 1.0]).unwrap();
        assert_relative_eq!(adjusted[2], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_benjamini_hochberg_real_example() {
        let pvalues = vec![0.1, 0.2, 0.3, 0.4, 0.1];
        let expected = [0.25, 0.3333333333333333, 0.375, 0.4, 0.25];
        let adjusted = benjamini_hochberg_correction(&pvalues).unwrap();
        assert_vec_relative_eq(&adjusted, &expected, 1e-10);
    }

    #[test]
    fn test_benjamini_hochberg_single_pvalue() {
        let adjusted = benjamini_hochberg_correction(&[0.025]).unwrap();
        assert_relative_eq!(adjusted[0], 0.025, epsilon = 1e-10);
    }

    #[test]
    fn test_adjusted_values_follow_raw_order() {
        let p_values = vec![0.3, 0.002, 0.04, 0.9, 0.011, 0.04, 0.5];
        let adjusted = benjamini_hochberg_correction(&p_values).unwrap();

        let mut order: Vec<usize> = (0..p_values.len()).collect();
        order.sort_by(|&a, &b| p_values[a].partial_cmp(&p_values[b]).unwrap());
        for pair in order.windows(2) {
            assert!(adjusted[pair[0]] <= adjusted[pair[1]]);
        }
        for (p, q) in p_values.iter().zip(&adjusted) {
            assert!(q >= p && *q <= 1.0);
        }
        assert_eq!(adjusted, benjamini_hochberg_correction(&p_values).unwrap());
    }
}

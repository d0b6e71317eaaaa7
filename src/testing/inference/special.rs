//! Special functions and a bracketed root finder used by the variance moderation.

use crate::error::PropellerError;

pub use statrs::function::gamma::digamma;

/// Trigamma function ψ₁(x) for `x > 0`.
///
/// Shifts the argument upwards with `ψ₁(x) = ψ₁(x + 1) + 1/x²` and finishes with the
/// asymptotic expansion, which is accurate to double precision for `x ≥ 8`.
pub fn trigamma(x: f64) -> f64 {
    if !(x > 0.0) {
        return f64::NAN;
    }
    if x.is_infinite() {
        return 0.0;
    }

    let mut shift = 0.0;
    let mut z = x;
    while z < 8.0 {
        shift += 1.0 / (z * z);
        z += 1.0;
    }

    let z2 = 1.0 / (z * z);
    let series = 1.0 / z
        + z2 / 2.0
        + z2 / z
            * (1.0 / 6.0 - z2 * (1.0 / 30.0 - z2 * (1.0 / 42.0 - z2 * (1.0 / 30.0 - z2 * 5.0 / 66.0))));
    shift + series
}

/// Solve `ψ₁(x) = y` for `x > 0`.
///
/// Very small and very large targets use the leading asymptotic terms; everything else
/// is solved with Brent's method on the log scale, where ψ₁ is smooth and monotone.
pub fn trigamma_inverse(y: f64) -> anyhow::Result<f64> {
    if !y.is_finite() || y <= 0.0 {
        return Err(PropellerError::RootFinding(format!(
            "cannot invert trigamma at {}",
            y
        ))
        .into());
    }
    if y > 1e7 {
        return Ok(1.0 / y.sqrt());
    }
    if y < 1e-6 {
        return Ok(1.0 / y);
    }

    let log_x = brent_root(|u| trigamma(u.exp()) - y, (1e-4f64).ln(), (1e7f64).ln(), 1e-12, 200)?;
    Ok(log_x.exp())
}

/// Find a root of `f` inside `[lower, upper]` with Brent's method.
///
/// The endpoints must bracket a root: `f(lower)` and `f(upper)` have to be finite with
/// opposite signs, otherwise [`PropellerError::RootFinding`] is returned. The same error
/// is returned if `max_iter` iterations do not reach the tolerance.
pub fn brent_root<F>(f: F, lower: f64, upper: f64, tol: f64, max_iter: usize) -> anyhow::Result<f64>
where
    F: Fn(f64) -> f64,
{
    let (mut a, mut b) = (lower, upper);
    let (mut fa, mut fb) = (f(a), f(b));

    if !fa.is_finite() || !fb.is_finite() || fa * fb > 0.0 {
        return Err(PropellerError::RootFinding(format!(
            "f(a) and f(b) must have different signs: f({}) = {}, f({}) = {}",
            a, fa, b, fb
        ))
        .into());
    }
    if fa == 0.0 {
        return Ok(a);
    }
    if fb == 0.0 {
        return Ok(b);
    }

    let (mut c, mut fc) = (b, fb);
    let mut d = b - a;
    let mut e = d;

    for _ in 0..max_iter {
        if (fb > 0.0) == (fc > 0.0) {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }

        let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * tol;
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb == 0.0 {
            return Ok(b);
        }

        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            // inverse quadratic interpolation, or secant when only two points are distinct
            let s = fb / fa;
            let (mut p, mut q) = if a == c {
                (2.0 * xm * s, 1.0 - s)
            } else {
                let q = fa / fc;
                let r = fb / fc;
                (
                    s * (2.0 * xm * q * (q - r) - (b - a) * (r - 1.0)),
                    (q - 1.0) * (r - 1.0) * (s - 1.0),
                )
            };
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();

            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < min1.min(min2) {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }

        a = b;
        fa = fb;
        b += if d.abs() > tol1 { d } else { tol1.copysign(xm) };
        fb = f(b);
    }

    Err(PropellerError::RootFinding(format!(
        "no convergence within {} iterations in [{}, {}]",
        max_iter, lower, upper
    ))
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_trigamma_known_values() {
        // ψ₁(1) = π²/6, ψ₁(1/2) = π²/2
        let pi2 = std::f64::consts::PI * std::f64::consts::PI;
        assert_relative_eq!(trigamma(1.0), pi2 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(trigamma(0.5), pi2 / 2.0, epsilon = 1e-12);
        assert_relative_eq!(trigamma(2.0), pi2 / 6.0 - 1.0, epsilon = 1e-12);
        assert!(trigamma(0.0).is_nan());
    }

    #[test]
    fn test_trigamma_inverse_round_trip() {
        for x in [0.01, 0.3, 1.0, 2.5, 17.0, 400.0] {
            let y = trigamma(x);
            assert_relative_eq!(trigamma_inverse(y).unwrap(), x, max_relative = 1e-8);
        }
    }

    #[test]
    fn test_trigamma_inverse_rejects_nonfinite() {
        let err = trigamma_inverse(f64::NAN).unwrap_err();
        assert!(crate::error::is_recoverable(&err));
        assert!(trigamma_inverse(-1.0).is_err());
    }

    #[test]
    fn test_brent_finds_root() {
        let root = brent_root(|x| x * x - 2.0, 0.0, 2.0, 1e-14, 100).unwrap();
        assert_relative_eq!(root, 2.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_brent_same_sign_bracket() {
        let err = brent_root(|x| x * x + 1.0, -1.0, 1.0, 1e-12, 100).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PropellerError>(),
            Some(PropellerError::RootFinding(msg)) if msg.contains("different signs")
        ));
    }
}

//! Inverse-gamma distribution utilities.

use vs_core::{Error, Result};
use statrs::function::gamma::ln_gamma;

/// Log-PDF of `InvGamma(shape, scale)` at `x > 0`.
///
/// `log p(x) = a ln b - ln Γ(a) - (a+1) ln x - b/x`
pub fn logpdf(x: f64, shape: f64, scale: f64) -> Result<f64> {
    if !(shape.is_finite() && shape > 0.0 && scale.is_finite() && scale > 0.0) {
        return Err(Error::Validation(format!(
            "inverse-gamma requires shape > 0 and scale > 0, got shape={} scale={}",
            shape, scale
        )));
    }
    if x <= 0.0 {
        return Ok(f64::NEG_INFINITY);
    }
    Ok(shape * scale.ln() - ln_gamma(shape) - (shape + 1.0) * x.ln() - scale / x)
}

/// NLL kernel `(a+1) ln x + b/x` and its derivative w.r.t. `x`.
#[inline]
pub fn nll_kernel(x: f64, shape: f64, scale: f64) -> (f64, f64) {
    let val = (shape + 1.0) * x.ln() + scale / x;
    let grad = (shape + 1.0) / x - scale / (x * x);
    (val, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mode() {
        // Mode of InvGamma(a, b) is b / (a + 1).
        let (a, b) = (2.0, 3.0);
        let mode = b / (a + 1.0);
        let lp_mode = logpdf(mode, a, b).unwrap();
        assert!(lp_mode > logpdf(mode * 1.1, a, b).unwrap());
        assert!(lp_mode > logpdf(mode * 0.9, a, b).unwrap());
        assert_relative_eq!(nll_kernel(mode, a, b).1, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid() {
        assert!(logpdf(1.0, 0.0, 1.0).is_err());
        assert!(logpdf(1.0, 1.0, -1.0).is_err());
        assert_eq!(logpdf(0.0, 1.0, 1.0).unwrap(), f64::NEG_INFINITY);
    }
}

//! Normal distribution utilities.

use crate::math::LN_SQRT_2PI;
use vs_core::{Error, Result};

/// Log-PDF of a Normal distribution `N(mu, sigma)` at `x`.
///
/// `log p(x) = -0.5 * ((x-mu)/sigma)^2 - ln(sigma) - ln(sqrt(2π))`
pub fn logpdf(x: f64, mu: f64, sigma: f64) -> Result<f64> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(Error::Validation(format!("sigma must be finite and > 0, got {}", sigma)));
    }
    let z = (x - mu) / sigma;
    Ok(-0.5 * z * z - sigma.ln() - LN_SQRT_2PI)
}

/// Negative log-density kernel `0.5 * ((x-mu)/sigma)^2` and its derivative w.r.t. `x`.
///
/// Used for priors where `sigma` is a fixed hyperparameter, so the normalising
/// constant drops out of the posterior.
#[inline]
pub fn nll_kernel(x: f64, mu: f64, sigma: f64) -> (f64, f64) {
    let z = (x - mu) / sigma;
    (0.5 * z * z, z / sigma)
}

/// Standard normal CDF via `erfc`, accurate in both tails.
pub fn cdf(x: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(-x / std::f64::consts::SQRT_2)
}

/// `ln Φ(x)`, finite for all finite `x`.
pub fn log_cdf(x: f64) -> f64 {
    if x > -30.0 {
        cdf(x).ln()
    } else {
        // Asymptotic Mills-ratio expansion; erfc underflows below here.
        let x2 = x * x;
        -0.5 * x2 - (-x).ln() - LN_SQRT_2PI + (1.0 - 1.0 / x2 + 3.0 / (x2 * x2)).ln()
    }
}

/// `ln φ(x)` for the standard normal.
#[inline]
pub fn log_std_pdf(x: f64) -> f64 {
    -0.5 * x * x - LN_SQRT_2PI
}

/// Standard normal quantile `Φ⁻¹(p)` for `p` in `(0, 1)`.
pub fn quantile(p: f64) -> f64 {
    -std::f64::consts::SQRT_2 * statrs::function::erf::erfc_inv(2.0 * p)
}

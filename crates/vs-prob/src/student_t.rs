//! Student-t and half-t distribution utilities.

use vs_core::{Error, Result};
use statrs::function::gamma::ln_gamma;

const LN_PI: f64 = 1.144_729_885_849_400_2;

fn validate(sigma: f64, nu: f64) -> Result<()> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(Error::Validation(format!("sigma must be finite and > 0, got {}", sigma)));
    }
    if !nu.is_finite() || nu <= 0.0 {
        return Err(Error::Validation(format!("nu must be finite and > 0, got {}", nu)));
    }
    Ok(())
}

/// Log-PDF of a Student-t distribution at `x` with location `mu`, scale `sigma`, and dof `nu`.
pub fn logpdf(x: f64, mu: f64, sigma: f64, nu: f64) -> Result<f64> {
    validate(sigma, nu)?;
    let z = (x - mu) / sigma;
    let a = ln_gamma(0.5 * (nu + 1.0)) - ln_gamma(0.5 * nu);
    let b = -0.5 * (nu.ln() + LN_PI);
    let d = -0.5 * (nu + 1.0) * (z * z / nu).ln_1p();
    Ok(a + b - sigma.ln() + d)
}

/// Log-PDF of a half-t distribution on `[0, inf)` (Student-t folded at zero).
pub fn half_logpdf(x: f64, sigma: f64, nu: f64) -> Result<f64> {
    if x < 0.0 {
        return Ok(f64::NEG_INFINITY);
    }
    Ok(std::f64::consts::LN_2 + logpdf(x, 0.0, sigma, nu)?)
}

/// NLL kernel `(nu+1)/2 * ln(1 + z^2/nu)` with `z = (x-mu)/sigma`, and its derivative w.r.t. `x`.
///
/// Drops the terms constant in `x`; for fixed `sigma` and `nu` this is the prior
/// contribution to a posterior NLL.
#[inline]
pub fn nll_kernel(x: f64, mu: f64, sigma: f64, nu: f64) -> (f64, f64) {
    let d = x - mu;
    let s2nu = sigma * sigma * nu;
    let val = 0.5 * (nu + 1.0) * (d * d / s2nu).ln_1p();
    let grad = (nu + 1.0) * d / (s2nu + d * d);
    (val, grad)
}

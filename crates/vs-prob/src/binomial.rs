//! Binomial distribution utilities.

use crate::link::Link;
use vs_core::{Error, Result};
use statrs::function::gamma::ln_gamma;

/// `ln C(n, k)` via log-gamma.
pub fn ln_choose(n: u64, k: u64) -> f64 {
    if k > n {
        return f64::NEG_INFINITY;
    }
    ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)
}

/// Log-PMF of a Binomial distribution `Binom(n, p)` at count `k`.
pub fn logpmf(k: u64, n: u64, p: f64) -> Result<f64> {
    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
        return Err(Error::Validation(format!("p must be finite and in [0,1], got {}", p)));
    }
    if k > n {
        return Err(Error::Validation(format!("k must be <= n, got k={} n={}", k, n)));
    }
    if p == 0.0 {
        return Ok(if k == 0 { 0.0 } else { f64::NEG_INFINITY });
    }
    if p == 1.0 {
        return Ok(if k == n { 0.0 } else { f64::NEG_INFINITY });
    }
    let (kf, nf) = (k as f64, n as f64);
    Ok(ln_choose(n, k) + kf * p.ln() + (nf - kf) * (-p).ln_1p())
}

/// Log-PMF of `Binom(n, g⁻¹(eta))` for a linear predictor `eta` under `link`.
///
/// `k` may be fractional (projection pseudo-responses); the binomial coefficient is
/// only included when `k` is integral.
pub fn logpmf_link(k: f64, n: f64, eta: f64, link: Link) -> f64 {
    let (ln_mu, ln_1m) = link.log_probs(eta);
    let mut lp = 0.0;
    if k > 0.0 {
        lp += k * ln_mu;
    }
    if n - k > 0.0 {
        lp += (n - k) * ln_1m;
    }
    if k.fract() == 0.0 && n.fract() == 0.0 && k >= 0.0 && k <= n {
        lp += ln_choose(n as u64, k as u64);
    }
    lp
}

/// Negative log-likelihood kernel (no binomial coefficient) and `d/d eta`.
#[inline]
pub fn nll_link_and_grad(k: f64, n: f64, eta: f64, link: Link) -> (f64, f64) {
    let (ln_mu, ln_1m) = link.log_probs(eta);
    let (d_mu, d_1m) = link.dlog_probs(eta);
    let mut val = 0.0;
    let mut grad = 0.0;
    if k > 0.0 {
        val -= k * ln_mu;
        grad -= k * d_mu;
    }
    if n - k > 0.0 {
        val -= (n - k) * ln_1m;
        grad -= (n - k) * d_1m;
    }
    (val, grad)
}

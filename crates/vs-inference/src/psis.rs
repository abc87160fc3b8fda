//! Pareto-smoothed importance sampling (Vehtari, Gelman & Gabry 2017).
//!
//! The largest importance ratios of each observation are replaced by order
//! statistics of a generalized Pareto fit (Zhang & Stephens 2009 with a weakly
//! informative prior on the shape). The fitted shape `k_hat` measures how reliable
//! the resulting estimate is.

use serde::{Deserialize, Serialize};
use std::fmt;
use vs_core::{Error, Result};
use vs_prob::math::log_sum_exp;

/// Tails shorter than this are not smoothed.
pub const MIN_TAIL_LEN: usize = 5;

const GPD_PRIOR: f64 = 3.0;
const GPD_MIN_GRID: usize = 30;

/// PSIS settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsisConfig {
    /// Observations with `k_hat` above this are flagged.
    pub k_threshold: f64,
    /// Estimate relative MCMC efficiency from the chains (otherwise `r_eff = 1`).
    pub use_r_eff: bool,
}

impl Default for PsisConfig {
    fn default() -> Self {
        Self { k_threshold: 0.7, use_r_eff: true }
    }
}

impl PsisConfig {
    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.k_threshold.is_finite() && self.k_threshold > 0.0) {
            return Err(Error::Validation(format!(
                "k_threshold must be finite and > 0, got {}",
                self.k_threshold
            )));
        }
        Ok(())
    }
}

/// Smoothed weights of one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct PsisResult {
    /// Normalized log weights (`logsumexp == 0`).
    pub log_weights: Vec<f64>,
    /// Estimated Pareto shape; `inf` when the tail was too short to fit.
    pub pareto_k: f64,
    /// Number of smoothed draws.
    pub tail_len: usize,
}

/// Tail length `ceil(min(0.2 S, 3 sqrt(S / r_eff)))`.
pub fn tail_length(n_draws: usize, r_eff: f64) -> usize {
    let s = n_draws as f64;
    (0.2 * s).min(3.0 * (s / r_eff).sqrt()).ceil() as usize
}

/// Pareto-smooth the log importance ratios of one observation.
pub fn psis(log_ratios: &[f64], r_eff: f64) -> Result<PsisResult> {
    let s = log_ratios.len();
    if s == 0 {
        return Err(Error::Validation("PSIS needs at least one draw".into()));
    }
    if log_ratios.iter().any(|r| r.is_nan() || *r == f64::INFINITY) {
        return Err(Error::Computation("non-finite log importance ratio".into()));
    }
    let r_eff = if r_eff.is_finite() && r_eff > 0.0 { r_eff } else { 1.0 };
    let max = log_ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut lw: Vec<f64> = log_ratios.iter().map(|&r| r - max).collect();

    let m = tail_length(s, r_eff);
    let mut k = f64::INFINITY;
    if m >= MIN_TAIL_LEN && m < s {
        let mut order: Vec<usize> = (0..s).collect();
        order.sort_by(|&a, &b| lw[a].total_cmp(&lw[b]));
        let tail_idx = &order[s - m..];
        let tail: Vec<f64> = tail_idx.iter().map(|&i| lw[i]).collect();
        let cutoff = lw[order[s - m - 1]];
        if tail[m - 1] - tail[0] < f64::EPSILON / 100.0 {
            // Equal ratios in the tail: nothing heavy to smooth.
            k = 0.0;
        } else {
            let exp_cutoff = cutoff.exp();
            let exceedances: Vec<f64> = tail.iter().map(|&t| t.exp() - exp_cutoff).collect();
            let (k_hat, sigma) = gpdfit(&exceedances);
            if k_hat.is_finite() && sigma > 0.0 {
                for (j, &i) in tail_idx.iter().enumerate() {
                    let p = (j as f64 + 0.5) / m as f64;
                    lw[i] = (qgpd(p, k_hat, sigma) + exp_cutoff).ln();
                }
            }
            k = k_hat;
        }
    }

    // Truncate at the largest raw ratio (0 after the shift).
    for w in lw.iter_mut() {
        if *w > 0.0 {
            *w = 0.0;
        }
    }
    let norm = log_sum_exp(&lw);
    for w in lw.iter_mut() {
        *w -= norm;
    }
    Ok(PsisResult { log_weights: lw, pareto_k: k, tail_len: m })
}

/// Fit a generalized Pareto distribution to sorted (ascending) positive exceedances.
///
/// Returns `(k, sigma)`. `k` includes the shrinkage `(n k + 5) / (n + 10)` toward 0.5.
pub fn gpdfit(x: &[f64]) -> (f64, f64) {
    let n = x.len();
    if n == 0 {
        return (f64::INFINITY, f64::NAN);
    }
    let nf = n as f64;
    let m = GPD_MIN_GRID + nf.sqrt().floor() as usize;
    let q1 = ((nf / 4.0 + 0.5).floor() as usize).clamp(1, n) - 1;
    let xstar = x[q1];
    let xmax = x[n - 1];
    if !(xstar > 0.0 && xmax > 0.0) {
        return (f64::INFINITY, f64::NAN);
    }

    let theta: Vec<f64> = (1..=m)
        .map(|j| 1.0 / xmax + (1.0 - (m as f64 / (j as f64 - 0.5)).sqrt()) / GPD_PRIOR / xstar)
        .collect();
    let l_theta: Vec<f64> = theta.iter().map(|&t| nf * profile_loglik(t, x)).collect();
    let norm = log_sum_exp(&l_theta);
    let theta_hat: f64 = theta.iter().zip(&l_theta).map(|(&t, &l)| t * (l - norm).exp()).sum();

    let k = x.iter().map(|&xi| (-theta_hat * xi).ln_1p()).sum::<f64>() / nf;
    let sigma = -k / theta_hat;
    let k = (k * nf + 0.5 * 10.0) / (nf + 10.0);
    if k.is_nan() { (f64::INFINITY, sigma) } else { (k, sigma) }
}

fn profile_loglik(theta: f64, x: &[f64]) -> f64 {
    let a = -theta;
    let k = x.iter().map(|&xi| (a * xi).ln_1p()).sum::<f64>() / x.len() as f64;
    let v = (a / k).ln() - k - 1.0;
    if v.is_nan() { f64::NEG_INFINITY } else { v }
}

/// Generalized Pareto quantile function (location 0).
pub fn qgpd(p: f64, k: f64, sigma: f64) -> f64 {
    if !(sigma > 0.0) {
        return f64::NAN;
    }
    if k.abs() < 1e-12 {
        return -sigma * (-p).ln_1p();
    }
    sigma * (-k * (-p).ln_1p()).exp_m1() / k
}

/// Reliability category of a Pareto `k_hat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParetoKCategory {
    /// `k <= 0.5`
    Good,
    /// `0.5 < k <= 0.7`
    Ok,
    /// `0.7 < k <= 1`
    Bad,
    /// `k > 1` (or not estimable)
    VeryBad,
}

impl ParetoKCategory {
    /// All categories in ascending order.
    pub const ALL: [ParetoKCategory; 4] =
        [ParetoKCategory::Good, ParetoKCategory::Ok, ParetoKCategory::Bad, ParetoKCategory::VeryBad];

    /// Category of `k`.
    pub fn of(k: f64) -> Self {
        if k <= 0.5 {
            ParetoKCategory::Good
        } else if k <= 0.7 {
            ParetoKCategory::Ok
        } else if k <= 1.0 {
            ParetoKCategory::Bad
        } else {
            ParetoKCategory::VeryBad
        }
    }

    /// Range label used in reports.
    pub fn label(self) -> &'static str {
        match self {
            ParetoKCategory::Good => "(-Inf, 0.5]",
            ParetoKCategory::Ok => "(0.5, 0.7]",
            ParetoKCategory::Bad => "(0.7, 1]",
            ParetoKCategory::VeryBad => "(1, Inf)",
        }
    }
}

impl fmt::Display for ParetoKCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParetoKCategory::Good => "good",
            ParetoKCategory::Ok => "ok",
            ParetoKCategory::Bad => "bad",
            ParetoKCategory::VeryBad => "very bad",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, StandardNormal};

    fn gpd_sample(n: usize, k: f64, sigma: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x: Vec<f64> = (0..n)
            .map(|_| {
                let u: f64 = rng.random();
                sigma * ((1.0 - u).powf(-k) - 1.0) / k
            })
            .collect();
        x.sort_by(f64::total_cmp);
        x
    }

    #[test]
    fn test_tail_length() {
        assert_eq!(tail_length(4000, 1.0), 190);
        assert_eq!(tail_length(100, 1.0), 20);
        assert_eq!(tail_length(20, 1.0), 4);
        assert!(tail_length(4000, 0.1) > tail_length(4000, 1.0));
    }

    #[test]
    fn test_qgpd_inverts_cdf() {
        let (k, sigma) = (0.4, 2.0);
        for &p in &[0.1, 0.5, 0.9] {
            let q = qgpd(p, k, sigma);
            let cdf = 1.0 - (1.0 + k * q / sigma).powf(-1.0 / k);
            assert_relative_eq!(cdf, p, epsilon = 1e-12);
        }
        assert_relative_eq!(qgpd(0.5, 0.0, 1.0), 2f64.ln(), epsilon = 1e-12);
        assert!(qgpd(0.5, 0.1, -1.0).is_nan());
    }

    #[test]
    fn test_gpdfit_recovers_shape() {
        for &(k, seed) in &[(0.2, 1_u64), (0.7, 2)] {
            let x = gpd_sample(5000, k, 1.5, seed);
            let (k_hat, sigma_hat) = gpdfit(&x);
            assert!((k_hat - k).abs() < 0.08, "k={} k_hat={}", k, k_hat);
            assert!((sigma_hat - 1.5).abs() < 0.2, "sigma_hat={}", sigma_hat);
        }
    }

    #[test]
    fn test_psis_light_tail_has_small_k() {
        let mut rng = StdRng::seed_from_u64(7);
        // Ratios of N(0, 1) draws under a slightly wider target: bounded weights.
        let ratios: Vec<f64> = (0..4000)
            .map(|_| {
                let z: f64 = StandardNormal.sample(&mut rng);
                0.1 * z * z / 2.0 - 0.5
            })
            .collect();
        let r = psis(&ratios, 1.0).unwrap();
        assert_eq!(r.tail_len, 190);
        assert!(r.pareto_k < 0.5, "k = {}", r.pareto_k);
        assert_relative_eq!(log_sum_exp(&r.log_weights), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_psis_heavy_tail_is_flagged() {
        let mut rng = StdRng::seed_from_u64(8);
        // exp(ratio) ~ Pareto with shape 1/k = 1/1.2.
        let ratios: Vec<f64> = (0..2000)
            .map(|_| {
                let u: f64 = rng.random();
                -1.2 * (1.0 - u).ln()
            })
            .collect();
        let r = psis(&ratios, 1.0).unwrap();
        assert!(r.pareto_k > 0.7, "k = {}", r.pareto_k);
    }

    #[test]
    fn test_psis_keeps_body_and_order() {
        let mut rng = StdRng::seed_from_u64(9);
        let ratios: Vec<f64> = (0..1000)
            .map(|_| {
                let z: f64 = StandardNormal.sample(&mut rng);
                3.0 * z
            })
            .collect();
        let r = psis(&ratios, 1.0).unwrap();
        let mut order: Vec<usize> = (0..ratios.len()).collect();
        order.sort_by(|&a, &b| ratios[a].total_cmp(&ratios[b]));
        // Untouched body keeps its relative weights.
        let (a, b) = (order[0], order[1]);
        assert_relative_eq!(
            r.log_weights[b] - r.log_weights[a],
            ratios[b] - ratios[a],
            epsilon = 1e-9
        );
        for w in order.windows(2) {
            assert!(r.log_weights[w[0]] <= r.log_weights[w[1]] + 1e-12);
        }
        // Truncation: no draw outweighs the largest raw ratio.
        let top = *order.last().unwrap();
        let max_lw = r.log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_relative_eq!(max_lw, r.log_weights[top], epsilon = 1e-12);
        assert!(r.pareto_k.is_finite());
    }

    #[test]
    fn test_psis_short_and_constant_inputs() {
        let r = psis(&[0.1, 0.2, 0.3], 1.0).unwrap();
        assert!(r.pareto_k.is_infinite());
        assert_relative_eq!(log_sum_exp(&r.log_weights), 0.0, epsilon = 1e-12);

        let r = psis(&vec![-1.0; 500], 1.0).unwrap();
        assert_eq!(r.pareto_k, 0.0);
        assert_relative_eq!(r.log_weights[0], -(500f64).ln(), epsilon = 1e-12);

        assert!(psis(&[], 1.0).is_err());
        assert!(psis(&[0.0, f64::NAN], 1.0).is_err());
    }

    #[test]
    fn test_pareto_k_categories() {
        assert_eq!(ParetoKCategory::of(0.2), ParetoKCategory::Good);
        assert_eq!(ParetoKCategory::of(0.6), ParetoKCategory::Ok);
        assert_eq!(ParetoKCategory::of(0.9), ParetoKCategory::Bad);
        assert_eq!(ParetoKCategory::of(f64::INFINITY), ParetoKCategory::VeryBad);
        assert_eq!(ParetoKCategory::VeryBad.to_string(), "very bad");
    }

    #[test]
    fn test_config_validation() {
        assert!(PsisConfig::default().validate().is_ok());
        assert!(PsisConfig { k_threshold: -1.0, ..Default::default() }.validate().is_err());
    }
}

//! MCMC diagnostics: rank-normalized split R-hat, bulk/tail ESS, E-BFMI and
//! quality gates (Vehtari et al. 2021, Stan conventions).

use crate::chain::SamplerResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use vs_prob::math::quantile_sorted;
use vs_prob::normal;

/// Per-run diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsResult {
    /// Rank-normalized folded split R-hat per parameter.
    pub r_hat: Vec<f64>,
    /// Bulk ESS per parameter.
    pub ess_bulk: Vec<f64>,
    /// Tail ESS per parameter.
    pub ess_tail: Vec<f64>,
    /// Number of divergent post-warmup transitions.
    pub n_divergent: usize,
    /// Fraction of divergent post-warmup transitions.
    pub divergence_rate: f64,
    /// Fraction of transitions that hit the maximum tree depth.
    pub max_treedepth_rate: f64,
    /// E-BFMI per chain.
    pub ebfmi: Vec<f64>,
    /// Mean post-warmup acceptance statistic per chain.
    pub mean_accept_stat: Vec<f64>,
}

/// Overall status of a sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
    /// All gates passed.
    Ok,
    /// Some warning gates triggered.
    Warn,
    /// At least one failure gate triggered.
    Fail,
}

impl fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityStatus::Ok => write!(f, "ok"),
            QualityStatus::Warn => write!(f, "warn"),
            QualityStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Thresholds for the sampling quality gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGates {
    /// R-hat/ESS/E-BFMI gates need at least this many chains.
    pub min_chains: usize,
    /// ... and this many draws per chain.
    pub min_draws_per_chain: usize,
    /// Warn above this R-hat.
    pub max_rhat_warn: f64,
    /// Fail above this R-hat.
    pub max_rhat_fail: f64,
    /// Warn above this divergence rate (0 = warn on any divergence).
    pub max_divergence_rate_warn: f64,
    /// Fail above this divergence rate.
    pub max_divergence_rate_fail: f64,
    /// Warn above this max-treedepth hit rate.
    pub max_treedepth_rate_warn: f64,
    /// Warn when bulk/tail ESS is below this fraction of total draws.
    pub min_ess_frac_warn: f64,
    /// Fail when bulk/tail ESS is below this fraction of total draws.
    pub min_ess_frac_fail: f64,
    /// Warn below this E-BFMI.
    pub min_ebfmi_warn: f64,
    /// Fail when a chain's mean acceptance statistic is this far below the target.
    pub max_accept_shortfall: f64,
}

impl Default for QualityGates {
    fn default() -> Self {
        Self {
            min_chains: 2,
            min_draws_per_chain: 50,
            max_rhat_warn: 1.1,
            max_rhat_fail: 1.3,
            max_divergence_rate_warn: 0.0,
            max_divergence_rate_fail: 0.05,
            max_treedepth_rate_warn: 0.05,
            min_ess_frac_warn: 0.1,
            min_ess_frac_fail: 0.01,
            min_ebfmi_warn: 0.3,
            max_accept_shortfall: 0.15,
        }
    }
}

/// Outcome of the quality gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySummary {
    /// Aggregated status.
    pub status: QualityStatus,
    /// Warning reasons.
    pub warnings: Vec<String>,
    /// Failure reasons.
    pub failures: Vec<String>,
    /// Whether the R-hat/ESS/E-BFMI gates were active.
    pub enabled: bool,
    /// Max R-hat over parameters.
    pub max_r_hat: f64,
    /// Min bulk ESS over parameters.
    pub min_ess_bulk: f64,
    /// Min tail ESS over parameters.
    pub min_ess_tail: f64,
}

fn finite_max(v: &[f64]) -> f64 {
    v.iter().copied().filter(|x| x.is_finite()).fold(f64::NEG_INFINITY, f64::max)
}

fn finite_min(v: &[f64]) -> f64 {
    v.iter().copied().filter(|x| x.is_finite()).fold(f64::INFINITY, f64::min)
}

/// Apply `gates` to `diag` for a run of `n_chains x n_samples` draws tuned to `target_accept`.
pub fn quality_summary(
    diag: &DiagnosticsResult,
    n_chains: usize,
    n_samples: usize,
    target_accept: f64,
    gates: &QualityGates,
) -> QualitySummary {
    let enabled = n_chains >= gates.min_chains && n_samples >= gates.min_draws_per_chain;
    let total = (n_chains * n_samples) as f64;
    let max_r_hat = finite_max(&diag.r_hat);
    let min_ess_bulk = finite_min(&diag.ess_bulk);
    let min_ess_tail = finite_min(&diag.ess_tail);
    let mut warnings = Vec::new();
    let mut failures = Vec::new();

    if diag.divergence_rate > gates.max_divergence_rate_fail {
        failures.push(format!(
            "divergence rate {:.3} exceeds {}",
            diag.divergence_rate, gates.max_divergence_rate_fail
        ));
    } else if diag.divergence_rate > gates.max_divergence_rate_warn {
        warnings.push(format!("{} divergent transitions after warmup", diag.n_divergent));
    }
    if diag.max_treedepth_rate > gates.max_treedepth_rate_warn {
        warnings.push(format!(
            "{:.1}% of transitions hit the maximum tree depth",
            100.0 * diag.max_treedepth_rate
        ));
    }
    for (c, &a) in diag.mean_accept_stat.iter().enumerate() {
        if !a.is_finite() {
            continue;
        }
        if a < target_accept - gates.max_accept_shortfall {
            failures.push(format!(
                "chain {}: mean acceptance {:.3} far below target {}",
                c, a, target_accept
            ));
        } else if a > target_accept + gates.max_accept_shortfall {
            warnings.push(format!(
                "chain {}: mean acceptance {:.3} far above target {}",
                c, a, target_accept
            ));
        }
    }

    if !enabled {
        warnings.push("run too short for R-hat/ESS gates".to_string());
    } else {
        if diag.r_hat.iter().any(|r| r.is_nan()) && max_r_hat == f64::NEG_INFINITY {
            failures.push("R-hat not available".to_string());
        } else if max_r_hat > gates.max_rhat_fail {
            failures.push(format!("max R-hat {:.3} exceeds {}", max_r_hat, gates.max_rhat_fail));
        } else if max_r_hat > gates.max_rhat_warn {
            warnings.push(format!("max R-hat {:.3} exceeds {}", max_r_hat, gates.max_rhat_warn));
        }
        let min_ess = min_ess_bulk.min(min_ess_tail);
        if min_ess < gates.min_ess_frac_fail * total {
            failures.push(format!("min ESS {:.0} below {} of draws", min_ess, gates.min_ess_frac_fail));
        } else if min_ess < gates.min_ess_frac_warn * total {
            warnings.push(format!("min ESS {:.0} below {} of draws", min_ess, gates.min_ess_frac_warn));
        }
        for (c, &e) in diag.ebfmi.iter().enumerate() {
            if e.is_finite() && e < gates.min_ebfmi_warn {
                warnings.push(format!("chain {}: E-BFMI {:.3} below {}", c, e, gates.min_ebfmi_warn));
            }
        }
    }

    let status = if !failures.is_empty() {
        QualityStatus::Fail
    } else if !warnings.is_empty() {
        QualityStatus::Warn
    } else {
        QualityStatus::Ok
    };
    QualitySummary { status, warnings, failures, enabled, max_r_hat, min_ess_bulk, min_ess_tail }
}

/// Truncate all chains to the shortest length.
fn equalize<'a>(chains: &[&'a [f64]]) -> Vec<&'a [f64]> {
    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0);
    chains.iter().map(|c| &c[..n]).collect()
}

fn split<'a>(chains: &[&'a [f64]]) -> Vec<&'a [f64]> {
    let mut out = Vec::with_capacity(2 * chains.len());
    for c in equalize(chains) {
        let half = c.len() / 2;
        out.push(&c[..half]);
        out.push(&c[c.len() - half..]);
    }
    out
}

fn mean_var(c: &[f64]) -> (f64, f64) {
    (vs_prob::math::mean(c), vs_prob::math::sample_variance(c))
}

/// Classic (non-rank) split R-hat.
pub fn r_hat(chains: &[&[f64]]) -> f64 {
    let halves = split(chains);
    let n = halves.first().map_or(0, |c| c.len());
    if halves.len() < 2 || n < 2 {
        return f64::NAN;
    }
    let stats: Vec<(f64, f64)> = halves.iter().map(|c| mean_var(c)).collect();
    let means: Vec<f64> = stats.iter().map(|s| s.0).collect();
    let w = stats.iter().map(|s| s.1).sum::<f64>() / stats.len() as f64;
    let b = n as f64 * vs_prob::math::sample_variance(&means);
    if w <= 1e-300 {
        return f64::NAN;
    }
    let var_plus = (n as f64 - 1.0) / n as f64 * w + b / n as f64;
    (var_plus / w).sqrt()
}

/// Normal scores of pooled fractional ranks (ties get average ranks).
fn rank_normalize(chains: &[&[f64]]) -> Vec<Vec<f64>> {
    let mut flat: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(ci, c)| c.iter().enumerate().map(move |(ti, &x)| (x, ci, ti)))
        .collect();
    flat.sort_by(|a, b| a.0.total_cmp(&b.0));
    let s = flat.len() as f64;
    let mut out: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut i = 0;
    while i < flat.len() {
        let mut j = i + 1;
        while j < flat.len() && flat[j].0 == flat[i].0 {
            j += 1;
        }
        let rank = 0.5 * ((i + 1) as f64 + j as f64);
        let z = normal::quantile((rank - 0.375) / (s + 0.25));
        for &(_, ci, ti) in &flat[i..j] {
            out[ci][ti] = z;
        }
        i = j;
    }
    out
}

fn as_refs(v: &[Vec<f64>]) -> Vec<&[f64]> {
    v.iter().map(|c| c.as_slice()).collect()
}

/// Rank-normalized folded split R-hat: max of bulk and folded (tail) R-hat.
pub fn rank_normalized_rhat(chains: &[&[f64]]) -> f64 {
    let chains = equalize(chains);
    if chains.is_empty() || chains[0].len() < 4 {
        return f64::NAN;
    }
    let bulk = r_hat(&as_refs(&rank_normalize(&chains)));
    let mut pooled: Vec<f64> = chains.iter().flat_map(|c| c.iter().copied()).collect();
    pooled.sort_by(f64::total_cmp);
    let med = quantile_sorted(&pooled, 0.5);
    let folded: Vec<Vec<f64>> =
        chains.iter().map(|c| c.iter().map(|&x| (x - med).abs()).collect()).collect();
    let tail = r_hat(&as_refs(&rank_normalize(&as_refs(&folded))));
    match (bulk.is_nan(), tail.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => tail,
        (false, true) => bulk,
        (false, false) => bulk.max(tail),
    }
}

/// Biased autocovariance of one chain for lags `0..n`, stopping at `max_lag`.
fn autocovariance(c: &[f64], max_lag: usize) -> Vec<f64> {
    let n = c.len();
    let m = vs_prob::math::mean(c);
    let centered: Vec<f64> = c.iter().map(|x| x - m).collect();
    (0..=max_lag.min(n.saturating_sub(1)))
        .map(|t| centered[..n - t].iter().zip(&centered[t..]).map(|(a, b)| a * b).sum::<f64>() / n as f64)
        .collect()
}

/// ESS with Geyer's initial monotone sequence (Stan's estimator), no splitting.
///
/// Constant input returns the total number of draws.
pub fn ess(chains: &[&[f64]]) -> f64 {
    let chains = equalize(chains);
    let m = chains.len();
    let n = chains.first().map_or(0, |c| c.len());
    if m == 0 || n < 4 {
        return 0.0;
    }
    let total = (m * n) as f64;
    let acov: Vec<Vec<f64>> = chains.iter().map(|c| autocovariance(c, n - 1)).collect();
    let nf = n as f64;
    let chain_var: Vec<f64> = acov.iter().map(|a| a[0] * nf / (nf - 1.0)).collect();
    let mean_var = chain_var.iter().sum::<f64>() / m as f64;
    let means: Vec<f64> = chains.iter().map(|c| vs_prob::math::mean(c)).collect();
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        var_plus += vs_prob::math::sample_variance(&means);
    }
    if !(var_plus.is_finite() && var_plus > 1e-300) {
        return total;
    }
    let acov_mean = |t: usize| acov.iter().map(|a| a[t]).sum::<f64>() / m as f64;
    let rho_at = |t: usize| 1.0 - (mean_var - acov_mean(t)) / var_plus;

    let mut rho = vec![0.0; n + 1];
    rho[0] = 1.0;
    let mut even = 1.0;
    let mut odd = rho_at(1);
    rho[1] = odd;
    let mut s = 1;
    while s + 4 < n && even + odd > 0.0 {
        even = rho_at(s + 1);
        odd = rho_at(s + 2);
        if even + odd >= 0.0 {
            rho[s + 1] = even;
            rho[s + 2] = odd;
        }
        s += 2;
    }
    let max_s = s;
    if rho[max_s] > 0.0 {
        rho[max_s + 1] = rho[max_s];
    }
    let mut k = 1;
    while k + 3 <= max_s {
        if rho[k + 1] + rho[k + 2] > rho[k - 1] + rho[k] {
            rho[k + 1] = 0.5 * (rho[k - 1] + rho[k]);
            rho[k + 2] = rho[k + 1];
        }
        k += 2;
    }
    let tau = -1.0 + 2.0 * rho[..max_s].iter().sum::<f64>() + rho[max_s + 1];
    let tau = tau.max(1.0 / total.log10());
    total / tau
}

/// Bulk ESS: ESS of rank-normalized split chains.
pub fn ess_bulk(chains: &[&[f64]]) -> f64 {
    let halves = split(chains);
    ess(&as_refs(&rank_normalize(&halves)))
}

/// Tail ESS: min of ESS of the 5% / 95% quantile indicator chains.
pub fn ess_tail(chains: &[&[f64]]) -> f64 {
    let halves = split(chains);
    let mut pooled: Vec<f64> = halves.iter().flat_map(|c| c.iter().copied()).collect();
    if pooled.is_empty() {
        return 0.0;
    }
    pooled.sort_by(f64::total_cmp);
    let q05 = quantile_sorted(&pooled, 0.05);
    let q95 = quantile_sorted(&pooled, 0.95);
    let indicator = |pred: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        halves.iter().map(|c| c.iter().map(|&x| if pred(x) { 1.0 } else { 0.0 }).collect()).collect()
    };
    let lower = indicator(&|x| x <= q05);
    let upper = indicator(&|x| x <= q95);
    ess(&as_refs(&lower)).min(ess(&as_refs(&upper)))
}

/// E-BFMI of one chain: `sum (E_t - E_{t-1})^2 / sum (E_t - mean E)^2`.
pub fn ebfmi(energies: &[f64]) -> f64 {
    if energies.len() < 4 {
        return f64::NAN;
    }
    let m = vs_prob::math::mean(energies);
    let den: f64 = energies.iter().map(|e| (e - m).powi(2)).sum();
    if den <= 1e-300 {
        return f64::NAN;
    }
    let num: f64 = energies.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
    num / den
}

/// Compute diagnostics for every parameter of a multi-chain run (constrained draws).
pub fn compute_diagnostics(result: &SamplerResult) -> DiagnosticsResult {
    let n_params = result.param_names.len();
    let mut r_hat = Vec::with_capacity(n_params);
    let mut ess_b = Vec::with_capacity(n_params);
    let mut ess_t = Vec::with_capacity(n_params);
    for p in 0..n_params {
        let draws = result.param_draws(p);
        let refs = as_refs(&draws);
        r_hat.push(rank_normalized_rhat(&refs));
        ess_b.push(ess_bulk(&refs));
        ess_t.push(ess_tail(&refs));
    }

    let total: usize = result.chains.iter().map(|c| c.divergences.len()).sum();
    let n_divergent = result.chains.iter().map(|c| c.n_divergent()).sum::<usize>();
    let n_max_depth: usize = result
        .chains
        .iter()
        .map(|c| c.tree_depths.iter().filter(|&&d| d >= c.max_treedepth).count())
        .sum();
    let rate = |k: usize| if total > 0 { k as f64 / total as f64 } else { 0.0 };

    DiagnosticsResult {
        r_hat,
        ess_bulk: ess_b,
        ess_tail: ess_t,
        n_divergent,
        divergence_rate: rate(n_divergent),
        max_treedepth_rate: rate(n_max_depth),
        ebfmi: result.chains.iter().map(|c| ebfmi(&c.energies)).collect(),
        mean_accept_stat: result.chains.iter().map(|c| vs_prob::math::mean(&c.accept_stats)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, StandardNormal};

    fn iid(seed: u64, n: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| StandardNormal.sample(&mut rng)).collect()
    }

    fn random_walk(seed: u64, n: usize) -> Vec<f64> {
        let mut x = 0.0;
        iid(seed, n)
            .into_iter()
            .map(|e| {
                x += 0.05 * e;
                x
            })
            .collect()
    }

    #[test]
    fn test_rhat_well_mixed_and_diverged() {
        let (a, b) = (iid(1, 500), iid(2, 500));
        assert!(rank_normalized_rhat(&[&a, &b]) < 1.02);
        assert!(r_hat(&[&a, &b]) < 1.02);
        let c: Vec<f64> = (0..200).map(|i| i as f64 * 0.01).collect();
        let d: Vec<f64> = (0..200).map(|i| 10.0 + i as f64 * 0.01).collect();
        assert!(rank_normalized_rhat(&[&c, &d]) > 1.5);
    }

    #[test]
    fn test_rhat_detects_scale_difference() {
        // Same location, different scale: only the folded part notices.
        let a = iid(3, 1000);
        let b: Vec<f64> = iid(4, 1000).into_iter().map(|x| 5.0 * x).collect();
        assert!(rank_normalized_rhat(&[&a, &b]) > 1.1);
    }

    #[test]
    fn test_ess_iid_close_to_n_and_random_walk_small() {
        let a = iid(5, 1000);
        let b = iid(6, 1000);
        let e = ess_bulk(&[&a, &b]);
        assert!(e > 1400.0 && e < 2600.0, "bulk ess {}", e);
        assert!(ess_tail(&[&a, &b]) > 1000.0);
        let rw = random_walk(7, 1000);
        assert!(ess_bulk(&[&rw]) < 100.0);
    }

    #[test]
    fn test_ess_constant_chain() {
        let c = vec![1.0; 100];
        assert_eq!(ess(&[&c]), 100.0);
    }

    #[test]
    fn test_ebfmi_iid() {
        let e = iid(8, 2000);
        let v = ebfmi(&e);
        assert!((v - 2.0).abs() < 0.2, "ebfmi {}", v);
    }

    fn chain_with(depths: Vec<usize>, divergent: Vec<bool>, accept: f64) -> Chain {
        let n = depths.len();
        let mut c = Chain::with_capacity(n, 3);
        c.tree_depths = depths;
        c.divergences = divergent;
        c.accept_stats = vec![accept; n];
        c.energies = iid(9, n);
        c.draws_constrained = iid(10, n).into_iter().map(|x| vec![x]).collect();
        c.draws_unconstrained = c.draws_constrained.clone();
        c.n_leapfrog = vec![1; n];
        c
    }

    #[test]
    fn test_rates_and_accept_gate() {
        let r = SamplerResult {
            chains: vec![chain_with(vec![0, 1, 2, 3, 3], vec![false, true, false, false, false], 0.5)],
            param_names: vec!["x".into()],
            n_warmup: 0,
            n_samples: 5,
        };
        let d = compute_diagnostics(&r);
        assert!((d.max_treedepth_rate - 0.4).abs() < 1e-12);
        assert_eq!(d.n_divergent, 1);
        let q = quality_summary(&d, 1, 5, 0.8, &QualityGates::default());
        assert_eq!(q.status, QualityStatus::Fail);
        assert!(!q.enabled);
        assert!(q.failures.iter().any(|f| f.contains("acceptance")));
        assert!(q.failures.iter().any(|f| f.contains("divergence")));
    }

    #[test]
    fn test_clean_run_is_ok() {
        let mk = |seed| {
            let mut c = chain_with(vec![2; 400], vec![false; 400], 0.82);
            c.draws_constrained = iid(seed, 400).into_iter().map(|x| vec![x]).collect();
            c.energies = iid(seed + 100, 400);
            c
        };
        let r = SamplerResult {
            chains: vec![mk(11), mk(12)],
            param_names: vec!["x".into()],
            n_warmup: 0,
            n_samples: 400,
        };
        let d = compute_diagnostics(&r);
        let q = quality_summary(&d, 2, 400, 0.8, &QualityGates::default());
        assert_eq!(q.status, QualityStatus::Ok, "{:?}", q);
    }
}

//! Leave-one-out cross-validation: PSIS-LOO, exact refits for flagged
//! observations, K-fold CV and model comparison.

use crate::data::Dataset;
use crate::diagnostics::ess;
use crate::fit::GlmFit;
use crate::psis::{ParetoKCategory, PsisConfig, PsisResult, psis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use vs_core::{Error, Result};
use vs_prob::math::{log_mean_exp, log_sum_exp, sample_variance};

/// Pointwise log-likelihood, `N x S`, row-major by observation.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLikMatrix {
    n_obs: usize,
    n_draws: usize,
    values: Vec<f64>,
    chain_lengths: Option<Vec<usize>>,
}

impl LogLikMatrix {
    /// Wrap row-major values. `chain_lengths` must sum to `n_draws` when given.
    pub fn new(
        n_obs: usize,
        n_draws: usize,
        values: Vec<f64>,
        chain_lengths: Option<Vec<usize>>,
    ) -> Result<Self> {
        if n_obs == 0 || n_draws == 0 {
            return Err(Error::Validation("log-likelihood matrix must be non-empty".into()));
        }
        if values.len() != n_obs * n_draws {
            return Err(Error::Validation(format!(
                "expected {} x {} = {} values, got {}",
                n_obs,
                n_draws,
                n_obs * n_draws,
                values.len()
            )));
        }
        if let Some(lengths) = &chain_lengths {
            if lengths.iter().sum::<usize>() != n_draws {
                return Err(Error::Validation(format!(
                    "chain lengths {:?} do not add up to {} draws",
                    lengths, n_draws
                )));
            }
        }
        Ok(Self { n_obs, n_draws, values, chain_lengths })
    }

    /// Build from one pointwise vector per draw (`S` vectors of length `N`).
    pub fn from_draws(per_draw: &[Vec<f64>], chain_lengths: Option<Vec<usize>>) -> Result<Self> {
        let n_draws = per_draw.len();
        let n_obs = per_draw.first().map_or(0, |d| d.len());
        if per_draw.iter().any(|d| d.len() != n_obs) {
            return Err(Error::Validation("draws have different numbers of observations".into()));
        }
        let mut values = vec![0.0; n_obs * n_draws];
        for (s, draw) in per_draw.iter().enumerate() {
            for (i, &v) in draw.iter().enumerate() {
                values[i * n_draws + s] = v;
            }
        }
        Self::new(n_obs, n_draws, values, chain_lengths)
    }

    /// Number of observations `N`.
    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    /// Number of draws `S`.
    pub fn n_draws(&self) -> usize {
        self.n_draws
    }

    /// Log-likelihood of observation `i` under every draw.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.values[i * self.n_draws..(i + 1) * self.n_draws]
    }

    /// Draw count per chain, when known.
    pub fn chain_lengths(&self) -> Option<&[usize]> {
        self.chain_lengths.as_deref()
    }

    /// Keep only the given draws (chain structure is dropped).
    pub fn select_draws(&self, draws: &[usize]) -> Result<Self> {
        if let Some(&bad) = draws.iter().find(|&&s| s >= self.n_draws) {
            return Err(Error::Validation(format!("draw index {} out of range", bad)));
        }
        let mut values = Vec::with_capacity(self.n_obs * draws.len());
        for i in 0..self.n_obs {
            let row = self.row(i);
            values.extend(draws.iter().map(|&s| row[s]));
        }
        Self::new(self.n_obs, draws.len(), values, None)
    }
}

/// How the pointwise elpd was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CvEstimator {
    /// Pareto-smoothed importance sampling.
    Psis,
    /// PSIS with exact refits for flagged observations.
    Reloo {
        /// Number of refits.
        n_refits: usize,
    },
    /// K-fold cross-validation.
    Kfold {
        /// Number of folds.
        k: usize,
    },
}

/// Counts of observations per Pareto-k category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoKRow {
    /// Category.
    pub category: ParetoKCategory,
    /// Range label.
    pub range: String,
    /// Number of observations.
    pub count: usize,
    /// Share of observations.
    pub fraction: f64,
}

/// Cross-validated predictive accuracy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LooResult {
    /// Estimator used.
    pub estimator: CvEstimator,
    /// Expected log pointwise predictive density.
    pub elpd_loo: f64,
    /// Standard error of `elpd_loo`.
    pub se_elpd_loo: f64,
    /// Effective number of parameters.
    pub p_loo: f64,
    /// Standard error of `p_loo`.
    pub se_p_loo: f64,
    /// `-2 elpd_loo`.
    pub looic: f64,
    /// Standard error of `looic`.
    pub se_looic: f64,
    /// Pointwise elpd.
    pub pointwise_elpd: Vec<f64>,
    /// Pointwise effective number of parameters.
    pub pointwise_p: Vec<f64>,
    /// Pareto shape per observation (absent for K-fold).
    pub pareto_k: Option<Vec<f64>>,
    /// Relative MCMC efficiency per observation (absent for K-fold).
    pub r_eff: Option<Vec<f64>>,
    /// Flagging threshold for `pareto_k`.
    pub k_threshold: f64,
    /// Reliability warnings.
    pub warnings: Vec<String>,
}

fn total_and_se(pointwise: &[f64]) -> (f64, f64) {
    let n = pointwise.len() as f64;
    (pointwise.iter().sum(), (n * sample_variance(pointwise)).sqrt())
}

impl LooResult {
    fn from_pointwise(
        estimator: CvEstimator,
        pointwise_elpd: Vec<f64>,
        pointwise_p: Vec<f64>,
        pareto_k: Option<Vec<f64>>,
        r_eff: Option<Vec<f64>>,
        k_threshold: f64,
    ) -> Self {
        let (elpd_loo, se_elpd_loo) = total_and_se(&pointwise_elpd);
        let (p_loo, se_p_loo) = total_and_se(&pointwise_p);
        let mut out = Self {
            estimator,
            elpd_loo,
            se_elpd_loo,
            p_loo,
            se_p_loo,
            looic: -2.0 * elpd_loo,
            se_looic: 2.0 * se_elpd_loo,
            pointwise_elpd,
            pointwise_p,
            pareto_k,
            r_eff,
            k_threshold,
            warnings: Vec::new(),
        };
        let high = out.high_k_indices();
        if !high.is_empty() {
            let msg = format!(
                "{} of {} observations have Pareto k > {}; PSIS-LOO is unreliable for them",
                high.len(),
                out.n_obs(),
                k_threshold
            );
            tracing::warn!(n_high_k = high.len(), threshold = k_threshold, "{}", msg);
            out.warnings.push(msg);
        }
        out
    }

    /// Number of observations.
    pub fn n_obs(&self) -> usize {
        self.pointwise_elpd.len()
    }

    /// Observations whose `k_hat` exceeds the threshold.
    pub fn high_k_indices(&self) -> Vec<usize> {
        match &self.pareto_k {
            Some(ks) => ks
                .iter()
                .enumerate()
                .filter(|&(_, &k)| !(k <= self.k_threshold))
                .map(|(i, _)| i)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Largest `k_hat` (`None` for K-fold).
    pub fn max_pareto_k(&self) -> Option<f64> {
        self.pareto_k.as_ref().map(|ks| ks.iter().copied().fold(f64::NEG_INFINITY, f64::max))
    }

    /// Counts per Pareto-k category.
    pub fn pareto_k_table(&self) -> Option<Vec<ParetoKRow>> {
        let ks = self.pareto_k.as_ref()?;
        let n = ks.len() as f64;
        Some(
            ParetoKCategory::ALL
                .iter()
                .map(|&category| {
                    let count = ks.iter().filter(|&&k| ParetoKCategory::of(k) == category).count();
                    ParetoKRow {
                        category,
                        range: category.label().to_string(),
                        count,
                        fraction: count as f64 / n,
                    }
                })
                .collect(),
        )
    }
}

/// Relative MCMC efficiency of `exp(log_lik)` per observation.
///
/// Ones when the matrix carries no chain structure.
pub fn relative_eff(ll: &LogLikMatrix) -> Vec<f64> {
    let Some(lengths) = ll.chain_lengths() else {
        return vec![1.0; ll.n_obs()];
    };
    let s = ll.n_draws() as f64;
    (0..ll.n_obs())
        .into_par_iter()
        .map(|i| {
            let row = ll.row(i);
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let lik: Vec<f64> = row.iter().map(|&v| (v - max).exp()).collect();
            let mut chains = Vec::with_capacity(lengths.len());
            let mut start = 0;
            for &len in lengths {
                chains.push(&lik[start..start + len]);
                start += len;
            }
            let r = ess(&chains) / s;
            if r.is_finite() && r > 0.0 { r } else { 1.0 }
        })
        .collect()
}

/// Pareto-smoothed LOO weights per observation.
pub fn psis_weights(ll: &LogLikMatrix, r_eff: &[f64]) -> Result<Vec<PsisResult>> {
    if r_eff.len() != ll.n_obs() {
        return Err(Error::Validation(format!(
            "r_eff has {} values, expected {}",
            r_eff.len(),
            ll.n_obs()
        )));
    }
    (0..ll.n_obs())
        .into_par_iter()
        .map(|i| {
            let ratios: Vec<f64> = ll.row(i).iter().map(|&v| -v).collect();
            psis(&ratios, r_eff[i])
        })
        .collect()
}

/// `log sum_s exp(lw_s + ll_s)` for one observation.
pub(crate) fn weighted_elpd(log_weights: &[f64], ll_row: &[f64]) -> f64 {
    let terms: Vec<f64> = log_weights.iter().zip(ll_row).map(|(&w, &l)| w + l).collect();
    log_sum_exp(&terms)
}

/// PSIS-LOO from a pointwise log-likelihood matrix.
pub fn loo(ll: &LogLikMatrix, config: &PsisConfig) -> Result<LooResult> {
    loo_with_weights(ll, config).map(|(res, _)| res)
}

/// PSIS-LOO together with the smoothed weights it used.
pub fn loo_with_weights(ll: &LogLikMatrix, config: &PsisConfig) -> Result<(LooResult, Vec<PsisResult>)> {
    config.validate()?;
    let r_eff = if config.use_r_eff { relative_eff(ll) } else { vec![1.0; ll.n_obs()] };
    let weights = psis_weights(ll, &r_eff)?;
    let mut elpd = Vec::with_capacity(ll.n_obs());
    let mut p = Vec::with_capacity(ll.n_obs());
    for (i, w) in weights.iter().enumerate() {
        let row = ll.row(i);
        let e = weighted_elpd(&w.log_weights, row);
        elpd.push(e);
        p.push(log_mean_exp(row) - e);
    }
    let ks = weights.iter().map(|w| w.pareto_k).collect();
    let out = LooResult::from_pointwise(CvEstimator::Psis, elpd, p, Some(ks), Some(r_eff), config.k_threshold);
    tracing::info!(elpd_loo = out.elpd_loo, se = out.se_elpd_loo, p_loo = out.p_loo, "PSIS-LOO");
    Ok((out, weights))
}

/// PSIS-LOO of a fitted model.
pub fn loo_fit(fit: &GlmFit, config: &PsisConfig) -> Result<LooResult> {
    loo(&fit.log_lik()?, config)
}

/// Exact leave-one-out for every observation flagged in `result`.
///
/// Each flagged observation is refit without it and its pointwise elpd replaced by
/// `log mean_s p(y_i | theta_s^(-i))`; its `k_hat` is set to 0.
pub fn reloo(fit: &GlmFit, result: &LooResult) -> Result<LooResult> {
    let data = fit.dataset();
    if result.n_obs() != data.n_obs() {
        return Err(Error::Validation(format!(
            "LOO result has {} observations, fit has {}",
            result.n_obs(),
            data.n_obs()
        )));
    }
    let flagged = result.high_k_indices();
    let mut elpd = result.pointwise_elpd.clone();
    let mut p = result.pointwise_p.clone();
    let mut ks = result.pareto_k.clone();
    if !flagged.is_empty() {
        tracing::info!(n_refits = flagged.len(), "refitting flagged observations");
    }
    for &i in &flagged {
        let lpd_i = elpd[i] + p[i];
        let train = data.without_row(i)?;
        let held_out = data.select_rows(&[i])?;
        let refit = fit.refit(&train)?;
        let ll = refit.log_lik_on(&held_out)?;
        elpd[i] = log_mean_exp(ll.row(0));
        p[i] = lpd_i - elpd[i];
        if let Some(ks) = ks.as_mut() {
            ks[i] = 0.0;
        }
        tracing::debug!(obs = i, elpd = elpd[i], "exact LOO refit");
    }
    let estimator = CvEstimator::Reloo { n_refits: flagged.len() };
    Ok(LooResult::from_pointwise(estimator, elpd, p, ks, result.r_eff.clone(), result.k_threshold))
}

/// Balanced random fold assignment of `n` observations into `k` folds.
pub fn kfold_split(n: usize, k: usize, seed: u64) -> Result<Vec<usize>> {
    if k < 2 || k > n {
        return Err(Error::Validation(format!("K-fold needs 2 <= k <= N, got k={} N={}", k, n)));
    }
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut folds = vec![0; n];
    for (j, &i) in perm.iter().enumerate() {
        folds[i] = j % k;
    }
    Ok(folds)
}

/// Training and held-out rows of fold `f`.
pub(crate) fn fold_rows(folds: &[usize], f: usize) -> (Vec<usize>, Vec<usize>) {
    (0..folds.len()).partition(|&i| folds[i] != f)
}

/// Held-out pointwise log predictive density from `K` refits.
pub fn kfold(fit: &GlmFit, k: usize, seed: u64) -> Result<LooResult> {
    let data: &Dataset = fit.dataset();
    let folds = kfold_split(data.n_obs(), k, seed)?;
    tracing::info!(k, "K-fold cross-validation");
    let lpd: Vec<f64> = {
        let ll = fit.log_lik()?;
        (0..ll.n_obs()).map(|i| log_mean_exp(ll.row(i))).collect()
    };
    let mut elpd = vec![0.0; data.n_obs()];
    for f in 0..k {
        let (train, test) = fold_rows(&folds, f);
        let refit = fit.refit(&data.select_rows(&train)?)?;
        let ll = refit.log_lik_on(&data.select_rows(&test)?)?;
        for (row, &i) in test.iter().enumerate() {
            elpd[i] = log_mean_exp(ll.row(row));
        }
        tracing::debug!(fold = f, n_test = test.len(), "fold done");
    }
    let p = lpd.iter().zip(&elpd).map(|(l, e)| l - e).collect();
    let threshold = PsisConfig::default().k_threshold;
    Ok(LooResult::from_pointwise(CvEstimator::Kfold { k }, elpd, p, None, None, threshold))
}

/// One row of a model comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    /// Position of the model in the input slice.
    pub model: usize,
    /// elpd of the model.
    pub elpd_loo: f64,
    /// Standard error of elpd.
    pub se_elpd_loo: f64,
    /// `elpd - elpd_best` (0 for the best model).
    pub elpd_diff: f64,
    /// Standard error of the paired difference.
    pub se_diff: f64,
    /// Effective number of parameters.
    pub p_loo: f64,
    /// LOO information criterion.
    pub looic: f64,
}

/// Models ordered from best to worst elpd.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LooComparison {
    /// Rows, best first.
    pub rows: Vec<ComparisonRow>,
}

impl LooComparison {
    /// Index (into the input slice) of the best model.
    pub fn best(&self) -> Option<usize> {
        self.rows.first().map(|r| r.model)
    }
}

/// Paired difference `a - b` with `se = sqrt(N var(a_i - b_i))`.
pub fn elpd_diff(a: &[f64], b: &[f64]) -> Result<(f64, f64)> {
    if a.len() != b.len() {
        return Err(Error::Validation(format!(
            "cannot compare models fitted to {} and {} observations",
            a.len(),
            b.len()
        )));
    }
    let d: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
    Ok(total_and_se(&d))
}

/// Compare models by elpd. All results must cover the same observations.
pub fn loo_compare(results: &[&LooResult]) -> Result<LooComparison> {
    let Some(first) = results.first() else {
        return Err(Error::Validation("loo_compare needs at least one result".into()));
    };
    if let Some(bad) = results.iter().find(|r| r.n_obs() != first.n_obs()) {
        return Err(Error::Validation(format!(
            "cannot compare models fitted to {} and {} observations",
            first.n_obs(),
            bad.n_obs()
        )));
    }
    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by(|&a, &b| results[b].elpd_loo.total_cmp(&results[a].elpd_loo).then(a.cmp(&b)));
    let best = results[order[0]];
    let rows = order
        .into_iter()
        .map(|m| {
            let r = results[m];
            let (diff, se) = elpd_diff(&r.pointwise_elpd, &best.pointwise_elpd)?;
            Ok(ComparisonRow {
                model: m,
                elpd_loo: r.elpd_loo,
                se_elpd_loo: r.se_elpd_loo,
                elpd_diff: diff,
                se_diff: se,
                p_loo: r.p_loo,
                looic: r.looic,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LooComparison { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand_distr::{Distribution, Normal};

    /// Log-likelihood of a conjugate normal-mean model: y_i ~ N(mu, 1), mu ~ posterior draws.
    fn normal_mean_ll(y: &[f64], n_draws: usize, chains: usize, seed: u64) -> LogLikMatrix {
        let n = y.len() as f64;
        let ybar = y.iter().sum::<f64>() / n;
        let post = Normal::new(ybar, (1.0 / n).sqrt()).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let draws: Vec<Vec<f64>> = (0..n_draws)
            .map(|_| {
                let mu = post.sample(&mut rng);
                y.iter().map(|&yi| vs_prob::normal::logpdf(yi, mu, 1.0).unwrap()).collect()
            })
            .collect();
        let per_chain = n_draws / chains;
        LogLikMatrix::from_draws(&draws, Some(vec![per_chain; chains])).unwrap()
    }

    fn sample_y(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let d = Normal::new(0.5, 1.0).unwrap();
        (0..n).map(|_| d.sample(&mut rng)).collect()
    }

    #[test]
    fn test_log_lik_matrix_layout() {
        let draws = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let ll = LogLikMatrix::from_draws(&draws, None).unwrap();
        assert_eq!((ll.n_obs(), ll.n_draws()), (3, 2));
        assert_eq!(ll.row(1), &[2.0, 5.0]);
        let sel = ll.select_draws(&[1]).unwrap();
        assert_eq!(sel.row(2), &[6.0]);
        assert!(ll.select_draws(&[2]).is_err());
        assert!(LogLikMatrix::new(2, 2, vec![0.0; 3], None).is_err());
        assert!(LogLikMatrix::new(1, 2, vec![0.0; 2], Some(vec![1, 2])).is_err());
    }

    #[test]
    fn test_loo_matches_exact_normal_mean() {
        let y = sample_y(50, 1);
        let ll = normal_mean_ll(&y, 4000, 4, 2);
        let res = loo(&ll, &PsisConfig::default()).unwrap();

        // Exact LOO predictive for a flat-prior normal mean: N(ybar_-i, 1 + 1/(n-1)).
        let n = y.len() as f64;
        let total: f64 = y.iter().sum();
        let exact: f64 = y
            .iter()
            .map(|&yi| {
                let m = (total - yi) / (n - 1.0);
                vs_prob::normal::logpdf(yi, m, (1.0 + 1.0 / (n - 1.0)).sqrt()).unwrap()
            })
            .sum();
        assert!((res.elpd_loo - exact).abs() < 0.5, "psis {} exact {}", res.elpd_loo, exact);
        assert!((res.p_loo - 1.0).abs() < 0.3, "p_loo {}", res.p_loo);
        assert_relative_eq!(res.looic, -2.0 * res.elpd_loo);
        assert!(res.high_k_indices().is_empty());
        assert!(res.warnings.is_empty());
        assert!(res.max_pareto_k().unwrap() < 0.7);
        let table = res.pareto_k_table().unwrap();
        assert_eq!(table.iter().map(|r| r.count).sum::<usize>(), 50);
    }

    #[test]
    fn test_relative_eff_iid_draws_near_one() {
        let y = sample_y(10, 3);
        let ll = normal_mean_ll(&y, 2000, 4, 4);
        for r in relative_eff(&ll) {
            assert!(r > 0.7 && r < 1.4, "r_eff {}", r);
        }
        let bare = LogLikMatrix::new(1, 3, vec![0.1, 0.2, 0.3], None).unwrap();
        assert_eq!(relative_eff(&bare), vec![1.0]);
    }

    #[test]
    fn test_outlier_gets_high_k() {
        let mut y = sample_y(30, 5);
        y[7] = 12.0;
        let ll = normal_mean_ll(&y, 2000, 2, 6);
        let res = loo(&ll, &PsisConfig { k_threshold: 0.5, ..Default::default() }).unwrap();
        let k = res.pareto_k.as_ref().unwrap();
        let argmax = (0..k.len()).max_by(|&a, &b| k[a].total_cmp(&k[b])).unwrap();
        assert_eq!(argmax, 7);
        assert!(res.high_k_indices().contains(&7));
        assert_eq!(res.warnings.len(), 1);
    }

    #[test]
    fn test_loo_compare_orders_and_validates() {
        let y = sample_y(40, 7);
        let good = loo(&normal_mean_ll(&y, 1000, 2, 8), &PsisConfig::default()).unwrap();
        let mut worse = good.clone();
        for (i, e) in worse.pointwise_elpd.iter_mut().enumerate() {
            *e -= 0.1 + 0.01 * i as f64;
        }
        let (total, _) = total_and_se(&worse.pointwise_elpd);
        worse.elpd_loo = total;

        let cmp = loo_compare(&[&worse, &good]).unwrap();
        assert_eq!(cmp.best(), Some(1));
        assert_eq!(cmp.rows[0].elpd_diff, 0.0);
        assert_eq!(cmp.rows[0].se_diff, 0.0);
        assert!(cmp.rows[1].elpd_diff < 0.0);
        assert!(cmp.rows[1].se_diff > 0.0);

        let mut short = good.clone();
        short.pointwise_elpd.pop();
        assert!(matches!(loo_compare(&[&good, &short]), Err(Error::Validation(_))));
        assert!(loo_compare(&[]).is_err());
    }

    #[test]
    fn test_kfold_split_is_balanced() {
        let folds = kfold_split(23, 5, 1).unwrap();
        let mut counts = [0usize; 5];
        for &f in &folds {
            counts[f] += 1;
        }
        assert!(counts.iter().all(|&c| c == 4 || c == 5));
        assert_eq!(folds, kfold_split(23, 5, 1).unwrap());
        assert!(kfold_split(3, 5, 1).is_err());
        assert!(kfold_split(10, 1, 1).is_err());
        let (train, test) = fold_rows(&folds, 0);
        assert_eq!(train.len() + test.len(), 23);
    }
}

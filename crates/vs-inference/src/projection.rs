//! Projection of reference posterior draws onto covariate subsets.
//!
//! Each reference draw defines a predictive distribution over the training data.
//! Its projection onto a subset `J` is the submodel on `[1, X_J]` closest to it in
//! KL divergence: least squares of the reference mean for the Gaussian family,
//! and a binomial fit to the fractional reference probabilities (Fisher scoring)
//! otherwise.

use crate::data::Dataset;
use crate::fit::{GlmFit, ParameterSummary, check_interval_prob};
use crate::glm::{Coefficients, Family};
use crate::loo::LogLikMatrix;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use vs_core::{Error, Result};
use vs_prob::Link;

/// Ridge added to the Fisher information of binomial projections.
pub const IRLS_RIDGE: f64 = 1e-8;
/// Iteration cap of binomial projections.
pub const IRLS_MAX_ITER: usize = 50;
/// Relative deviance-change tolerance of binomial projections.
pub const IRLS_TOL: f64 = 1e-9;

const MAX_HALVINGS: usize = 30;

/// `n` evenly spaced indices out of `total` (all of them when `n >= total`).
pub fn thin_draws(total: usize, n: usize) -> Result<Vec<usize>> {
    if n == 0 || total == 0 {
        return Err(Error::Validation("number of projected draws must be >= 1".into()));
    }
    if n >= total {
        return Ok((0..total).collect());
    }
    Ok((0..n).map(|j| j * total / n).collect())
}

/// `[1, X_J]` as a dense matrix.
fn design(data: &Dataset, vars: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(data.n_obs(), 1 + vars.len(), |i, j| {
        if j == 0 { 1.0 } else { data.row(i)[vars[j - 1]] }
    })
}

/// Reference draws prepared for repeated projection.
#[derive(Debug, Clone)]
pub struct ProjectionReference<'a> {
    data: &'a Dataset,
    family: Family,
    names: Vec<String>,
    draw_indices: Vec<usize>,
    mu: Vec<Vec<f64>>,
    sigma: Vec<Option<f64>>,
}

impl<'a> ProjectionReference<'a> {
    /// Use `n_draws` evenly spaced draws of `fit`.
    pub fn new(fit: &'a GlmFit, n_draws: usize) -> Result<Self> {
        Self::from_draws(fit, thin_draws(fit.n_draws(), n_draws)?)
    }

    /// Use the given draws of `fit`.
    pub fn from_draws(fit: &'a GlmFit, draw_indices: Vec<usize>) -> Result<Self> {
        let data = fit.dataset();
        let family = fit.family();
        let coefs = fit.coefficients();
        if let Some(&bad) = draw_indices.iter().find(|&&s| s >= coefs.len()) {
            return Err(Error::Validation(format!("draw index {} out of range", bad)));
        }
        let mu = draw_indices
            .iter()
            .map(|&s| (0..data.n_obs()).map(|i| family.mean(coefs[s].eta(data.row(i)))).collect())
            .collect();
        let sigma = draw_indices.iter().map(|&s| coefs[s].sigma).collect();
        Ok(Self { data, family, names: data.names().to_vec(), draw_indices, mu, sigma })
    }

    /// Indices of the reference draws being projected.
    pub fn draw_indices(&self) -> &[usize] {
        &self.draw_indices
    }

    /// Number of covariates available for selection.
    pub fn n_covariates(&self) -> usize {
        self.data.n_covariates()
    }

    #[cfg(test)]
    pub(crate) fn means_mut(&mut self) -> &mut [Vec<f64>] {
        &mut self.mu
    }

    /// Project every reference draw onto `vars`.
    pub fn project(&self, vars: &[usize]) -> Result<Projection> {
        let p = self.data.n_covariates();
        if let Some(&bad) = vars.iter().find(|&&j| j >= p) {
            return Err(Error::Validation(format!("covariate index {} out of range", bad)));
        }
        let x = design(self.data, vars);
        let (draws, kl) = match self.family {
            Family::Gaussian => self.project_gaussian(&x)?,
            Family::Binomial { link } => self.project_binomial(&x, link)?,
        };
        let mut names = Vec::with_capacity(vars.len() + 1);
        names.push("(Intercept)".to_string());
        names.extend(vars.iter().map(|&j| self.names[j].clone()));
        Ok(Projection { family: self.family, vars: vars.to_vec(), names, draws, kl })
    }

    fn project_gaussian(&self, x: &DMatrix<f64>) -> Result<(Vec<Coefficients>, Vec<f64>)> {
        let n = x.nrows();
        let s = self.mu.len();
        let targets = DMatrix::from_fn(n, s, |i, d| self.mu[d][i]);
        let svd = x.clone().svd(true, true);
        let eps = 1e-10 * svd.singular_values.max();
        let b = svd.solve(&targets, eps).map_err(|e| Error::Computation(e.to_string()))?;
        let fitted = x * &b;

        let mut draws = Vec::with_capacity(s);
        let mut kl = Vec::with_capacity(s);
        for d in 0..s {
            let mse = (0..n).map(|i| (self.mu[d][i] - fitted[(i, d)]).powi(2)).sum::<f64>() / n as f64;
            let sigma = self.sigma[d].ok_or_else(|| {
                Error::Computation("Gaussian reference draw without sigma".to_string())
            })?;
            let sigma2 = sigma * sigma + mse;
            kl.push(0.5 * n as f64 * (sigma2 / (sigma * sigma)).ln());
            draws.push(Coefficients {
                intercept: b[(0, d)],
                beta: (1..b.nrows()).map(|j| b[(j, d)]).collect(),
                sigma: Some(sigma2.sqrt()),
            });
        }
        Ok((draws, kl))
    }

    fn project_binomial(&self, x: &DMatrix<f64>, link: Link) -> Result<(Vec<Coefficients>, Vec<f64>)> {
        let trials = self.data.trials();
        let fits = self
            .mu
            .par_iter()
            .map(|m| irls_binomial(x, m, trials, link))
            .collect::<Result<Vec<_>>>()?;
        Ok(fits
            .into_iter()
            .map(|(b, dev)| {
                let c = Coefficients { intercept: b[0], beta: b.iter().skip(1).copied().collect(), sigma: None };
                (c, 0.5 * dev)
            })
            .unzip())
    }
}

fn binomial_deviance(x: &DMatrix<f64>, beta: &DVector<f64>, m: &[f64], trials: &[f64], link: Link) -> f64 {
    let eta = x * beta;
    2.0 * eta
        .iter()
        .zip(m)
        .zip(trials)
        .map(|((&e, &mi), &n)| {
            let (lq, l1q) = link.log_probs(e);
            let a = if mi > 0.0 { mi * (mi.ln() - lq) } else { 0.0 };
            let b = if mi < 1.0 { (1.0 - mi) * ((-mi).ln_1p() - l1q) } else { 0.0 };
            n * (a + b)
        })
        .sum::<f64>()
}

/// Binomial fit of fractional responses `m` by Fisher scoring with a small ridge.
///
/// Returns the coefficients and the final deviance; fails with
/// [`Error::Computation`] when the deviance does not settle within
/// [`IRLS_MAX_ITER`] iterations.
pub(crate) fn irls_binomial(
    x: &DMatrix<f64>,
    m: &[f64],
    trials: &[f64],
    link: Link,
) -> Result<(DVector<f64>, f64)> {
    let (n, p) = (x.nrows(), x.ncols());
    let total: f64 = trials.iter().sum();
    let mbar = (m.iter().zip(trials).map(|(a, b)| a * b).sum::<f64>() / total).clamp(1e-6, 1.0 - 1e-6);
    let mut beta = DVector::zeros(p);
    beta[0] = link.link(mbar);
    let mut dev = binomial_deviance(x, &beta, m, trials, link);

    for iter in 1..=IRLS_MAX_ITER {
        let eta = x * &beta;
        let mut info = DMatrix::<f64>::identity(p, p) * IRLS_RIDGE;
        let mut score = -&beta * IRLS_RIDGE;
        for i in 0..n {
            let e = eta[i];
            let (a, b) = link.dlog_probs(e);
            let w = trials[i] * link.dmu_deta(e) * (a - b);
            let g = trials[i] * (m[i] * a + (1.0 - m[i]) * b);
            let row = x.row(i);
            for r in 0..p {
                score[r] += g * row[r];
                for c in 0..=r {
                    info[(r, c)] += w * row[r] * row[c];
                }
            }
        }
        for r in 0..p {
            for c in 0..r {
                info[(c, r)] = info[(r, c)];
            }
        }
        let chol = info.cholesky().ok_or_else(|| {
            Error::Computation("projection: singular Fisher information".to_string())
        })?;
        let step = chol.solve(&score);

        let mut scale = 1.0;
        let mut cand = &beta + &step;
        let mut new_dev = binomial_deviance(x, &cand, m, trials, link);
        let mut halvings = 0;
        while !(new_dev.is_finite() && new_dev <= dev + 1e-12 * dev.abs().max(1.0))
            && halvings < MAX_HALVINGS
        {
            scale *= 0.5;
            cand = &beta + &step * scale;
            new_dev = binomial_deviance(x, &cand, m, trials, link);
            halvings += 1;
        }
        if !new_dev.is_finite() {
            return Err(Error::Computation("projection: non-finite deviance".to_string()));
        }
        let change = (new_dev - dev).abs() / (new_dev.abs() + 0.1);
        beta = cand;
        dev = new_dev;
        if change < IRLS_TOL {
            tracing::trace!(iter, deviance = dev, "projection converged");
            return Ok((beta, dev));
        }
    }
    Err(Error::Computation(format!(
        "projection did not converge in {} iterations (deviance {})",
        IRLS_MAX_ITER, dev
    )))
}

/// Projected draws of one submodel.
#[derive(Debug, Clone)]
pub struct Projection {
    family: Family,
    /// Covariate indices of the submodel, in order.
    pub vars: Vec<usize>,
    /// `"(Intercept)"` followed by the names of `vars`.
    pub names: Vec<String>,
    /// Projected coefficients per draw (`beta` aligned with `vars`).
    pub draws: Vec<Coefficients>,
    /// KL divergence from each reference draw to its projection, summed over observations.
    pub kl: Vec<f64>,
}

impl Projection {
    /// Number of projected draws.
    pub fn n_draws(&self) -> usize {
        self.draws.len()
    }

    /// Mean KL divergence over draws.
    pub fn mean_kl(&self) -> f64 {
        vs_prob::math::mean(&self.kl)
    }

    /// Linear predictor of draw `s` for a full covariate row.
    pub fn eta(&self, s: usize, row: &[f64]) -> f64 {
        let c = &self.draws[s];
        c.intercept + self.vars.iter().zip(&c.beta).map(|(&j, &b)| row[j] * b).sum::<f64>()
    }

    /// Predictive mean of draw `s` for a full covariate row.
    pub fn mean(&self, s: usize, row: &[f64]) -> f64 {
        self.family.mean(self.eta(s, row))
    }

    /// Pointwise log predictive density of `data` under every projected draw.
    pub fn log_lik_on(&self, data: &Dataset) -> Result<LogLikMatrix> {
        let per_draw: Vec<Vec<f64>> = (0..self.draws.len())
            .map(|s| {
                let sigma = self.draws[s].sigma;
                (0..data.n_obs())
                    .map(|i| self.family.log_lik(data.y()[i], data.trials()[i], self.eta(s, data.row(i)), sigma))
                    .collect()
            })
            .collect();
        LogLikMatrix::from_draws(&per_draw, None)
    }

    /// Posterior mean of (intercept, beta).
    pub fn coefficient_means(&self) -> Vec<f64> {
        let mut out = vec![vs_prob::math::mean(&self.draws.iter().map(|c| c.intercept).collect::<Vec<_>>())];
        for j in 0..self.vars.len() {
            out.push(vs_prob::math::mean(&self.draws.iter().map(|c| c.beta[j]).collect::<Vec<_>>()));
        }
        out
    }

    /// Summaries of intercept, coefficients and (Gaussian) `sigma`.
    pub fn summary(&self, prob: f64) -> Result<Vec<ParameterSummary>> {
        check_interval_prob(prob)?;
        let mut out = Vec::with_capacity(self.names.len() + 1);
        for (j, name) in self.names.iter().enumerate() {
            let draws: Vec<f64> = self
                .draws
                .iter()
                .map(|c| if j == 0 { c.intercept } else { c.beta[j - 1] })
                .collect();
            out.push(ParameterSummary::from_draws(name.clone(), &draws, prob));
        }
        if self.family.has_sigma() {
            let draws: Vec<f64> = self.draws.iter().filter_map(|c| c.sigma).collect();
            out.push(ParameterSummary::from_draws("sigma", &draws, prob));
        }
        Ok(out)
    }
}

/// Project `n_draws` evenly spaced draws of `fit` onto `vars`.
pub fn project_submodel(fit: &GlmFit, vars: &[usize], n_draws: usize) -> Result<Projection> {
    let mut seen = vec![false; fit.dataset().n_covariates()];
    for &j in vars {
        if j < seen.len() && std::mem::replace(&mut seen[j], true) {
            return Err(Error::Validation(format!("covariate {} selected twice", j)));
        }
    }
    ProjectionReference::new(fit, n_draws)?.project(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::SamplerConfig;
    use crate::glm::tests::toy_dataset;
    use crate::prior::PriorSpec;
    use approx::assert_relative_eq;
    use std::sync::OnceLock;

    fn quick(seed: u64) -> SamplerConfig {
        SamplerConfig { n_chains: 2, n_warmup: 200, n_samples: 150, seed, ..Default::default() }
    }

    fn gaussian_fit() -> &'static GlmFit {
        static FIT: OnceLock<GlmFit> = OnceLock::new();
        FIT.get_or_init(|| {
            let data = toy_dataset(60, 3, Family::Gaussian, 31);
            GlmFit::fit(&data, Family::Gaussian, &PriorSpec::default(), &quick(1)).unwrap()
        })
    }

    fn logistic_fit() -> &'static GlmFit {
        static FIT: OnceLock<GlmFit> = OnceLock::new();
        FIT.get_or_init(|| {
            let family = Family::Binomial { link: Link::Logit };
            let data = toy_dataset(80, 3, family, 32);
            GlmFit::fit(&data, family, &PriorSpec::default(), &quick(2)).unwrap()
        })
    }

    #[test]
    fn test_thin_draws() {
        assert_eq!(thin_draws(10, 5).unwrap(), vec![0, 2, 4, 6, 8]);
        assert_eq!(thin_draws(3, 5).unwrap(), vec![0, 1, 2]);
        assert!(thin_draws(10, 0).is_err());
    }

    #[test]
    fn test_full_projection_reproduces_reference_gaussian() {
        let fit = gaussian_fit();
        let proj = project_submodel(fit, &[0, 1, 2], fit.n_draws()).unwrap();
        let reference = fit.coefficient_means();
        for (a, b) in proj.coefficient_means().iter().zip(&reference) {
            assert_relative_eq!(a, b, epsilon = 1e-8);
        }
        assert!(proj.kl.iter().all(|&k| k.abs() < 1e-8));
        let sigma_ref = fit.sigma_draws().unwrap();
        for (c, s) in proj.draws.iter().zip(&sigma_ref) {
            assert_relative_eq!(c.sigma.unwrap(), *s, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_full_projection_reproduces_reference_binomial() {
        let fit = logistic_fit();
        let proj = project_submodel(fit, &[0, 1, 2], 50).unwrap();
        let idx = thin_draws(fit.n_draws(), 50).unwrap();
        for (c, &s) in proj.draws.iter().zip(&idx) {
            let r = &fit.coefficients()[s];
            assert_relative_eq!(c.intercept, r.intercept, epsilon = 1e-4);
            for (a, b) in c.beta.iter().zip(&r.beta) {
                assert_relative_eq!(a, b, epsilon = 1e-4);
            }
        }
        assert!(proj.mean_kl() < 1e-6);
    }

    #[test]
    fn test_kl_decreases_with_larger_subsets() {
        for fit in [gaussian_fit(), logistic_fit()] {
            let reference = ProjectionReference::new(fit, 40).unwrap();
            let empty = reference.project(&[]).unwrap().mean_kl();
            let one = reference.project(&[0]).unwrap().mean_kl();
            let two = reference.project(&[0, 1]).unwrap().mean_kl();
            assert!(empty >= one - 1e-9 && one >= two - 1e-9, "{} {} {}", empty, one, two);
            assert!(empty > one + 1.0, "signal covariate should reduce KL: {} vs {}", empty, one);
        }
    }

    #[test]
    fn test_intercept_only_gaussian_projection() {
        let fit = gaussian_fit();
        let proj = project_submodel(fit, &[], 20).unwrap();
        assert_eq!(proj.names, vec!["(Intercept)"]);
        let idx = thin_draws(fit.n_draws(), 20).unwrap();
        let data = fit.dataset();
        for (c, &s) in proj.draws.iter().zip(&idx) {
            let r = &fit.coefficients()[s];
            let mean_mu: f64 = (0..data.n_obs()).map(|i| r.eta(data.row(i))).sum::<f64>() / data.n_obs() as f64;
            assert_relative_eq!(c.intercept, mean_mu, epsilon = 1e-9);
            assert!(c.sigma.unwrap() > r.sigma.unwrap());
        }
        let summary = proj.summary(0.9).unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[1].name, "sigma");
    }

    #[test]
    fn test_projection_log_lik_shape() {
        let fit = logistic_fit();
        let proj = project_submodel(fit, &[1], 10).unwrap();
        let ll = proj.log_lik_on(fit.dataset()).unwrap();
        assert_eq!((ll.n_obs(), ll.n_draws()), (80, 10));
        assert!((0..80).all(|i| ll.row(i).iter().all(|v| v.is_finite() && *v <= 0.0)));
    }

    #[test]
    fn test_invalid_subsets() {
        let fit = gaussian_fit();
        assert!(matches!(project_submodel(fit, &[5], 10), Err(Error::Validation(_))));
        assert!(matches!(project_submodel(fit, &[1, 1], 10), Err(Error::Validation(_))));
    }

    #[test]
    fn test_irls_handles_zero_column() {
        let x = DMatrix::from_fn(6, 2, |_, j| if j == 0 { 1.0 } else { 0.0 });
        let m = [0.2, 0.4, 0.3, 0.5, 0.1, 0.3];
        let (b, _) = irls_binomial(&x, &m, &[1.0; 6], Link::Logit).unwrap();
        assert_relative_eq!(b[0], Link::Logit.link(0.3), epsilon = 1e-6);
        assert!(b[1].abs() < 1e-6);
    }
}

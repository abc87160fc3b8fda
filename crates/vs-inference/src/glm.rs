//! Bayesian generalized linear model as a [`LogDensityModel`].
//!
//! Parameters live in constrained space in a fixed layout:
//!
//! ```text
//! [intercept, beta_1..beta_P, (sigma)]                               normal / student-t
//! [intercept, z_1..z_P, lambda_1..lambda_P, tau, caux, (sigma)]      regularized horseshoe
//! ```
//!
//! `sigma` is present for the Gaussian family only. `nll` is the negative log
//! posterior (likelihood plus priors) up to an additive constant.

use crate::data::{Dataset, row_dot};
use crate::prior::{CoefficientPrior, PriorSpec, RegularizedHorseshoe, ResolvedPrior};
use serde::{Deserialize, Serialize};
use std::fmt;
use vs_core::traits::{LogDensityModel, PreparedModelRef};
use vs_core::{Error, Result};
use vs_prob::{Link, binomial, inv_gamma, normal, student_t};

/// Response family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum Family {
    /// Normal response with identity link and unknown `sigma`.
    Gaussian,
    /// Binomial success counts (Bernoulli when every trial count is 1).
    Binomial {
        /// Link function.
        #[serde(default)]
        link: Link,
    },
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Gaussian => write!(f, "gaussian(identity)"),
            Family::Binomial { link } => write!(f, "binomial({})", link),
        }
    }
}

impl Family {
    /// Whether the family carries a `sigma` parameter.
    pub fn has_sigma(&self) -> bool {
        matches!(self, Family::Gaussian)
    }

    /// Mean of the response per trial at linear predictor `eta`.
    #[inline]
    pub fn mean(&self, eta: f64) -> f64 {
        match self {
            Family::Gaussian => eta,
            Family::Binomial { link } => link.inverse(eta),
        }
    }

    /// Normalized log density of one observation.
    #[inline]
    pub fn log_lik(&self, y: f64, trials: f64, eta: f64, sigma: Option<f64>) -> f64 {
        match self {
            Family::Gaussian => {
                let s = sigma.unwrap_or(1.0);
                let z = (y - eta) / s;
                -0.5 * z * z - s.ln() - vs_prob::math::LN_SQRT_2PI
            }
            Family::Binomial { link } => binomial::logpmf_link(y, trials, eta, *link),
        }
    }

    fn validate_response(&self, data: &Dataset) -> Result<()> {
        if let Family::Binomial { .. } = self {
            for (i, (&y, &n)) in data.y().iter().zip(data.trials()).enumerate() {
                if y < 0.0 || y > n || y.fract() != 0.0 {
                    return Err(Error::Validation(format!(
                        "binomial response must be an integer in [0, trials]; row {} has y={} trials={}",
                        i, y, n
                    )));
                }
            }
        } else if data.n_obs() < 2 {
            return Err(Error::Validation("gaussian family needs at least 2 observations".into()));
        }
        Ok(())
    }
}

/// Regression coefficients derived from one parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    /// Intercept.
    pub intercept: f64,
    /// Covariate coefficients (for the horseshoe, the derived `beta_j`).
    pub beta: Vec<f64>,
    /// Residual SD (Gaussian family).
    pub sigma: Option<f64>,
}

impl Coefficients {
    /// Linear predictor for one covariate row.
    #[inline]
    pub fn eta(&self, row: &[f64]) -> f64 {
        self.intercept + row_dot(row, &self.beta)
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    p: usize,
    horseshoe: bool,
    sigma: bool,
}

impl Layout {
    fn dim(&self) -> usize {
        let coef = if self.horseshoe { 2 * self.p + 2 } else { self.p };
        1 + coef + usize::from(self.sigma)
    }
    fn lambda(&self, j: usize) -> usize {
        1 + self.p + j
    }
    fn tau(&self) -> usize {
        1 + 2 * self.p
    }
    fn caux(&self) -> usize {
        2 + 2 * self.p
    }
    fn sigma(&self) -> usize {
        self.dim() - 1
    }
}

/// Partial derivatives of `beta_j` w.r.t. the horseshoe parameters.
struct HorseshoePartials {
    d_z: Vec<f64>,
    d_lambda: Vec<f64>,
    d_tau: Vec<f64>,
    d_caux: Vec<f64>,
}

/// GLM with a prior, evaluated against a fixed dataset.
#[derive(Debug, Clone)]
pub struct GlmModel {
    data: Dataset,
    family: Family,
    prior_spec: PriorSpec,
    prior: ResolvedPrior,
    layout: Layout,
}

impl GlmModel {
    /// Create a model. The dataset is used as given (standardize it beforehand).
    pub fn new(data: Dataset, family: Family, prior: &PriorSpec) -> Result<Self> {
        family.validate_response(&data)?;
        let resolved = prior.resolve(&family, data.y())?;
        if resolved.coefficients.is_horseshoe() && data.n_covariates() == 0 {
            return Err(Error::Validation("horseshoe prior needs at least one covariate".into()));
        }
        let layout = Layout {
            p: data.n_covariates(),
            horseshoe: resolved.coefficients.is_horseshoe(),
            sigma: family.has_sigma(),
        };
        Ok(Self { data, family, prior_spec: prior.clone(), prior: resolved, layout })
    }

    /// Same family and prior on a different dataset (used for refits).
    pub fn with_data(&self, data: Dataset) -> Result<Self> {
        Self::new(data, self.family, &self.prior_spec)
    }

    /// The dataset.
    pub fn data(&self) -> &Dataset {
        &self.data
    }

    /// The family.
    pub fn family(&self) -> Family {
        self.family
    }

    /// The prior as specified.
    pub fn prior_spec(&self) -> &PriorSpec {
        &self.prior_spec
    }

    /// The prior after autoscaling.
    pub fn prior(&self) -> &ResolvedPrior {
        &self.prior
    }

    /// Number of covariates.
    pub fn n_covariates(&self) -> usize {
        self.layout.p
    }

    /// Names of `(intercept, beta...)`.
    pub fn coefficient_names(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.layout.p + 1);
        out.push("(Intercept)".to_string());
        out.extend(self.data.names().iter().cloned());
        out
    }

    fn horseshoe(&self) -> Option<&RegularizedHorseshoe> {
        match &self.prior.coefficients {
            CoefficientPrior::RegularizedHorseshoe(hs) => Some(hs),
            _ => None,
        }
    }

    fn check_params(&self, params: &[f64]) -> Result<()> {
        if params.len() != self.layout.dim() {
            return Err(Error::Validation(format!(
                "expected {} parameters, got {}",
                self.layout.dim(),
                params.len()
            )));
        }
        if params.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation("params must contain only finite values".to_string()));
        }
        for ((lo, _), v) in self.parameter_bounds().iter().zip(params) {
            if *lo == 0.0 && *v <= 0.0 {
                return Err(Error::Validation("scale parameters must be > 0".to_string()));
            }
        }
        Ok(())
    }

    fn beta_and_partials(&self, params: &[f64]) -> (Vec<f64>, Option<HorseshoePartials>) {
        let p = self.layout.p;
        let Some(hs) = self.horseshoe() else {
            return (params[1..1 + p].to_vec(), None);
        };
        let tau = params[self.layout.tau()];
        let caux = params[self.layout.caux()];
        let slab2 = hs.slab_scale * hs.slab_scale;
        let c = slab2 * caux;
        let t = tau * tau;

        let mut beta = vec![0.0; p];
        let mut parts = HorseshoePartials {
            d_z: vec![0.0; p],
            d_lambda: vec![0.0; p],
            d_tau: vec![0.0; p],
            d_caux: vec![0.0; p],
        };
        for j in 0..p {
            let z = params[1 + j];
            let lambda = params[self.layout.lambda(j)];
            let u = lambda * lambda;
            let d = c + t * u;
            let ratio = c / d;
            let lambda_tilde = lambda * ratio.sqrt();
            let r15 = ratio * ratio.sqrt();
            beta[j] = z * tau * lambda_tilde;
            parts.d_z[j] = tau * lambda_tilde;
            parts.d_lambda[j] = z * tau * r15;
            parts.d_tau[j] = z * lambda * r15;
            parts.d_caux[j] = z * tau * lambda * t * u / (2.0 * c.sqrt() * d * d.sqrt()) * slab2;
        }
        (beta, Some(parts))
    }

    /// Derived regression coefficients for a constrained parameter vector.
    pub fn coefficients(&self, params: &[f64]) -> Result<Coefficients> {
        self.check_params(params)?;
        let (beta, _) = self.beta_and_partials(params);
        let sigma = self.layout.sigma.then(|| params[self.layout.sigma()]);
        Ok(Coefficients { intercept: params[0], beta, sigma })
    }

    /// Pointwise log-likelihood `log p(y_i | theta)` for every observation.
    pub fn pointwise_log_lik(&self, params: &[f64]) -> Result<Vec<f64>> {
        let coefs = self.coefficients(params)?;
        let x = self.data.design();
        Ok((0..x.n)
            .map(|i| {
                let eta = coefs.eta(x.row(i));
                self.family.log_lik(self.data.y()[i], self.data.trials()[i], eta, coefs.sigma)
            })
            .collect())
    }

    fn eval(&self, params: &[f64], want_grad: bool) -> Result<(f64, Vec<f64>)> {
        self.check_params(params)?;
        let lay = self.layout;
        let p = lay.p;
        let x = self.data.design();
        let y = self.data.y();
        let trials = self.data.trials();
        let (beta, hs_parts) = self.beta_and_partials(params);
        let b0 = params[0];
        let sigma = lay.sigma.then(|| params[lay.sigma()]);

        let mut nll = 0.0;
        let mut g_b0 = 0.0;
        let mut g_beta = vec![0.0; p];
        let mut g_sigma = 0.0;

        match self.family {
            Family::Gaussian => {
                let s = sigma.unwrap_or(1.0);
                let inv_s2 = 1.0 / (s * s);
                let mut ssr = 0.0;
                for i in 0..x.n {
                    let row = x.row(i);
                    let r = y[i] - (b0 + row_dot(row, &beta));
                    ssr += r * r;
                    if want_grad {
                        let g = -r * inv_s2;
                        g_b0 += g;
                        for (gb, &xij) in g_beta.iter_mut().zip(row) {
                            *gb += g * xij;
                        }
                    }
                }
                let n = x.n as f64;
                nll += n * s.ln() + 0.5 * ssr * inv_s2;
                g_sigma += n / s - ssr * inv_s2 / s;
            }
            Family::Binomial { link } => {
                for i in 0..x.n {
                    let row = x.row(i);
                    let eta = b0 + row_dot(row, &beta);
                    let (v, g) = binomial::nll_link_and_grad(y[i], trials[i], eta, link);
                    nll += v;
                    if want_grad {
                        g_b0 += g;
                        for (gb, &xij) in g_beta.iter_mut().zip(row) {
                            *gb += g * xij;
                        }
                    }
                }
            }
        }
        if !nll.is_finite() {
            return Err(Error::Computation("non-finite log-likelihood".to_string()));
        }

        let mut grad = vec![0.0; lay.dim()];

        // Intercept prior.
        let (v, g) = normal::nll_kernel(b0, self.prior.intercept_location, self.prior.intercept_scale);
        nll += v;
        grad[0] = g_b0 + g;

        match (&self.prior.coefficients, hs_parts) {
            (CoefficientPrior::Normal { location, scale }, _) => {
                for j in 0..p {
                    let (v, g) = normal::nll_kernel(beta[j], *location, *scale);
                    nll += v;
                    grad[1 + j] = g_beta[j] + g;
                }
            }
            (CoefficientPrior::StudentT { df, location, scale }, _) => {
                for j in 0..p {
                    let (v, g) = student_t::nll_kernel(beta[j], *location, *scale, *df);
                    nll += v;
                    grad[1 + j] = g_beta[j] + g;
                }
            }
            (CoefficientPrior::RegularizedHorseshoe(hs), Some(parts)) => {
                let tau = params[lay.tau()];
                let caux = params[lay.caux()];
                let mut g_tau = 0.0;
                let mut g_caux = 0.0;
                for j in 0..p {
                    let z = params[1 + j];
                    let lambda = params[lay.lambda(j)];
                    let (v_lam, g_lam) = student_t::nll_kernel(lambda, 0.0, 1.0, hs.df);
                    nll += 0.5 * z * z + v_lam;
                    grad[1 + j] = g_beta[j] * parts.d_z[j] + z;
                    grad[lay.lambda(j)] = g_beta[j] * parts.d_lambda[j] + g_lam;
                    g_tau += g_beta[j] * parts.d_tau[j];
                    g_caux += g_beta[j] * parts.d_caux[j];
                }

                // tau ~ half-t(global_df, global_scale * sigma); the log-scale term stays
                // because sigma is a parameter.
                let nu = hs.global_df;
                let s = hs.global_scale * sigma.unwrap_or(1.0);
                let (v_tau, gt) = student_t::nll_kernel(tau, 0.0, s, nu);
                nll += v_tau + s.ln();
                g_tau += gt;
                if lay.sigma {
                    let r = tau * tau / (nu * s * s);
                    let d_s = (1.0 - (nu + 1.0) * r / (1.0 + r)) / s;
                    g_sigma += d_s * hs.global_scale;
                }

                let half = 0.5 * hs.slab_df;
                let (v_c, g_c) = inv_gamma::nll_kernel(caux, half, half);
                nll += v_c;
                g_caux += g_c;

                grad[lay.tau()] = g_tau;
                grad[lay.caux()] = g_caux;
            }
            (CoefficientPrior::RegularizedHorseshoe(_), None) => {
                return Err(Error::Computation("horseshoe partials missing".to_string()));
            }
        }

        if let Some(s) = sigma {
            nll += self.prior.aux_rate * s;
            grad[lay.sigma()] = g_sigma + self.prior.aux_rate;
        }

        Ok((nll, grad))
    }
}

impl LogDensityModel for GlmModel {
    type Prepared<'a>
        = PreparedModelRef<'a, Self>
    where
        Self: 'a;

    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn parameter_names(&self) -> Vec<String> {
        let names = self.data.names();
        let mut out = Vec::with_capacity(self.layout.dim());
        out.push("(Intercept)".to_string());
        if self.layout.horseshoe {
            out.extend(names.iter().map(|n| format!("z[{}]", n)));
            out.extend(names.iter().map(|n| format!("lambda[{}]", n)));
            out.push("tau".to_string());
            out.push("caux".to_string());
        } else {
            out.extend(names.iter().cloned());
        }
        if self.layout.sigma {
            out.push("sigma".to_string());
        }
        out
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        let free = (f64::NEG_INFINITY, f64::INFINITY);
        let pos = (0.0, f64::INFINITY);
        let lay = self.layout;
        let mut out = vec![free; lay.dim()];
        if lay.horseshoe {
            for j in 0..lay.p {
                out[lay.lambda(j)] = pos;
            }
            out[lay.tau()] = pos;
            out[lay.caux()] = pos;
        }
        if lay.sigma {
            out[lay.sigma()] = pos;
        }
        out
    }

    fn parameter_init(&self) -> Vec<f64> {
        let lay = self.layout;
        let y = self.data.y();
        let mut out = vec![0.0; lay.dim()];
        out[0] = match self.family {
            Family::Gaussian => vs_prob::math::mean(y),
            Family::Binomial { link } => {
                let succ: f64 = y.iter().sum();
                let total: f64 = self.data.trials().iter().sum();
                link.link(((succ + 0.5) / (total + 1.0)).clamp(1e-6, 1.0 - 1e-6))
            }
        };
        let sd = self.data.y_sd();
        let sd = if sd.is_finite() && sd > 0.0 { sd } else { 1.0 };
        if let Some(hs) = self.horseshoe() {
            for j in 0..lay.p {
                out[lay.lambda(j)] = 1.0;
            }
            out[lay.tau()] = hs.global_scale * if lay.sigma { sd } else { 1.0 };
            out[lay.caux()] = 1.0;
        }
        if lay.sigma {
            out[lay.sigma()] = sd;
        }
        out
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        Ok(self.eval(params, false)?.0)
    }

    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
        Ok(self.eval(params, true)?.1)
    }

    fn prepared(&self) -> Self::Prepared<'_> {
        PreparedModelRef::new(self)
    }

    fn prefer_fused_eval_grad(&self) -> bool {
        true
    }

    fn nll_grad_prepared(
        &self,
        _prepared: &Self::Prepared<'_>,
        params: &[f64],
    ) -> Result<(f64, Vec<f64>)> {
        self.eval(params, true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, StandardNormal};

    pub(crate) fn toy_dataset(n: usize, p: usize, family: Family, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for _ in 0..n {
            let row: Vec<f64> = (0..p).map(|_| StandardNormal.sample(&mut rng)).collect();
            let eta = 0.3 + if p > 0 { 1.2 * row[0] } else { 0.0 };
            let v = match family {
                Family::Gaussian => {
                    let e: f64 = StandardNormal.sample(&mut rng);
                    eta + 0.5 * e
                }
                Family::Binomial { link } => {
                    let u: f64 = rand::Rng::random(&mut rng);
                    if u < link.inverse(eta) { 1.0 } else { 0.0 }
                }
            };
            rows.push(row);
            y.push(v);
        }
        let names = (1..=p).map(|j| format!("x{}", j)).collect();
        Dataset::from_rows(rows, y, names).unwrap().standardize().unwrap()
    }

    fn check_grad(model: &GlmModel, theta: &[f64]) {
        let grad = model.grad_nll(theta).unwrap();
        let eps = 1e-6;
        for i in 0..theta.len() {
            let mut tp = theta.to_vec();
            let mut tm = theta.to_vec();
            tp[i] += eps;
            tm[i] -= eps;
            let fd = (model.nll(&tp).unwrap() - model.nll(&tm).unwrap()) / (2.0 * eps);
            let scale = grad[i].abs().max(1.0);
            assert!(
                (grad[i] - fd).abs() / scale < 1e-4,
                "{}: grad[{}] analytic={} fd={}",
                model.family(),
                i,
                grad[i],
                fd
            );
        }
    }

    fn test_point(model: &GlmModel) -> Vec<f64> {
        let mut theta = model.parameter_init();
        for (i, ((lo, _), v)) in model.parameter_bounds().iter().zip(theta.iter_mut()).enumerate() {
            let bump = 0.1 * ((i % 5) as f64 + 1.0);
            if *lo == 0.0 {
                *v = (*v).max(0.05) * (1.0 + bump);
            } else {
                *v += bump - 0.25;
            }
        }
        theta
    }

    #[test]
    fn test_gradients_all_families_and_priors() {
        let families = [
            Family::Gaussian,
            Family::Binomial { link: Link::Logit },
            Family::Binomial { link: Link::Probit },
            Family::Binomial { link: Link::Cauchit },
            Family::Binomial { link: Link::CLogLog },
        ];
        let priors = [
            PriorSpec::default(),
            PriorSpec::with_coefficients(CoefficientPrior::StudentT { df: 3.0, location: 0.0, scale: 1.0 }),
            PriorSpec::with_coefficients(CoefficientPrior::RegularizedHorseshoe(
                RegularizedHorseshoe { global_scale: 0.3, ..Default::default() },
            )),
        ];
        for family in families {
            let data = toy_dataset(40, 3, family, 7);
            for prior in &priors {
                let model = GlmModel::new(data.clone(), family, prior).unwrap();
                let theta = test_point(&model);
                check_grad(&model, &theta);
            }
        }
    }

    #[test]
    fn test_layout_and_names() {
        let data = toy_dataset(20, 2, Family::Gaussian, 1);
        let hs = PriorSpec::with_coefficients(CoefficientPrior::RegularizedHorseshoe(Default::default()));
        let model = GlmModel::new(data, Family::Gaussian, &hs).unwrap();
        assert_eq!(model.dim(), 1 + 2 + 2 + 2 + 1);
        let names = model.parameter_names();
        assert_eq!(names[0], "(Intercept)");
        assert_eq!(names[1], "z[x1]");
        assert_eq!(names[3], "lambda[x1]");
        assert_eq!(names[5], "tau");
        assert_eq!(names[7], "sigma");
        assert_eq!(model.parameter_bounds()[3], (0.0, f64::INFINITY));
    }

    #[test]
    fn test_horseshoe_beta_bounded_by_slab() {
        // With a huge local scale, lambda_tilde -> c / tau, so |beta| <= |z| * c.
        let data = toy_dataset(20, 1, Family::Binomial { link: Link::Logit }, 3);
        let hs = RegularizedHorseshoe { slab_scale: 2.0, ..Default::default() };
        let model = GlmModel::new(
            data,
            Family::Binomial { link: Link::Logit },
            &PriorSpec::with_coefficients(CoefficientPrior::RegularizedHorseshoe(hs)),
        )
        .unwrap();
        let theta = vec![0.0, 1.5, 1e8, 0.5, 1.0];
        let c = model.coefficients(&theta).unwrap();
        assert!((c.beta[0] - 1.5 * 2.0).abs() < 1e-6, "beta = {}", c.beta[0]);
    }

    #[test]
    fn test_pointwise_log_lik_sums_to_likelihood() {
        let data = toy_dataset(30, 2, Family::Gaussian, 5);
        let model = GlmModel::new(data.clone(), Family::Gaussian, &PriorSpec::default()).unwrap();
        let theta = vec![0.1, 0.4, -0.2, 0.8];
        let ll = model.pointwise_log_lik(&theta).unwrap();
        let direct: f64 = (0..data.n_obs())
            .map(|i| {
                let eta = 0.1 + 0.4 * data.row(i)[0] - 0.2 * data.row(i)[1];
                normal::logpdf(data.y()[i], eta, 0.8).unwrap()
            })
            .sum();
        assert!((ll.iter().sum::<f64>() - direct).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bad_binomial_response() {
        let ds = Dataset::from_rows(vec![vec![1.0], vec![2.0]], vec![0.0, 2.0], vec!["x".into()]).unwrap();
        let r = GlmModel::new(ds, Family::Binomial { link: Link::Logit }, &PriorSpec::default());
        assert!(matches!(r, Err(Error::Validation(_))));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let data = toy_dataset(10, 1, Family::Gaussian, 2);
        let model = GlmModel::new(data, Family::Gaussian, &PriorSpec::default()).unwrap();
        assert!(model.nll(&[0.0, 0.0, -1.0]).is_err());
        assert!(model.nll(&[0.0, f64::NAN, 1.0]).is_err());
        assert!(model.nll(&[0.0, 1.0]).is_err());
    }
}

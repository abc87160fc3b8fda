//! Maximum a posteriori (MAP) estimation.
//!
//! Minimizes the negative log posterior in unconstrained space (including the
//! log-Jacobian of the positivity transforms) with L-BFGS. The estimate seeds
//! the NUTS chains and backs [`MapEstimator::fit`].

use crate::optimizer::{LbfgsOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
use crate::posterior::Posterior;
use nalgebra::DMatrix;
use std::sync::Mutex;
use vs_core::traits::LogDensityModel;
use vs_core::{Error, FitResult, Result};

/// Last evaluated point with its value and gradient.
struct Cached {
    z: Vec<f64>,
    value: f64,
    grad: Vec<f64>,
}

/// `-logpdf_unconstrained` with a one-point cache so that argmin's separate
/// cost and gradient calls at the same point share a single model pass.
struct NegLogPosterior<'p, 'a, M: LogDensityModel + ?Sized> {
    posterior: &'p Posterior<'a, M>,
    cache: Mutex<Option<Cached>>,
}

impl<M: LogDensityModel + ?Sized> NegLogPosterior<'_, '_, M> {
    fn with_cached<T>(&self, z: &[f64], f: impl FnOnce(&Cached) -> T) -> Result<T> {
        let mut guard = self
            .cache
            .lock()
            .map_err(|_| Error::Computation("objective cache poisoned".to_string()))?;
        let hit = guard.as_ref().is_some_and(|c| c.z == z);
        if !hit {
            let (lp, grad) = self.posterior.logpdf_grad_unconstrained(z)?;
            *guard = Some(Cached {
                z: z.to_vec(),
                value: -lp,
                grad: grad.into_iter().map(|g| -g).collect(),
            });
        }
        guard
            .as_ref()
            .map(f)
            .ok_or_else(|| Error::Computation("objective cache empty".to_string()))
    }
}

impl<M: LogDensityModel + ?Sized> ObjectiveFunction for NegLogPosterior<'_, '_, M> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        self.with_cached(params, |c| c.value)
    }

    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        self.with_cached(params, |c| c.grad.clone())
    }
}

/// MAP estimator for any [`LogDensityModel`].
#[derive(Debug, Clone, Default)]
pub struct MapEstimator {
    config: OptimizerConfig,
}

impl MapEstimator {
    /// Estimator with default optimizer settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimator with custom optimizer settings.
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize from `model.parameter_init()`.
    ///
    /// `parameters` of the result are in constrained space; `fval` is the
    /// unconstrained negative log posterior at the optimum.
    pub fn fit_minimum<M: LogDensityModel + ?Sized>(&self, model: &M) -> Result<OptimizationResult> {
        self.fit_minimum_from(model, &model.parameter_init())
    }

    /// Minimize from a constrained starting point.
    pub fn fit_minimum_from<M: LogDensityModel + ?Sized>(
        &self,
        model: &M,
        theta_init: &[f64],
    ) -> Result<OptimizationResult> {
        let posterior = Posterior::new(model);
        let z0 = posterior.to_unconstrained(theta_init)?;
        let objective = NegLogPosterior { posterior: &posterior, cache: Mutex::new(None) };
        let mut res = LbfgsOptimizer::new(self.config.clone()).minimize(&objective, &z0)?;
        res.parameters = posterior.to_constrained(&res.parameters);
        Ok(res)
    }

    /// MAP fit with Hessian-based uncertainties (constrained space).
    pub fn fit<M: LogDensityModel + ?Sized>(&self, model: &M) -> Result<FitResult> {
        let res = self.fit_minimum(model)?;
        let hessian = compute_hessian(model, &res.parameters)?;
        let n = res.parameters.len();
        let mut warnings = Vec::new();
        let uncertainties = match invert_hessian(&hessian) {
            Some(cov) => (0..n).map(|i| cov[(i, i)].sqrt()).collect(),
            None => {
                tracing::warn!("Hessian inversion failed, using diagonal approximation");
                warnings.push("Hessian not positive definite; diagonal uncertainties".to_string());
                (0..n).map(|i| 1.0 / hessian[(i, i)].abs().max(1e-12).sqrt()).collect()
            }
        };
        if !res.converged {
            warnings.push(format!("optimizer did not converge: {}", res.message));
        }
        let nll = model.nll(&res.parameters)?;
        let mut fit = FitResult::new(res.parameters, uncertainties, nll, res.converged, res.n_iter);
        fit.warnings = warnings;
        Ok(fit)
    }
}

/// Forward-difference Hessian of the NLL from analytic gradients, symmetrized.
fn compute_hessian<M: LogDensityModel + ?Sized>(model: &M, theta: &[f64]) -> Result<DMatrix<f64>> {
    let n = theta.len();
    let bounds = model.parameter_bounds();
    let g0 = model.grad_nll(theta)?;
    let mut h = DMatrix::zeros(n, n);
    for j in 0..n {
        let mut eps = 1e-5 * theta[j].abs().max(1.0);
        // Step inward for positive parameters close to zero.
        if bounds[j].0.is_finite() && theta[j] - eps <= bounds[j].0 {
            eps = eps.min(0.5 * (theta[j] - bounds[j].0));
        }
        let mut tp = theta.to_vec();
        tp[j] += eps;
        let gp = model.grad_nll(&tp)?;
        for i in 0..n {
            h[(i, j)] = (gp[i] - g0[i]) / eps;
        }
    }
    Ok((&h + h.transpose()) * 0.5)
}

/// Covariance from a Cholesky solve with geometrically increasing diagonal damping.
fn invert_hessian(h: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = h.nrows();
    let scale = (0..n).map(|i| h[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);
    let mut damping = 0.0;
    for _ in 0..10 {
        let damped = h + DMatrix::identity(n, n) * damping;
        if let Some(chol) = damped.cholesky() {
            let cov = chol.inverse();
            if (0..n).all(|i| cov[(i, i)].is_finite() && cov[(i, i)] > 0.0) {
                return Some(cov);
            }
        }
        damping = if damping == 0.0 { scale * 1e-9 } else { damping * 10.0 };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::glm::tests::toy_dataset;
    use crate::glm::{Family, GlmModel};
    use crate::prior::PriorSpec;
    use approx::assert_relative_eq;
    use vs_prob::Link;

    #[test]
    fn test_map_gradient_vanishes_in_unconstrained_space() {
        let data = toy_dataset(80, 3, Family::Binomial { link: Link::Logit }, 21);
        let model =
            GlmModel::new(data, Family::Binomial { link: Link::Logit }, &PriorSpec::default()).unwrap();
        let res = MapEstimator::new().fit_minimum(&model).unwrap();
        assert!(res.converged, "{}", res);
        let post = Posterior::new(&model);
        let z = post.to_unconstrained(&res.parameters).unwrap();
        let g = post.grad_unconstrained(&z).unwrap();
        for gi in g {
            assert!(gi.abs() < 1e-3, "gradient {}", gi);
        }
        // Strong signal on x1.
        assert!(res.parameters[1] > 0.5);
    }

    #[test]
    fn test_gaussian_map_close_to_least_squares() {
        // y = 1 + 2 x, tiny noise: the weak default prior barely matters.
        let x: Vec<Vec<f64>> = (0..50).map(|i| vec![(i as f64 - 25.0) / 10.0]).collect();
        let y: Vec<f64> =
            x.iter().enumerate().map(|(i, r)| 1.0 + 2.0 * r[0] + 0.01 * ((i % 7) as f64 - 3.0)).collect();
        let ds = Dataset::from_rows(x, y, vec!["x".into()]).unwrap();
        let model = GlmModel::new(ds, Family::Gaussian, &PriorSpec::default()).unwrap();
        let fit = MapEstimator::new().fit(&model).unwrap();
        assert!(fit.converged);
        assert_relative_eq!(fit.parameters[0], 1.0, epsilon = 0.01);
        assert_relative_eq!(fit.parameters[1], 2.0, epsilon = 0.01);
        assert!(fit.parameters[2] > 0.0 && fit.parameters[2] < 0.1);
        assert!(fit.uncertainties.iter().all(|u| u.is_finite() && *u > 0.0));
    }
}

//! Posterior density of a [`LogDensityModel`] in constrained and unconstrained space.
//!
//! The model NLL already contains the priors, so `logpdf = -nll`. Sampling and
//! MAP search happen in unconstrained space where positive parameters are
//! log-transformed:
//!
//! - `logpdf(theta) = -model.nll(theta)`
//! - `logpdf_unconstrained(z) = logpdf(transform(z)) + log|J(z)|`

use vs_core::traits::LogDensityModel;
use vs_core::{Error, Result};
use vs_prob::transforms::ParameterTransform;

/// Posterior wrapping a model with its bound-derived transform.
pub struct Posterior<'a, M: LogDensityModel + ?Sized> {
    model: &'a M,
    prepared: M::Prepared<'a>,
    transform: ParameterTransform,
}

impl<'a, M: LogDensityModel + ?Sized> Posterior<'a, M> {
    /// Create a posterior for `model`.
    pub fn new(model: &'a M) -> Self {
        let transform = ParameterTransform::from_bounds(&model.parameter_bounds());
        Self { model, prepared: model.prepared(), transform }
    }

    /// Number of parameters.
    pub fn dim(&self) -> usize {
        self.model.dim()
    }

    /// Reference to the underlying model.
    pub fn model(&self) -> &M {
        self.model
    }

    /// Reference to the parameter transform.
    pub fn transform(&self) -> &ParameterTransform {
        &self.transform
    }

    /// Log-posterior in constrained space.
    pub fn logpdf(&self, theta: &[f64]) -> Result<f64> {
        Ok(-self.model.nll(theta)?)
    }

    /// Gradient of the log-posterior in constrained space.
    pub fn grad(&self, theta: &[f64]) -> Result<Vec<f64>> {
        let mut g = self.model.grad_nll(theta)?;
        for gi in g.iter_mut() {
            *gi = -*gi;
        }
        Ok(g)
    }

    /// Log-posterior in unconstrained space.
    pub fn logpdf_unconstrained(&self, z: &[f64]) -> Result<f64> {
        let theta = self.transform.forward(z);
        let lp = self.logpdf(&theta)?;
        Ok(lp + self.transform.log_abs_det_jacobian(z))
    }

    /// Gradient of the log-posterior in unconstrained space.
    pub fn grad_unconstrained(&self, z: &[f64]) -> Result<Vec<f64>> {
        Ok(self.logpdf_grad_unconstrained(z)?.1)
    }

    /// Log-posterior and its gradient in unconstrained space from one model pass.
    ///
    /// Chain rule with a diagonal Jacobian:
    /// `grad_z[i] = (dtheta_i/dz_i) * grad_theta[i] + d/dz_i log|J_i|`
    pub fn logpdf_grad_unconstrained(&self, z: &[f64]) -> Result<(f64, Vec<f64>)> {
        let theta = self.transform.forward(z);
        let (nll, grad_nll) = if self.model.prefer_fused_eval_grad() {
            self.model.nll_grad_prepared(&self.prepared, &theta)?
        } else {
            (self.model.nll(&theta)?, self.model.grad_nll(&theta)?)
        };
        let lp = -nll + self.transform.log_abs_det_jacobian(z);
        if !lp.is_finite() {
            return Err(Error::Computation(format!("non-finite log density: {}", lp)));
        }
        let jac_diag = self.transform.jacobian_diag(z);
        let grad_log_jac = self.transform.grad_log_abs_det_jacobian(z);
        let grad_z = grad_nll
            .iter()
            .zip(&jac_diag)
            .zip(&grad_log_jac)
            .map(|((&g, &jd), &glj)| -g * jd + glj)
            .collect();
        Ok((lp, grad_z))
    }

    /// Map constrained -> unconstrained.
    pub fn to_unconstrained(&self, theta: &[f64]) -> Result<Vec<f64>> {
        if theta.len() != self.dim() {
            return Err(Error::Validation(format!(
                "expected {} parameters, got {}",
                self.dim(),
                theta.len()
            )));
        }
        for (i, (&t, &(lo, hi))) in theta.iter().zip(&self.model.parameter_bounds()).enumerate() {
            if !t.is_finite() || t < lo || t > hi {
                return Err(Error::Validation(format!(
                    "parameter {} = {} outside bounds ({}, {})",
                    i, t, lo, hi
                )));
            }
        }
        Ok(self.transform.inverse(theta))
    }

    /// Map unconstrained -> constrained.
    pub fn to_constrained(&self, z: &[f64]) -> Vec<f64> {
        self.transform.forward(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glm::tests::toy_dataset;
    use crate::glm::{Family, GlmModel};
    use crate::prior::{CoefficientPrior, PriorSpec, RegularizedHorseshoe};
    use vs_prob::Link;

    fn hs_model() -> GlmModel {
        let data = toy_dataset(30, 2, Family::Gaussian, 11);
        let prior = PriorSpec::with_coefficients(CoefficientPrior::RegularizedHorseshoe(
            RegularizedHorseshoe { global_scale: 0.5, ..Default::default() },
        ));
        GlmModel::new(data, Family::Gaussian, &prior).unwrap()
    }

    #[test]
    fn test_logpdf_equals_neg_nll() {
        let model = hs_model();
        let post = Posterior::new(&model);
        let theta = model.parameter_init();
        let lp = post.logpdf(&theta).unwrap();
        assert!((lp + model.nll(&theta).unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_unconstrained_logpdf_includes_log_jac() {
        let model = hs_model();
        let post = Posterior::new(&model);
        let theta = model.parameter_init();
        let z = post.to_unconstrained(&theta).unwrap();
        let back = post.to_constrained(&z);
        for (a, b) in theta.iter().zip(&back) {
            assert!((a - b).abs() < 1e-10 * a.abs().max(1.0));
        }
        let diff = post.logpdf_unconstrained(&z).unwrap()
            - post.logpdf(&theta).unwrap()
            - post.transform().log_abs_det_jacobian(&z);
        assert!(diff.abs() < 1e-10, "diff = {}", diff);
    }

    #[test]
    fn test_unconstrained_grad_vs_finite_diff() {
        let data = toy_dataset(30, 2, Family::Binomial { link: Link::Probit }, 4);
        let prior = PriorSpec::with_coefficients(CoefficientPrior::RegularizedHorseshoe(
            RegularizedHorseshoe { global_scale: 0.5, ..Default::default() },
        ));
        let model = GlmModel::new(data, Family::Binomial { link: Link::Probit }, &prior).unwrap();
        let post = Posterior::new(&model);
        let z: Vec<f64> = (0..post.dim()).map(|i| 0.1 * i as f64 - 0.3).collect();
        let (lp, grad) = post.logpdf_grad_unconstrained(&z).unwrap();
        assert!((lp - post.logpdf_unconstrained(&z).unwrap()).abs() < 1e-10);

        let eps = 1e-6;
        for i in 0..z.len() {
            let mut zp = z.clone();
            let mut zm = z.clone();
            zp[i] += eps;
            zm[i] -= eps;
            let fd = (post.logpdf_unconstrained(&zp).unwrap()
                - post.logpdf_unconstrained(&zm).unwrap())
                / (2.0 * eps);
            let scale = grad[i].abs().max(1.0);
            assert!((grad[i] - fd).abs() / scale < 1e-4, "grad[{}]={} fd={}", i, grad[i], fd);
        }
    }

    #[test]
    fn test_to_unconstrained_rejects_out_of_bounds() {
        let model = hs_model();
        let post = Posterior::new(&model);
        let mut theta = model.parameter_init();
        let last = theta.len() - 1;
        theta[last] = -1.0;
        assert!(post.to_unconstrained(&theta).is_err());
        assert!(post.to_unconstrained(&theta[..2]).is_err());
    }
}

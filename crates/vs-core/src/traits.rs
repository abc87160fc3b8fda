//! Core traits for varsel
//!
//! Samplers and optimizers depend on [`LogDensityModel`], never on a concrete
//! model type. A model exposes its negative log-density in *constrained* space
//! together with parameter bounds; the inference layer handles transforms.

use crate::Result;

/// Prepared negative log-likelihood evaluator.
///
/// Some models can precompute constants to speed up repeated NLL evaluations.
/// The inference layer prefers `prepared().nll(...)` when available.
pub trait PreparedNll: Send + Sync {
    /// Compute negative log-likelihood at `params`.
    fn nll(&self, params: &[f64]) -> Result<f64>;
}

/// Default prepared wrapper that forwards to the model's `nll`.
#[derive(Debug, Clone, Copy)]
pub struct PreparedModelRef<'a, M: LogDensityModel + ?Sized> {
    model: &'a M,
}

impl<'a, M: LogDensityModel + ?Sized> PreparedModelRef<'a, M> {
    /// Create a new prepared wrapper that forwards `nll` to the model.
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }
}

impl<M: LogDensityModel + ?Sized> PreparedNll for PreparedModelRef<'_, M> {
    fn nll(&self, params: &[f64]) -> Result<f64> {
        self.model.nll(params)
    }
}

/// Universal model interface for MAP optimisation and NUTS sampling.
///
/// `nll` is the negative log *posterior* density (likelihood plus priors) up to an
/// additive constant, evaluated in constrained space.
pub trait LogDensityModel: Send + Sync {
    /// Prepared evaluator type (can cache constants).
    ///
    /// If a model has nothing to cache, use:
    /// `type Prepared<'a> = PreparedModelRef<'a, Self> where Self: 'a;`
    type Prepared<'a>: PreparedNll + 'a
    where
        Self: 'a;

    /// Number of parameters.
    fn dim(&self) -> usize;

    /// Parameter names (stable order).
    fn parameter_names(&self) -> Vec<String>;

    /// Parameter bounds (min, max) (stable order).
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Suggested initial values (stable order).
    fn parameter_init(&self) -> Vec<f64>;

    /// Negative log-density.
    fn nll(&self, params: &[f64]) -> Result<f64>;

    /// Gradient of NLL.
    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>>;

    /// Create a prepared evaluator.
    fn prepared(&self) -> Self::Prepared<'_>;

    /// Hint: prefer evaluating NLL and gradient together in one call.
    ///
    /// When this returns `true`, the optimizer calls [`Self::nll_grad_prepared`]
    /// from the cost function and caches the gradient for the next gradient callback.
    fn prefer_fused_eval_grad(&self) -> bool {
        false
    }

    /// Compute NLL and gradient, optionally using prepared caches.
    fn nll_grad_prepared(
        &self,
        prepared: &Self::Prepared<'_>,
        params: &[f64],
    ) -> Result<(f64, Vec<f64>)> {
        Ok((prepared.nll(params)?, self.grad_nll(params)?))
    }
}

//! Euclidean metric, phase-space state and leapfrog integrator.
//!
//! The NUTS sampler in [`crate::nuts`] builds its trajectories from these.

use crate::posterior::Posterior;
use nalgebra::{DMatrix, DVector};
use rand_distr::{Distribution, StandardNormal};
use vs_core::traits::LogDensityModel;
use vs_core::{Error, Result};

/// Euclidean metric for HMC/NUTS.
///
/// Stores the *inverse* mass matrix, which is what the position update
/// `dq/dt = M^{-1} p` and the kinetic energy `K = 0.5 p^T M^{-1} p` need.
/// The dense variant keeps the Cholesky factor `L` of `M^{-1} = L L^T` so that
/// momenta `p ~ N(0, M)` come from solving `L^T p = z`.
#[derive(Debug, Clone)]
pub enum Metric {
    /// Diagonal inverse mass matrix.
    Diag(Vec<f64>),
    /// Dense inverse mass matrix with its lower Cholesky factor.
    Dense {
        /// `M^{-1}`.
        inv_mass: DMatrix<f64>,
        /// Lower-triangular `L` with `M^{-1} = L L^T`.
        chol: DMatrix<f64>,
    },
}

impl Metric {
    /// Unit metric.
    pub fn identity(dim: usize) -> Self {
        Self::Diag(vec![1.0; dim])
    }

    /// Dense metric from an inverse mass matrix (must be positive definite).
    pub fn dense(inv_mass: DMatrix<f64>) -> Result<Self> {
        if !inv_mass.is_square() {
            return Err(Error::Validation("inverse mass matrix must be square".to_string()));
        }
        let chol = nalgebra::linalg::Cholesky::new(inv_mass.clone())
            .ok_or_else(|| {
                Error::Computation("inverse mass matrix is not positive definite".to_string())
            })?
            .l();
        Ok(Self::Dense { inv_mass, chol })
    }

    /// Dimension.
    pub fn dim(&self) -> usize {
        match self {
            Metric::Diag(v) => v.len(),
            Metric::Dense { inv_mass, .. } => inv_mass.nrows(),
        }
    }

    /// `M^{-1} p`.
    pub fn mul_inv_mass(&self, p: &[f64]) -> Vec<f64> {
        match self {
            Metric::Diag(d) => d.iter().zip(p).map(|(&m, &pi)| m * pi).collect(),
            Metric::Dense { inv_mass, .. } => {
                let v = inv_mass * DVector::from_column_slice(p);
                v.as_slice().to_vec()
            }
        }
    }

    /// Kinetic energy `0.5 p^T M^{-1} p`.
    pub fn kinetic_energy(&self, p: &[f64]) -> f64 {
        let v = self.mul_inv_mass(p);
        0.5 * p.iter().zip(&v).map(|(&pi, &vi)| pi * vi).sum::<f64>()
    }

    /// Draw `p ~ N(0, M)`.
    pub fn sample_momentum(&self, rng: &mut impl rand::Rng) -> Vec<f64> {
        let z: Vec<f64> = (0..self.dim()).map(|_| StandardNormal.sample(rng)).collect();
        match self {
            Metric::Diag(d) => d
                .iter()
                .zip(&z)
                .map(|(&inv_m, &zi)| if inv_m > 0.0 { zi / inv_m.sqrt() } else { zi })
                .collect(),
            Metric::Dense { chol, .. } => {
                let zv = DVector::from_vec(z.clone());
                match chol.transpose().solve_upper_triangular(&zv) {
                    Some(p) => p.as_slice().to_vec(),
                    None => z,
                }
            }
        }
    }

    /// Diagonal of the inverse mass matrix (for reporting).
    pub fn inv_mass_diag(&self) -> Vec<f64> {
        match self {
            Metric::Diag(d) => d.clone(),
            Metric::Dense { inv_mass, .. } => inv_mass.diagonal().as_slice().to_vec(),
        }
    }
}

/// Phase-space state: position, momentum and cached potential/gradient.
#[derive(Debug, Clone)]
pub struct HmcState {
    /// Position in unconstrained space.
    pub q: Vec<f64>,
    /// Momentum.
    pub p: Vec<f64>,
    /// Potential energy `-logpdf_unconstrained(q)`.
    pub potential: f64,
    /// Gradient of the potential.
    pub grad_potential: Vec<f64>,
}

impl HmcState {
    /// Total Hamiltonian `H = U(q) + K(p)`.
    pub fn hamiltonian(&self, metric: &Metric) -> f64 {
        self.potential + metric.kinetic_energy(&self.p)
    }
}

/// Leapfrog integrator.
pub struct LeapfrogIntegrator<'a, 'b, M: LogDensityModel + ?Sized> {
    posterior: &'a Posterior<'b, M>,
    step_size: f64,
    metric: Metric,
}

impl<'a, 'b, M: LogDensityModel + ?Sized> LeapfrogIntegrator<'a, 'b, M> {
    /// Create a new integrator.
    pub fn new(posterior: &'a Posterior<'b, M>, step_size: f64, metric: Metric) -> Self {
        Self { posterior, step_size, metric }
    }

    /// Update the step size (during adaptation).
    pub fn set_step_size(&mut self, eps: f64) {
        self.step_size = eps;
    }

    /// Replace the metric (during adaptation).
    pub fn set_metric(&mut self, metric: Metric) {
        self.metric = metric;
    }

    /// Current step size.
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Current metric.
    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Evaluate potential and gradient at `q` (momentum zero).
    pub fn init_state(&self, q: Vec<f64>) -> Result<HmcState> {
        let (lp, grad_lp) = self.posterior.logpdf_grad_unconstrained(&q)?;
        let grad_potential: Vec<f64> = grad_lp.iter().map(|&g| -g).collect();
        Ok(HmcState { p: vec![0.0; q.len()], q, potential: -lp, grad_potential })
    }

    /// One leapfrog step in `direction` (`+1` forward, `-1` backward).
    ///
    /// Returns `Err` when the density cannot be evaluated at the new position.
    pub fn step_dir(&self, state: &mut HmcState, direction: i32) -> Result<()> {
        let eps = self.step_size * f64::from(direction);
        self.step_with_eps(state, eps)
    }

    /// One leapfrog step with an explicit (signed) step size.
    pub fn step_with_eps(&self, state: &mut HmcState, eps: f64) -> Result<()> {
        for (p, g) in state.p.iter_mut().zip(&state.grad_potential) {
            *p -= 0.5 * eps * g;
        }
        let v = self.metric.mul_inv_mass(&state.p);
        for (q, vi) in state.q.iter_mut().zip(&v) {
            *q += eps * vi;
        }
        let (lp, grad_lp) = self.posterior.logpdf_grad_unconstrained(&state.q)?;
        state.potential = -lp;
        for (gp, g) in state.grad_potential.iter_mut().zip(&grad_lp) {
            *gp = -g;
        }
        for (p, g) in state.p.iter_mut().zip(&state.grad_potential) {
            *p -= 0.5 * eps * g;
        }
        Ok(())
    }
}

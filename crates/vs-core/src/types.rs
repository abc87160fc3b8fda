//! Common data types for varsel

use serde::{Deserialize, Serialize};

/// Point-estimate fit result (MAP / MLE) with optional curvature-based uncertainties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Best-fit parameter values
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal), NaN when unavailable
    pub uncertainties: Vec<f64>,

    /// Negative log-density at the optimum
    pub nll: f64,

    /// Convergence status
    pub converged: bool,

    /// Number of optimizer iterations
    pub n_iter: u64,

    /// Human-readable warnings (e.g. poorly identified parameters)
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl FitResult {
    /// Create a new fit result
    pub fn new(
        parameters: Vec<f64>,
        uncertainties: Vec<f64>,
        nll: f64,
        converged: bool,
        n_iter: u64,
    ) -> Self {
        Self { parameters, uncertainties, nll, converged, n_iter, warnings: Vec::new() }
    }
}

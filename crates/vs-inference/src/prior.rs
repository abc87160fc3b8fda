//! Prior specifications for GLM coefficients, intercept and the Gaussian noise scale.
//!
//! A [`PriorSpec`] is what the caller writes down; [`PriorSpec::resolve`] turns it into
//! the concrete hyperparameters used by the model once the family and response are
//! known (autoscaling for the Gaussian family happens there).

use crate::glm::Family;
use serde::{Deserialize, Serialize};
use vs_core::{Error, Result};

/// Regularized horseshoe (Piironen & Vehtari 2017), non-centered.
///
/// `beta_j = z_j * tau * lambda_tilde_j` with
/// `lambda_tilde_j^2 = c^2 lambda_j^2 / (c^2 + tau^2 lambda_j^2)` and
/// `c = slab_scale * sqrt(caux)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularizedHorseshoe {
    /// Degrees of freedom of the half-t on local scales `lambda_j`.
    pub df: f64,
    /// Degrees of freedom of the half-t on the global scale `tau`.
    pub global_df: f64,
    /// Scale of the half-t on `tau` (multiplied by sigma for the Gaussian family).
    pub global_scale: f64,
    /// Degrees of freedom of the slab; `caux ~ InvGamma(slab_df/2, slab_df/2)`.
    pub slab_df: f64,
    /// Slab scale.
    pub slab_scale: f64,
}

impl Default for RegularizedHorseshoe {
    fn default() -> Self {
        Self { df: 1.0, global_df: 1.0, global_scale: 0.01, slab_df: 4.0, slab_scale: 2.5 }
    }
}

impl RegularizedHorseshoe {
    /// Horseshoe with `global_scale = (p0 / (P - p0)) / sqrt(N)` for a prior guess of
    /// `p0` relevant covariates out of `n_covariates`.
    pub fn from_guess(p0: f64, n_covariates: usize, n_obs: usize) -> Result<Self> {
        let p = n_covariates as f64;
        if !(p0.is_finite() && p0 > 0.0 && p0 < p) {
            return Err(Error::Validation(format!(
                "prior guess p0 must satisfy 0 < p0 < {}, got {}",
                n_covariates, p0
            )));
        }
        if n_obs == 0 {
            return Err(Error::Validation("n_obs must be > 0".into()));
        }
        let tau0 = (p0 / (p - p0)) / (n_obs as f64).sqrt();
        Ok(Self { global_scale: tau0, ..Self::default() })
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("df", self.df),
            ("global_df", self.global_df),
            ("global_scale", self.global_scale),
            ("slab_df", self.slab_df),
            ("slab_scale", self.slab_scale),
        ];
        for (name, v) in fields {
            if !(v.is_finite() && v > 0.0) {
                return Err(Error::Validation(format!("horseshoe {} must be > 0, got {}", name, v)));
            }
        }
        Ok(())
    }
}

/// Prior on the regression coefficients (covariates are assumed standardized).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoefficientPrior {
    /// Independent `N(location, scale)`.
    Normal {
        /// Location.
        location: f64,
        /// Scale.
        scale: f64,
    },
    /// Independent Student-t.
    StudentT {
        /// Degrees of freedom.
        df: f64,
        /// Location.
        location: f64,
        /// Scale.
        scale: f64,
    },
    /// Regularized horseshoe shrinkage prior.
    RegularizedHorseshoe(RegularizedHorseshoe),
}

impl Default for CoefficientPrior {
    fn default() -> Self {
        CoefficientPrior::Normal { location: 0.0, scale: 2.5 }
    }
}

impl CoefficientPrior {
    /// Short name for reports.
    pub fn name(&self) -> &'static str {
        match self {
            CoefficientPrior::Normal { .. } => "normal",
            CoefficientPrior::StudentT { .. } => "student_t",
            CoefficientPrior::RegularizedHorseshoe(_) => "hs",
        }
    }

    /// Whether this prior uses the non-centered horseshoe parameterisation.
    pub fn is_horseshoe(&self) -> bool {
        matches!(self, CoefficientPrior::RegularizedHorseshoe(_))
    }
}

/// Full prior specification for a GLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorSpec {
    /// Prior on the coefficients.
    pub coefficients: CoefficientPrior,
    /// Intercept prior location (for the Gaussian family with `autoscale`, `mean(y)` is used).
    pub intercept_location: f64,
    /// Intercept prior scale.
    pub intercept_scale: f64,
    /// Rate of the exponential prior on the Gaussian `sigma`.
    pub aux_rate: f64,
    /// Scale coefficient/intercept priors by `sd(y)` for the Gaussian family.
    pub autoscale: bool,
}

impl Default for PriorSpec {
    fn default() -> Self {
        Self {
            coefficients: CoefficientPrior::default(),
            intercept_location: 0.0,
            intercept_scale: 2.5,
            aux_rate: 1.0,
            autoscale: true,
        }
    }
}

impl PriorSpec {
    /// Default spec with the given coefficient prior.
    pub fn with_coefficients(coefficients: CoefficientPrior) -> Self {
        Self { coefficients, ..Self::default() }
    }

    /// Validate hyperparameters.
    pub fn validate(&self) -> Result<()> {
        match &self.coefficients {
            CoefficientPrior::Normal { location, scale } => {
                if !location.is_finite() || !(scale.is_finite() && *scale > 0.0) {
                    return Err(Error::Validation(format!(
                        "normal prior needs finite location and scale > 0, got ({}, {})",
                        location, scale
                    )));
                }
            }
            CoefficientPrior::StudentT { df, location, scale } => {
                if !location.is_finite()
                    || !(scale.is_finite() && *scale > 0.0)
                    || !(df.is_finite() && *df > 0.0)
                {
                    return Err(Error::Validation(format!(
                        "student_t prior needs df > 0, finite location, scale > 0, got ({}, {}, {})",
                        df, location, scale
                    )));
                }
            }
            CoefficientPrior::RegularizedHorseshoe(hs) => hs.validate()?,
        }
        if !self.intercept_location.is_finite()
            || !(self.intercept_scale.is_finite() && self.intercept_scale > 0.0)
        {
            return Err(Error::Validation("intercept prior needs a finite location and scale > 0".into()));
        }
        if !(self.aux_rate.is_finite() && self.aux_rate > 0.0) {
            return Err(Error::Validation(format!("aux_rate must be > 0, got {}", self.aux_rate)));
        }
        Ok(())
    }

    /// Resolve into concrete hyperparameters for `family` and response `y`.
    pub fn resolve(&self, family: &Family, y: &[f64]) -> Result<ResolvedPrior> {
        self.validate()?;
        let gaussian = matches!(family, Family::Gaussian);
        let (scale_mult, intercept_location) = if gaussian && self.autoscale {
            let sd = vs_prob::math::sample_variance(y).sqrt();
            let sd = if sd.is_finite() && sd > 0.0 { sd } else { 1.0 };
            (sd, vs_prob::math::mean(y))
        } else {
            (1.0, self.intercept_location)
        };

        let coefficients = match self.coefficients {
            CoefficientPrior::Normal { location, scale } => {
                CoefficientPrior::Normal { location, scale: scale * scale_mult }
            }
            CoefficientPrior::StudentT { df, location, scale } => {
                CoefficientPrior::StudentT { df, location, scale: scale * scale_mult }
            }
            CoefficientPrior::RegularizedHorseshoe(hs) => {
                CoefficientPrior::RegularizedHorseshoe(RegularizedHorseshoe {
                    slab_scale: hs.slab_scale * scale_mult,
                    ..hs
                })
            }
        };

        Ok(ResolvedPrior {
            coefficients,
            intercept_location,
            intercept_scale: self.intercept_scale * scale_mult,
            aux_rate: self.aux_rate / scale_mult,
        })
    }
}

/// Concrete prior hyperparameters after autoscaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPrior {
    /// Coefficient prior.
    pub coefficients: CoefficientPrior,
    /// Intercept location.
    pub intercept_location: f64,
    /// Intercept scale.
    pub intercept_scale: f64,
    /// Exponential rate on sigma.
    pub aux_rate: f64,
}

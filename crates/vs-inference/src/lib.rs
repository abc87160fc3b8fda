//! # vs-inference
//!
//! Bayesian GLMs, cross-validation and variable selection for varsel.
//!
//! This crate provides:
//! - Posterior sampling of Gaussian and binomial GLMs with NUTS
//! - PSIS-LOO, exact refits of problematic observations, K-fold CV and model comparison
//! - Projection-predictive forward variable selection
//!
//! ## Pipeline
//!
//! `Dataset` -> [`GlmFit`] -> [`LooResult`] -> [`VarselResult`]. Each stage only reads
//! the output of the previous one.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Adaptation: step-size dual averaging and windowed mass-matrix estimation.
pub mod adapt;
/// Chain storage and multi-chain parallel runner.
pub mod chain;
/// Dataset preparation and standardization.
pub mod data;
/// MCMC diagnostics: rank-normalized R-hat, bulk/tail ESS, quality gates.
pub mod diagnostics;
/// Fitted GLM: draws, summaries, pointwise log-likelihood.
pub mod fit;
/// GLM log-density with priors.
pub mod glm;
/// HMC leapfrog integrator and metrics.
pub mod hmc;
/// PSIS-LOO, reloo, K-fold CV, model comparison.
pub mod loo;
/// MAP estimation (sampler initialization).
pub mod map;
/// NUTS tree-building and sampling.
pub mod nuts;
/// Generic numerical optimizer (L-BFGS backend).
pub mod optimizer;
/// Posterior API: log-pdf, gradient, transforms.
pub mod posterior;
/// Prior specification.
pub mod prior;
/// Projection of reference draws onto covariate subsets.
pub mod projection;
/// Pareto-smoothed importance sampling.
pub mod psis;
/// Forward search and suggested model size.
pub mod varsel;

pub use chain::{Chain, SamplerResult, sample_nuts_multichain};
pub use data::Dataset;
pub use diagnostics::{DiagnosticsResult, QualityGates, QualityStatus, QualitySummary};
pub use fit::{GlmFit, ParameterSummary, SamplerConfig};
pub use glm::{Coefficients, Family, GlmModel};
pub use loo::{
    CvEstimator, LogLikMatrix, LooComparison, LooResult, kfold, loo, loo_compare, loo_fit, reloo,
};
pub use map::MapEstimator;
pub use nuts::{NutsConfig, sample_nuts};
pub use optimizer::{LbfgsOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use posterior::Posterior;
pub use prior::{CoefficientPrior, PriorSpec, RegularizedHorseshoe};
pub use projection::{Projection, project_submodel};
pub use psis::{ParetoKCategory, PsisConfig};
pub use varsel::{Baseline, CvMethod, SearchCriterion, SearchState, VarselConfig, VarselResult, varsel};
pub use vs_prob::Link;

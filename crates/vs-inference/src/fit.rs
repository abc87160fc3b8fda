//! A fitted Bayesian GLM: multi-chain NUTS draws, diagnostics and derived quantities.

use crate::chain::{SamplerResult, sample_nuts_multichain};
use crate::data::Dataset;
use crate::diagnostics::{
    DiagnosticsResult, QualityGates, QualityStatus, QualitySummary, compute_diagnostics, ess_bulk,
    ess_tail, quality_summary, rank_normalized_rhat,
};
use crate::glm::{Coefficients, Family, GlmModel};
use crate::loo::LogLikMatrix;
use crate::nuts::NutsConfig;
use crate::prior::PriorSpec;
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use vs_core::{Error, Result};
use vs_prob::math::{mean, quantile_sorted, sample_variance};

/// Default central credible interval mass for summaries.
pub const DEFAULT_INTERVAL_PROB: f64 = 0.9;

/// Available cores capped at 4.
pub fn default_n_chains() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).clamp(1, 4)
}

/// Multi-chain sampler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of chains.
    pub n_chains: usize,
    /// Warmup iterations per chain.
    pub n_warmup: usize,
    /// Post-warmup draws per chain.
    pub n_samples: usize,
    /// Base seed; chain `c` uses `seed + c`.
    pub seed: u64,
    /// NUTS settings.
    pub nuts: NutsConfig,
    /// Quality gates applied after sampling.
    pub gates: QualityGates,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_chains: default_n_chains(),
            n_warmup: 1000,
            n_samples: 1000,
            seed: 42,
            nuts: NutsConfig::default(),
            gates: QualityGates::default(),
        }
    }
}

/// Posterior summary of one scalar quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    /// Quantity name.
    pub name: String,
    /// Posterior mean.
    pub mean: f64,
    /// Posterior standard deviation.
    pub sd: f64,
    /// Lower end of the central interval.
    pub lower: f64,
    /// Posterior median.
    pub median: f64,
    /// Upper end of the central interval.
    pub upper: f64,
    /// Interval mass.
    pub prob: f64,
    /// Rank-normalized split R-hat (`NaN` when chain structure is unavailable).
    pub r_hat: f64,
    /// Bulk ESS.
    pub ess_bulk: f64,
    /// Tail ESS.
    pub ess_tail: f64,
}

impl ParameterSummary {
    /// Summarize draws split by chain.
    pub fn from_chains(name: impl Into<String>, chains: &[Vec<f64>], prob: f64) -> Self {
        let refs: Vec<&[f64]> = chains.iter().map(|c| c.as_slice()).collect();
        let pooled: Vec<f64> = chains.iter().flatten().copied().collect();
        let mut s = Self::from_draws(name, &pooled, prob);
        if chains.len() > 1 {
            s.r_hat = rank_normalized_rhat(&refs);
            s.ess_bulk = ess_bulk(&refs);
            s.ess_tail = ess_tail(&refs);
        }
        s
    }

    /// Summarize pooled draws without chain structure.
    pub fn from_draws(name: impl Into<String>, draws: &[f64], prob: f64) -> Self {
        let mut sorted = draws.to_vec();
        sorted.sort_by(f64::total_cmp);
        let alpha = (1.0 - prob) / 2.0;
        Self {
            name: name.into(),
            mean: mean(draws),
            sd: sample_variance(draws).sqrt(),
            lower: quantile_sorted(&sorted, alpha),
            median: quantile_sorted(&sorted, 0.5),
            upper: quantile_sorted(&sorted, 1.0 - alpha),
            prob,
            r_hat: f64::NAN,
            ess_bulk: f64::NAN,
            ess_tail: f64::NAN,
        }
    }

    /// Whether `value` lies inside the central interval.
    pub fn interval_contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

pub(crate) fn check_interval_prob(prob: f64) -> Result<()> {
    if !(prob > 0.0 && prob < 1.0) {
        return Err(Error::Validation(format!("interval probability must be in (0, 1), got {}", prob)));
    }
    Ok(())
}

/// A GLM fitted by multi-chain NUTS.
#[derive(Debug, Clone)]
pub struct GlmFit {
    model: GlmModel,
    config: SamplerConfig,
    samples: SamplerResult,
    coefficients: Vec<Coefficients>,
    diagnostics: DiagnosticsResult,
    quality: QualitySummary,
}

impl GlmFit {
    /// Fit `family` with `prior` to `dataset` (standardize covariates beforehand).
    pub fn fit(
        dataset: &Dataset,
        family: Family,
        prior: &PriorSpec,
        config: &SamplerConfig,
    ) -> Result<Self> {
        if !dataset.is_standardized() && dataset.n_covariates() > 0 {
            tracing::debug!("fitting on covariates that were not standardized");
        }
        let model = GlmModel::new(dataset.clone(), family, prior)?;
        Self::from_model(model, config)
    }

    /// Sample an already constructed model.
    pub fn from_model(model: GlmModel, config: &SamplerConfig) -> Result<Self> {
        tracing::info!(
            family = %model.family(),
            prior = model.prior_spec().coefficients.name(),
            n_obs = model.data().n_obs(),
            n_covariates = model.n_covariates(),
            n_chains = config.n_chains,
            "sampling posterior"
        );
        let samples = sample_nuts_multichain(
            &model,
            config.n_chains,
            config.n_warmup,
            config.n_samples,
            config.seed,
            &config.nuts,
        )?;
        let coefficients = samples
            .pooled_draws()
            .map(|d| model.coefficients(d))
            .collect::<Result<Vec<_>>>()?;
        let diagnostics = compute_diagnostics(&samples);
        let quality = quality_summary(
            &diagnostics,
            samples.chains.len(),
            config.n_samples,
            config.nuts.target_accept,
            &config.gates,
        );
        match quality.status {
            QualityStatus::Fail => {
                tracing::warn!(failures = ?quality.failures, "sampling failed quality gates")
            }
            QualityStatus::Warn => tracing::warn!(warnings = ?quality.warnings, "sampling warnings"),
            QualityStatus::Ok => {}
        }
        tracing::info!(
            status = %quality.status,
            max_r_hat = quality.max_r_hat,
            n_divergent = diagnostics.n_divergent,
            "sampling done"
        );
        Ok(Self { model, config: config.clone(), samples, coefficients, diagnostics, quality })
    }

    /// Refit the same family, prior and sampler settings on `data`.
    pub fn refit(&self, data: &Dataset) -> Result<Self> {
        let model = self.model.with_data(data.clone())?;
        Self::from_model(model, &self.config)
    }

    /// The fitted model.
    pub fn model(&self) -> &GlmModel {
        &self.model
    }

    /// Training data.
    pub fn dataset(&self) -> &Dataset {
        self.model.data()
    }

    /// Likelihood family.
    pub fn family(&self) -> Family {
        self.model.family()
    }

    /// Sampler settings used for this fit.
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Raw chains.
    pub fn samples(&self) -> &SamplerResult {
        &self.samples
    }

    /// Sampler diagnostics.
    pub fn diagnostics(&self) -> &DiagnosticsResult {
        &self.diagnostics
    }

    /// Quality gate outcome.
    pub fn quality(&self) -> &QualitySummary {
        &self.quality
    }

    /// Total number of draws `S`.
    pub fn n_draws(&self) -> usize {
        self.coefficients.len()
    }

    /// Draw count per chain.
    pub fn chain_lengths(&self) -> Vec<usize> {
        self.samples.chain_lengths()
    }

    /// Derived coefficients per draw, chains concatenated.
    pub fn coefficients(&self) -> &[Coefficients] {
        &self.coefficients
    }

    /// `"(Intercept)"` followed by covariate names.
    pub fn coefficient_names(&self) -> Vec<String> {
        self.model.coefficient_names()
    }

    /// `S x (1 + P)` matrix of (intercept, beta) draws.
    pub fn coefficient_draws(&self) -> DMatrix<f64> {
        let p = self.model.n_covariates();
        DMatrix::from_fn(self.coefficients.len(), 1 + p, |s, j| {
            let c = &self.coefficients[s];
            if j == 0 { c.intercept } else { c.beta[j - 1] }
        })
    }

    /// Residual SD draws (Gaussian family only).
    pub fn sigma_draws(&self) -> Option<Vec<f64>> {
        self.coefficients.iter().map(|c| c.sigma).collect()
    }

    /// Posterior mean of (intercept, beta).
    pub fn coefficient_means(&self) -> Vec<f64> {
        let draws = self.coefficient_draws();
        draws.column_iter().map(|c| c.mean()).collect()
    }

    /// Pointwise log-likelihood on the training data, `N x S`.
    pub fn log_lik(&self) -> Result<LogLikMatrix> {
        self.log_lik_on(self.model.data())
    }

    /// Pointwise log predictive density of `data` under every draw, `N x S`.
    pub fn log_lik_on(&self, data: &Dataset) -> Result<LogLikMatrix> {
        if data.n_covariates() != self.model.n_covariates() {
            return Err(Error::Validation(format!(
                "data has {} covariates, model has {}",
                data.n_covariates(),
                self.model.n_covariates()
            )));
        }
        let family = self.model.family();
        let per_draw: Vec<Vec<f64>> = self
            .coefficients
            .par_iter()
            .map(|c| {
                (0..data.n_obs())
                    .map(|i| family.log_lik(data.y()[i], data.trials()[i], c.eta(data.row(i)), c.sigma))
                    .collect()
            })
            .collect();
        LogLikMatrix::from_draws(&per_draw, Some(self.chain_lengths()))
    }

    /// Summaries of intercept, coefficients and `sigma` with a 90% interval.
    pub fn summary(&self) -> Vec<ParameterSummary> {
        self.build_summary(DEFAULT_INTERVAL_PROB)
    }

    /// Summaries with a central interval of mass `prob`.
    pub fn summary_with_prob(&self, prob: f64) -> Result<Vec<ParameterSummary>> {
        check_interval_prob(prob)?;
        Ok(self.build_summary(prob))
    }

    fn build_summary(&self, prob: f64) -> Vec<ParameterSummary> {
        let lengths = self.chain_lengths();
        let by_chain = |f: &dyn Fn(&Coefficients) -> f64| -> Vec<Vec<f64>> {
            let mut out = Vec::with_capacity(lengths.len());
            let mut start = 0;
            for &len in &lengths {
                out.push(self.coefficients[start..start + len].iter().map(f).collect());
                start += len;
            }
            out
        };
        let mut out = Vec::with_capacity(self.model.n_covariates() + 2);
        for (j, name) in self.coefficient_names().into_iter().enumerate() {
            let chains = if j == 0 { by_chain(&|c| c.intercept) } else { by_chain(&|c| c.beta[j - 1]) };
            out.push(ParameterSummary::from_chains(name, &chains, prob));
        }
        if self.model.family().has_sigma() {
            let chains = by_chain(&|c| c.sigma.unwrap_or(f64::NAN));
            out.push(ParameterSummary::from_chains("sigma", &chains, prob));
        }
        out
    }

    /// `Err(Error::Convergence)` when the quality gates failed.
    pub fn require_converged(&self) -> Result<()> {
        if self.quality.status == QualityStatus::Fail {
            return Err(Error::Convergence(self.quality.failures.join("; ")));
        }
        Ok(())
    }
}

//! `varsel run` orchestration: one JSON config drives fit, LOO and selection.

use crate::data_io::{DatasetConfig, load_dataset};
use crate::report::{self, BundleMeta};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use vs_inference::{
    CoefficientPrior, Dataset, Family, GlmFit, Link, PriorSpec, PsisConfig, RegularizedHorseshoe,
    SamplerConfig, VarselConfig, kfold, loo_fit, reloo, varsel,
};

/// Response family name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FamilyKind {
    #[default]
    Gaussian,
    Binomial,
}

/// Coefficient prior name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PriorKind {
    #[default]
    Normal,
    #[value(alias = "student_t")]
    StudentT,
    #[serde(alias = "hs")]
    #[value(alias = "hs")]
    Horseshoe,
}

/// Target acceptance used for the horseshoe when none is given.
pub const HORSESHOE_TARGET_ACCEPT: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub family: FamilyKind,
    /// Link for the binomial family.
    pub link: Link,
    pub prior: PriorKind,
    /// Prior guess of the number of relevant covariates (horseshoe only).
    pub p0: Option<f64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { family: FamilyKind::Gaussian, link: Link::Logit, prior: PriorKind::Normal, p0: None }
    }
}

impl ModelConfig {
    pub fn family(&self) -> Family {
        match self.family {
            FamilyKind::Gaussian => Family::Gaussian,
            FamilyKind::Binomial => Family::Binomial { link: self.link },
        }
    }

    /// Settings usable for a submodel with `n_covariates` covariates.
    ///
    /// The horseshoe needs at least one covariate and `p0 < n_covariates`: an
    /// intercept-only submodel falls back to the normal prior and `p0` is clamped.
    pub fn for_submodel(&self, n_covariates: usize) -> ModelConfig {
        if self.prior != PriorKind::Horseshoe {
            return self.clone();
        }
        if n_covariates == 0 {
            tracing::info!("intercept-only submodel: using the normal prior instead of the horseshoe");
            return ModelConfig { prior: PriorKind::Normal, p0: None, ..self.clone() };
        }
        let p = n_covariates as f64;
        match self.p0 {
            Some(p0) if p0 >= p => {
                let clamped = p - 0.5;
                tracing::info!(p0, clamped, n_covariates, "clamped p0 for submodel");
                ModelConfig { p0: Some(clamped), ..self.clone() }
            }
            _ => self.clone(),
        }
    }

    pub fn prior(&self, data: &Dataset) -> Result<PriorSpec> {
        if self.p0.is_some() && self.prior != PriorKind::Horseshoe {
            tracing::warn!("p0 is only used by the horseshoe prior; ignoring it");
        }
        let coefficients = match self.prior {
            PriorKind::Normal => CoefficientPrior::default(),
            PriorKind::StudentT => CoefficientPrior::StudentT { df: 3.0, location: 0.0, scale: 2.5 },
            PriorKind::Horseshoe => CoefficientPrior::RegularizedHorseshoe(match self.p0 {
                Some(p0) => RegularizedHorseshoe::from_guess(p0, data.n_covariates(), data.n_obs())?,
                None => RegularizedHorseshoe::default(),
            }),
        };
        Ok(PriorSpec::with_coefficients(coefficients))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LooConfig {
    /// Refit the model for observations whose Pareto k exceeds the threshold.
    pub reloo: bool,
    /// Use K-fold CV with this many folds instead of PSIS.
    pub kfold: Option<usize>,
    /// Include pointwise elpd and k values in the output.
    pub pointwise: bool,
    pub psis: PsisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub loo: LooConfig,
    /// Run variable selection when present.
    #[serde(default)]
    pub selection: Option<VarselConfig>,
    /// Central posterior interval probability.
    #[serde(default = "default_interval_prob")]
    pub interval_prob: f64,
    /// Output file (pretty JSON). Defaults to stdout.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Threads (0 = auto).
    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_interval_prob() -> f64 {
    vs_inference::fit::DEFAULT_INTERVAL_PROB
}

fn default_threads() -> usize {
    0
}

pub fn read_run_config(path: &Path) -> Result<RunConfig> {
    let bytes = std::fs::read(path)?;
    let cfg: RunConfig = serde_json::from_slice(&bytes)?;
    Ok(cfg)
}

/// Load data and fit the reference model.
pub fn fit_reference(
    dataset: &DatasetConfig,
    model: &ModelConfig,
    sampler: &SamplerConfig,
) -> Result<GlmFit> {
    let data = load_dataset(dataset)?;
    let prior = model.prior(&data)?;
    let fit = GlmFit::fit(&data, model.family(), &prior, sampler)?;
    Ok(fit)
}

/// PSIS-LOO (optionally with refits) or K-fold CV of `fit`.
pub fn cross_validate(fit: &GlmFit, cfg: &LooConfig, seed: u64) -> Result<vs_inference::LooResult> {
    if let Some(k) = cfg.kfold {
        return Ok(kfold(fit, k, seed)?);
    }
    let res = loo_fit(fit, &cfg.psis)?;
    if cfg.reloo && !res.high_k_indices().is_empty() {
        return Ok(reloo(fit, &res)?);
    }
    Ok(res)
}

pub fn execute(cfg: &RunConfig) -> Result<serde_json::Value> {
    let fit = fit_reference(&cfg.dataset, &cfg.model, &cfg.sampler)?;
    let cv = cross_validate(&fit, &cfg.loo, cfg.sampler.seed)?;
    let selection = match &cfg.selection {
        Some(vcfg) => Some(report::varsel_report(&varsel(&fit, vcfg)?)),
        None => None,
    };

    let args = json!({
        "dataset": cfg.dataset,
        "model": cfg.model,
        "sampler": cfg.sampler,
        "loo": cfg.loo,
        "selection": cfg.selection,
        "interval_prob": cfg.interval_prob,
    });
    let meta = BundleMeta::new("run", args, &cfg.dataset.input)?;
    Ok(json!({
        "meta": meta,
        "fit": report::fit_report(&fit, cfg.interval_prob)?,
        "loo": report::loo_report(&cv, cfg.loo.pointwise),
        "selection": selection,
    }))
}

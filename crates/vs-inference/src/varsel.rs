//! Projection-predictive forward variable selection.
//!
//! Covariates are added one at a time; at every step each remaining candidate is
//! projected (see [`crate::projection`]) and scored, and the best one joins the
//! path. The predictive performance of every path prefix is then estimated with
//! PSIS-LOO (reusing the reference model's smoothed weights) or K-fold CV, and the
//! smallest size whose performance is indistinguishable from the baseline is
//! suggested.

use crate::data::Dataset;
use crate::fit::GlmFit;
use crate::loo::{
    LogLikMatrix, elpd_diff, fold_rows, kfold_split, loo_with_weights, psis_weights, relative_eff,
    weighted_elpd,
};
use crate::projection::{Projection, ProjectionReference};
use crate::psis::PsisConfig;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use vs_core::{Error, Result};
use vs_prob::math::{log_mean_exp, log_sum_exp, mean, sample_variance};

/// Tolerance of the suggested-size rule `diff + se_diff >= 0`.
const SIZE_RULE_TOL: f64 = 1e-10;

/// How candidates are ranked during the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchCriterion {
    /// Highest PSIS-LOO elpd of the submodel.
    #[default]
    Elpd,
    /// Lowest squared error of the LOO predictive mean.
    Mse,
    /// Lowest projection KL divergence on the training data.
    Kl,
}

/// What the per-size performance is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Baseline {
    /// The best submodel size on the curve.
    #[default]
    Best,
    /// The full reference model.
    Reference,
}

/// How the performance curve is cross-validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum CvMethod {
    /// PSIS-LOO with a single full-data search.
    #[default]
    Loo,
    /// Refit, search and score on `k` folds.
    #[serde(rename = "kfold")]
    KFold {
        /// Number of folds.
        k: usize,
    },
}

/// Variable selection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarselConfig {
    /// Largest submodel size to search (default: all covariates).
    pub max_size: Option<usize>,
    /// Candidate ranking.
    pub criterion: SearchCriterion,
    /// Baseline of the suggested-size rule.
    pub baseline: Baseline,
    /// Cross-validation of the performance curve.
    pub cv_method: CvMethod,
    /// Reference draws projected during the search.
    pub n_draws_search: usize,
    /// Reference draws projected for the performance curve.
    pub n_draws_pred: usize,
    /// PSIS settings for the reference LOO.
    pub psis: PsisConfig,
    /// Seed of the K-fold split.
    pub seed: u64,
}

impl Default for VarselConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            criterion: SearchCriterion::Elpd,
            baseline: Baseline::Best,
            cv_method: CvMethod::Loo,
            n_draws_search: 100,
            n_draws_pred: 400,
            psis: PsisConfig::default(),
            seed: 42,
        }
    }
}

impl VarselConfig {
    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if self.n_draws_search == 0 || self.n_draws_pred == 0 {
            return Err(Error::Validation("n_draws_search and n_draws_pred must be >= 1".into()));
        }
        if let CvMethod::KFold { k } = self.cv_method {
            if k < 2 {
                return Err(Error::Validation(format!("K-fold needs k >= 2, got {}", k)));
            }
        }
        self.psis.validate()
    }
}

/// Forward search progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchState {
    /// Not started.
    Init,
    /// Adding covariates; the path currently has `size` entries.
    Growing {
        /// Current path length.
        size: usize,
    },
    /// Path complete.
    Finalize,
    /// Finished.
    Done,
    /// A candidate evaluation failed.
    Aborted,
}

impl fmt::Display for SearchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchState::Init => write!(f, "init"),
            SearchState::Growing { size } => write!(f, "growing({})", size),
            SearchState::Finalize => write!(f, "finalize"),
            SearchState::Done => write!(f, "done"),
            SearchState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Scores projected submodels on one dataset with per-observation log weights over
/// the projected draws (PSIS-LOO weights, or uniform weights for held-out data).
struct PointwiseScorer<'a> {
    data: &'a Dataset,
    log_weights: Vec<Vec<f64>>,
}

/// Pointwise performance of one submodel.
struct Pointwise {
    elpd: Vec<f64>,
    sq_err: Vec<f64>,
}

impl<'a> PointwiseScorer<'a> {
    /// Reference PSIS weights restricted to `draws` and renormalized.
    fn restricted(data: &'a Dataset, full: &[Vec<f64>], draws: &[usize]) -> Self {
        let log_weights = full
            .iter()
            .map(|lw| {
                let sub: Vec<f64> = draws.iter().map(|&s| lw[s]).collect();
                let norm = log_sum_exp(&sub);
                sub.into_iter().map(|w| w - norm).collect()
            })
            .collect();
        Self { data, log_weights }
    }

    /// Equal weights over `n_draws` draws for every observation of `data`.
    fn uniform(data: &'a Dataset, n_draws: usize) -> Self {
        let w = -(n_draws as f64).ln();
        Self { data, log_weights: vec![vec![w; n_draws]; data.n_obs()] }
    }

    fn score(&self, proj: &Projection) -> Result<Pointwise> {
        let ll: LogLikMatrix = proj.log_lik_on(self.data)?;
        let mut elpd = Vec::with_capacity(self.data.n_obs());
        let mut sq_err = Vec::with_capacity(self.data.n_obs());
        for i in 0..self.data.n_obs() {
            let lw = &self.log_weights[i];
            elpd.push(weighted_elpd(lw, ll.row(i)));
            let row = self.data.row(i);
            let pred: f64 = lw.iter().enumerate().map(|(s, &w)| w.exp() * proj.mean(s, row)).sum();
            let observed = self.data.y()[i] / self.data.trials()[i];
            sq_err.push((observed - pred).powi(2));
        }
        Ok(Pointwise { elpd, sq_err })
    }
}

/// Higher is better; NaN ranks last.
fn candidate_score(
    criterion: SearchCriterion,
    scorer: &PointwiseScorer<'_>,
    proj: &Projection,
) -> Result<f64> {
    let v = match criterion {
        SearchCriterion::Elpd => scorer.score(proj)?.elpd.iter().sum::<f64>(),
        SearchCriterion::Mse => -mean(&scorer.score(proj)?.sq_err),
        SearchCriterion::Kl => -proj.mean_kl(),
    };
    Ok(if v.is_nan() { f64::NEG_INFINITY } else { v })
}

/// Forward search driven one step at a time.
pub struct ForwardSearch<'r, 'd> {
    reference: &'r ProjectionReference<'d>,
    scorer: PointwiseScorer<'d>,
    criterion: SearchCriterion,
    max_size: usize,
    path: Vec<usize>,
    state: SearchState,
}

impl<'r, 'd> ForwardSearch<'r, 'd> {
    fn new(
        reference: &'r ProjectionReference<'d>,
        scorer: PointwiseScorer<'d>,
        criterion: SearchCriterion,
        max_size: usize,
    ) -> Self {
        let max_size = max_size.min(reference.n_covariates());
        Self { reference, scorer, criterion, max_size, path: Vec::new(), state: SearchState::Init }
    }

    /// Current state.
    pub fn state(&self) -> SearchState {
        self.state
    }

    /// Covariates selected so far, in order.
    pub fn path(&self) -> &[usize] {
        &self.path
    }

    /// Advance by one transition.
    pub fn step(&mut self) -> Result<SearchState> {
        self.state = match self.state {
            SearchState::Init => SearchState::Growing { size: 0 },
            SearchState::Growing { size } if size >= self.max_size => SearchState::Finalize,
            SearchState::Growing { .. } => match self.add_best() {
                Ok(()) => SearchState::Growing { size: self.path.len() },
                Err(e) => {
                    self.state = SearchState::Aborted;
                    tracing::warn!(error = %e, path = ?self.path, "forward search aborted");
                    return Err(e);
                }
            },
            SearchState::Finalize => SearchState::Done,
            s @ (SearchState::Done | SearchState::Aborted) => s,
        };
        Ok(self.state)
    }

    /// Step until `Done`, returning the path.
    pub fn run(mut self) -> Result<Vec<usize>> {
        while self.step()? != SearchState::Done {}
        Ok(self.path)
    }

    fn add_best(&mut self) -> Result<()> {
        let candidates: Vec<usize> =
            (0..self.reference.n_covariates()).filter(|j| !self.path.contains(j)).collect();
        let scores = candidates
            .par_iter()
            .map(|&j| {
                let mut vars = self.path.clone();
                vars.push(j);
                let proj = self.reference.project(&vars)?;
                candidate_score(self.criterion, &self.scorer, &proj)
            })
            .collect::<Result<Vec<f64>>>()?;
        // Candidates are in ascending order, so strict `>` keeps the lowest index on ties.
        let mut best = 0;
        for (c, &s) in scores.iter().enumerate() {
            if s > scores[best] {
                best = c;
            }
        }
        let chosen = candidates[best];
        tracing::debug!(
            step = self.path.len() + 1,
            covariate = chosen,
            score = scores[best],
            "forward search step"
        );
        self.path.push(chosen);
        Ok(())
    }
}

/// Performance of one path prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeSummary {
    /// Number of covariates.
    pub size: usize,
    /// Covariate added at this size (`None` for the intercept-only model).
    pub added: Option<String>,
    /// Cross-validated elpd.
    pub elpd: f64,
    /// Standard error of `elpd`.
    pub se: f64,
    /// `elpd - elpd_baseline`.
    pub diff: f64,
    /// Standard error of the paired difference.
    pub se_diff: f64,
    /// Mean squared error of the cross-validated predictive mean.
    pub mse: f64,
    /// Mean projection KL divergence on the full data (`NaN` when not computed).
    pub kl: f64,
}

/// Reference model performance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePerformance {
    /// Cross-validated elpd.
    pub elpd: f64,
    /// Standard error.
    pub se: f64,
}

/// Output of [`varsel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarselResult {
    /// Covariate indices in the order they entered.
    pub path: Vec<usize>,
    /// Names of `path`.
    pub path_names: Vec<String>,
    /// Performance per size `0..=path.len()`.
    pub sizes: Vec<SizeSummary>,
    /// Reference model performance.
    pub reference: ReferencePerformance,
    /// Smallest size matching the baseline.
    pub suggested_size: Option<usize>,
    /// Per path position, share of folds that selected the same covariate (K-fold only).
    pub solution_terms_stability: Option<Vec<f64>>,
    /// Criterion used for the search.
    pub criterion: SearchCriterion,
    /// Baseline of the suggested-size rule.
    pub baseline: Baseline,
    /// Cross-validation method.
    pub cv_method: CvMethod,
    /// Final search state.
    pub state: SearchState,
    /// Reliability warnings.
    pub warnings: Vec<String>,
}

impl VarselResult {
    /// Covariates of the suggested submodel.
    pub fn selected(&self) -> &[usize] {
        &self.path[..self.suggested_size.unwrap_or(0).min(self.path.len())]
    }

    /// Names of the suggested covariates.
    pub fn selected_names(&self) -> &[String] {
        &self.path_names[..self.selected().len()]
    }
}

/// Smallest size with `diff + se_diff >= 0`.
pub fn suggest_size(sizes: &[SizeSummary]) -> Option<usize> {
    sizes.iter().find(|s| s.diff + s.se_diff >= -SIZE_RULE_TOL).map(|s| s.size)
}

fn summarize_sizes(
    pointwise: &[Pointwise],
    kl: &[f64],
    names: &[String],
    reference_pointwise: &[f64],
    baseline: Baseline,
) -> Result<Vec<SizeSummary>> {
    let totals: Vec<f64> = pointwise.iter().map(|p| p.elpd.iter().sum()).collect();
    let base: &[f64] = match baseline {
        Baseline::Reference => reference_pointwise,
        Baseline::Best => {
            let mut best = 0;
            for (k, &t) in totals.iter().enumerate() {
                if t > totals[best] {
                    best = k;
                }
            }
            &pointwise[best].elpd
        }
    };
    pointwise
        .iter()
        .enumerate()
        .map(|(k, p)| {
            let n = p.elpd.len() as f64;
            let (diff, se_diff) = elpd_diff(&p.elpd, base)?;
            Ok(SizeSummary {
                size: k,
                added: k.checked_sub(1).map(|j| names[j].clone()),
                elpd: totals[k],
                se: (n * sample_variance(&p.elpd)).sqrt(),
                diff,
                se_diff,
                mse: mean(&p.sq_err),
                kl: kl.get(k).copied().unwrap_or(f64::NAN),
            })
        })
        .collect()
}

/// Score every prefix of `path` (sizes `0..=max_size`).
fn prefix_performance(
    reference: &ProjectionReference<'_>,
    scorer: &PointwiseScorer<'_>,
    path: &[usize],
    max_size: usize,
) -> Result<(Vec<Pointwise>, Vec<f64>)> {
    let scored = (0..=max_size.min(path.len()))
        .into_par_iter()
        .map(|k| {
            let proj = reference.project(&path[..k])?;
            Ok((scorer.score(&proj)?, proj.mean_kl()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(scored.into_iter().unzip())
}

/// Log weights of every observation under PSIS-LOO for `fit`.
fn reference_log_weights(fit: &GlmFit, psis: &PsisConfig) -> Result<Vec<Vec<f64>>> {
    let ll = fit.log_lik()?;
    let r_eff = if psis.use_r_eff { relative_eff(&ll) } else { vec![1.0; ll.n_obs()] };
    Ok(psis_weights(&ll, &r_eff)?.into_iter().map(|w| w.log_weights).collect())
}

fn run_search(
    fit: &GlmFit,
    log_weights: &[Vec<f64>],
    config: &VarselConfig,
    max_size: usize,
) -> Result<Vec<usize>> {
    let reference = ProjectionReference::new(fit, config.n_draws_search)?;
    let scorer = PointwiseScorer::restricted(fit.dataset(), log_weights, reference.draw_indices());
    ForwardSearch::new(&reference, scorer, config.criterion, max_size).run()
}

/// Projection-predictive forward selection on a fitted reference model.
pub fn varsel(fit: &GlmFit, config: &VarselConfig) -> Result<VarselResult> {
    config.validate()?;
    let data = fit.dataset();
    let p = data.n_covariates();
    let max_size = config.max_size.unwrap_or(p).min(p);
    tracing::info!(
        n_covariates = p,
        max_size,
        criterion = ?config.criterion,
        cv = ?config.cv_method,
        "variable selection"
    );

    let ll = fit.log_lik()?;
    let (ref_loo, weights) = loo_with_weights(&ll, &config.psis)?;
    let mut warnings = Vec::new();
    if !ref_loo.warnings.is_empty() {
        warnings.extend(ref_loo.warnings.iter().map(|w| format!("reference model: {}", w)));
    }
    let log_weights: Vec<Vec<f64>> = weights.into_iter().map(|w| w.log_weights).collect();

    let path = run_search(fit, &log_weights, config, max_size)?;
    let path_names: Vec<String> = path.iter().map(|&j| data.names()[j].clone()).collect();
    tracing::info!(path = ?path_names, "search path");

    let (pointwise, kl, reference_pointwise, stability) = match config.cv_method {
        CvMethod::Loo => {
            let pred = ProjectionReference::new(fit, config.n_draws_pred)?;
            let scorer = PointwiseScorer::restricted(data, &log_weights, pred.draw_indices());
            let (pointwise, kl) = prefix_performance(&pred, &scorer, &path, max_size)?;
            (pointwise, kl, ref_loo.pointwise_elpd.clone(), None)
        }
        CvMethod::KFold { k } => {
            let cv = kfold_search(fit, config, k, max_size, &path)?;
            if cv.stability.iter().any(|&s| s < 0.5) {
                warnings.push("selected covariates vary across folds".to_string());
            }
            (cv.pointwise, Vec::new(), cv.reference, Some(cv.stability))
        }
    };

    let sizes = summarize_sizes(&pointwise, &kl, &path_names, &reference_pointwise, config.baseline)?;
    let suggested_size = suggest_size(&sizes);
    match suggested_size {
        Some(k) => tracing::info!(suggested_size = k, "selection done"),
        None => {
            let msg = "no submodel reaches the reference performance".to_string();
            tracing::warn!("{}", msg);
            warnings.push(msg);
        }
    }
    let (elpd, se) = {
        let n = reference_pointwise.len() as f64;
        (reference_pointwise.iter().sum::<f64>(), (n * sample_variance(&reference_pointwise)).sqrt())
    };
    Ok(VarselResult {
        path,
        path_names,
        sizes,
        reference: ReferencePerformance { elpd, se },
        suggested_size,
        solution_terms_stability: stability,
        criterion: config.criterion,
        baseline: config.baseline,
        cv_method: config.cv_method,
        state: SearchState::Done,
        warnings,
    })
}

struct KFoldPerformance {
    pointwise: Vec<Pointwise>,
    reference: Vec<f64>,
    stability: Vec<f64>,
}

fn kfold_search(
    fit: &GlmFit,
    config: &VarselConfig,
    k: usize,
    max_size: usize,
    full_path: &[usize],
) -> Result<KFoldPerformance> {
    let data = fit.dataset();
    let n = data.n_obs();
    let folds = kfold_split(n, k, config.seed)?;
    let n_sizes = max_size.min(full_path.len()) + 1;
    let mut pointwise: Vec<Pointwise> =
        (0..n_sizes).map(|_| Pointwise { elpd: vec![0.0; n], sq_err: vec![0.0; n] }).collect();
    let mut reference = vec![0.0; n];
    let mut agree = vec![0usize; full_path.len()];

    for f in 0..k {
        let (train_rows, test_rows) = fold_rows(&folds, f);
        let train = data.select_rows(&train_rows)?;
        let test = data.select_rows(&test_rows)?;
        let refit = fit.refit(&train)?;

        let ref_ll = refit.log_lik_on(&test)?;
        for (r, &i) in test_rows.iter().enumerate() {
            reference[i] = log_mean_exp(ref_ll.row(r));
        }

        let lw = reference_log_weights(&refit, &config.psis)?;
        let fold_path = run_search(&refit, &lw, config, max_size)?;
        for (pos, (&a, &b)) in fold_path.iter().zip(full_path).enumerate() {
            if a == b {
                agree[pos] += 1;
            }
        }

        let pred = ProjectionReference::new(&refit, config.n_draws_pred)?;
        let scorer = PointwiseScorer::uniform(&test, pred.draw_indices().len());
        let (fold_scores, _) = prefix_performance(&pred, &scorer, &fold_path, max_size)?;
        for (size, scores) in fold_scores.into_iter().enumerate().take(n_sizes) {
            for (r, &i) in test_rows.iter().enumerate() {
                pointwise[size].elpd[i] = scores.elpd[r];
                pointwise[size].sq_err[i] = scores.sq_err[r];
            }
        }
        tracing::debug!(fold = f, path = ?fold_path, "fold search done");
    }
    let stability = agree.into_iter().map(|a| a as f64 / k as f64).collect();
    Ok(KFoldPerformance { pointwise, reference, stability })
}

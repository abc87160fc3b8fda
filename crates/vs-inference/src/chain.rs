//! Chain storage and the multi-chain runner.

use crate::map::MapEstimator;
use crate::nuts::{NutsConfig, sample_nuts_from};
use rayon::prelude::*;
use vs_core::traits::LogDensityModel;
use vs_core::{Error, Result};

/// Post-warmup output of one NUTS chain.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    /// Draws in unconstrained space.
    pub draws_unconstrained: Vec<Vec<f64>>,
    /// Draws in constrained (model) space.
    pub draws_constrained: Vec<Vec<f64>>,
    /// Divergence flag per draw.
    pub divergences: Vec<bool>,
    /// Tree depth per draw.
    pub tree_depths: Vec<usize>,
    /// Leapfrog steps per draw.
    pub n_leapfrog: Vec<usize>,
    /// Acceptance statistic per draw.
    pub accept_stats: Vec<f64>,
    /// Hamiltonian of the selected state per draw.
    pub energies: Vec<f64>,
    /// Configured maximum tree depth.
    pub max_treedepth: usize,
    /// Adapted step size.
    pub step_size: f64,
    /// Diagonal of the adapted inverse mass matrix.
    pub inv_mass_diag: Vec<f64>,
    /// Divergent transitions during warmup.
    pub warmup_divergences: usize,
}

impl Chain {
    pub(crate) fn with_capacity(n: usize, max_treedepth: usize) -> Self {
        Self {
            draws_unconstrained: Vec::with_capacity(n),
            draws_constrained: Vec::with_capacity(n),
            divergences: Vec::with_capacity(n),
            tree_depths: Vec::with_capacity(n),
            n_leapfrog: Vec::with_capacity(n),
            accept_stats: Vec::with_capacity(n),
            energies: Vec::with_capacity(n),
            max_treedepth,
            ..Default::default()
        }
    }

    /// Number of draws.
    pub fn len(&self) -> usize {
        self.draws_constrained.len()
    }

    /// Whether the chain holds no draws.
    pub fn is_empty(&self) -> bool {
        self.draws_constrained.is_empty()
    }

    /// Number of divergent post-warmup transitions.
    pub fn n_divergent(&self) -> usize {
        self.divergences.iter().filter(|&&d| d).count()
    }
}

/// Result of a multi-chain run.
#[derive(Debug, Clone)]
pub struct SamplerResult {
    /// Chains in chain-id order.
    pub chains: Vec<Chain>,
    /// Parameter names.
    pub param_names: Vec<String>,
    /// Warmup iterations per chain.
    pub n_warmup: usize,
    /// Post-warmup draws per chain.
    pub n_samples: usize,
}

impl SamplerResult {
    /// Total number of post-warmup draws.
    pub fn total_draws(&self) -> usize {
        self.chains.iter().map(Chain::len).sum()
    }

    /// Draws of one parameter, one vector per chain.
    pub fn param_draws(&self, param_idx: usize) -> Vec<Vec<f64>> {
        self.chains
            .iter()
            .map(|c| c.draws_constrained.iter().map(|d| d[param_idx]).collect())
            .collect()
    }

    /// Posterior mean of one parameter over all chains.
    pub fn param_mean(&self, param_idx: usize) -> f64 {
        let draws: Vec<f64> = self.param_draws(param_idx).into_iter().flatten().collect();
        vs_prob::math::mean(&draws)
    }

    /// All constrained draws, chains concatenated in order.
    pub fn pooled_draws(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.chains.iter().flat_map(|c| c.draws_constrained.iter().map(|d| d.as_slice()))
    }

    /// Draw count per chain.
    pub fn chain_lengths(&self) -> Vec<usize> {
        self.chains.iter().map(Chain::len).collect()
    }
}

/// Run `n_chains` NUTS chains in parallel with rayon.
///
/// All chains start from the MAP estimate (falling back to `parameter_init()`
/// when the optimizer fails); chain `c` uses seed `seed + c`.
pub fn sample_nuts_multichain<M: LogDensityModel + ?Sized>(
    model: &M,
    n_chains: usize,
    n_warmup: usize,
    n_samples: usize,
    seed: u64,
    config: &NutsConfig,
) -> Result<SamplerResult> {
    if n_chains == 0 {
        return Err(Error::Validation("n_chains must be >= 1".to_string()));
    }
    if n_samples == 0 {
        return Err(Error::Validation("n_samples must be >= 1".to_string()));
    }
    config.validate()?;

    let theta_init = match MapEstimator::new().fit_minimum(model) {
        Ok(r) if r.parameters.iter().all(|v| v.is_finite()) => {
            if !r.converged {
                tracing::debug!(message = %r.message, "MAP search did not converge; using best point");
            }
            r.parameters
        }
        Ok(_) => model.parameter_init(),
        Err(e) => {
            tracing::warn!(error = %e, "MAP initialization failed; starting from parameter_init()");
            model.parameter_init()
        }
    };

    let chains = (0..n_chains)
        .into_par_iter()
        .map(|c| {
            let chain_seed = seed.wrapping_add(c as u64);
            sample_nuts_from(model, &theta_init, n_warmup, n_samples, chain_seed, config)
        })
        .collect::<Result<Vec<Chain>>>()?;

    Ok(SamplerResult { chains, param_names: model.parameter_names(), n_warmup, n_samples })
}

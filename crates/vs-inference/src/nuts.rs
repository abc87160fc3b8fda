//! No-U-Turn Sampler (NUTS), multinomial variant.
//!
//! Trajectories double in a random direction until the generalized no-U-turn
//! criterion fails, a divergence occurs or the maximum tree depth is reached.
//! Within a subtree the proposal is drawn uniformly in proportion to
//! `exp(-H)`; across doublings a biased progressive sample favours the new
//! subtree. U-turns are checked on the whole trajectory and on the two
//! extended subtrees at every merge.

use crate::adapt::{MetricKind, WindowedAdaptation, find_reasonable_step_size};
use crate::chain::Chain;
use crate::hmc::{HmcState, LeapfrogIntegrator, Metric};
use crate::posterior::Posterior;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use vs_core::traits::LogDensityModel;
use vs_core::{Error, Result};

/// NUTS sampler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutsConfig {
    /// Maximum tree depth (default 10).
    pub max_treedepth: usize,
    /// Target mean acceptance statistic during warmup (`adapt_delta`, default 0.8).
    pub target_accept: f64,
    /// Stddev of Gaussian jitter added to the initial unconstrained position.
    pub init_jitter: f64,
    /// Metric adapted during warmup.
    pub metric: MetricKind,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self { max_treedepth: 10, target_accept: 0.8, init_jitter: 0.0, metric: MetricKind::Diag }
    }
}

impl NutsConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(Error::Validation(format!(
                "target_accept must be in (0, 1), got {}",
                self.target_accept
            )));
        }
        if self.max_treedepth == 0 {
            return Err(Error::Validation("max_treedepth must be >= 1".to_string()));
        }
        if !(self.init_jitter.is_finite() && self.init_jitter >= 0.0) {
            return Err(Error::Validation(format!(
                "init_jitter must be >= 0, got {}",
                self.init_jitter
            )));
        }
        Ok(())
    }
}

/// Energy error above which a trajectory is declared divergent.
const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// Result of one NUTS transition.
#[derive(Debug, Clone)]
pub(crate) struct NutsTransition {
    pub state: HmcState,
    pub depth: usize,
    pub n_leapfrog: usize,
    pub divergent: bool,
    pub accept_stat: f64,
    pub energy: f64,
}

/// Momentum at one end of a trajectory, with `M^{-1} p` cached.
#[derive(Debug, Clone)]
struct Edge {
    p: Vec<f64>,
    p_sharp: Vec<f64>,
}

impl Edge {
    fn new(p: &[f64], metric: &Metric) -> Self {
        Self { p: p.to_vec(), p_sharp: metric.mul_inv_mass(p) }
    }
}

/// A valid (non-divergent, non-turning) subtree. `beg` is the end adjacent to
/// the existing trajectory, `end` the far end in the integration direction.
struct Subtree {
    end_state: HmcState,
    beg: Edge,
    end: Edge,
    rho: Vec<f64>,
    proposal: HmcState,
    log_sum_weight: f64,
}

#[derive(Default)]
struct TreeStats {
    n_leapfrog: usize,
    sum_metro_prob: f64,
    divergent: bool,
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn add(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

/// Generalized no-U-turn criterion: the trajectory keeps expanding while both
/// end velocities point along the summed momentum.
#[inline]
fn no_u_turn(p_sharp_minus: &[f64], p_sharp_plus: &[f64], rho: &[f64]) -> bool {
    dot(p_sharp_plus, rho) > 0.0 && dot(p_sharp_minus, rho) > 0.0
}

/// Merge checks shared by subtree building and the top-level loop: the full
/// span plus each half extended by the neighbouring edge of the other half.
fn persists(first_rho: &[f64], first: (&Edge, &Edge), second_rho: &[f64], second: (&Edge, &Edge)) -> bool {
    let (f_beg, f_end) = first;
    let (s_beg, s_end) = second;
    let rho = add(first_rho, second_rho);
    no_u_turn(&f_beg.p_sharp, &s_end.p_sharp, &rho)
        && no_u_turn(&f_beg.p_sharp, &s_beg.p_sharp, &add(first_rho, &s_beg.p))
        && no_u_turn(&f_end.p_sharp, &s_end.p_sharp, &add(second_rho, &f_end.p))
}

#[inline]
fn log_add_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    if m == f64::NEG_INFINITY { m } else { m + ((a - m).exp() + (b - m).exp()).ln() }
}

/// Build a subtree of `2^depth` leapfrog steps from `start`.
///
/// Returns `None` when the subtree diverged or contains a U-turn.
fn build_tree<M: LogDensityModel + ?Sized>(
    integrator: &LeapfrogIntegrator<'_, '_, M>,
    start: &HmcState,
    depth: usize,
    direction: i32,
    h0: f64,
    rng: &mut impl Rng,
    stats: &mut TreeStats,
) -> Option<Subtree> {
    if depth == 0 {
        stats.n_leapfrog += 1;
        let mut state = start.clone();
        let h = match integrator.step_dir(&mut state, direction) {
            Ok(()) => state.hamiltonian(integrator.metric()),
            Err(_) => f64::INFINITY,
        };
        let h = if h.is_nan() { f64::INFINITY } else { h };
        let log_w = h0 - h;
        stats.sum_metro_prob += if log_w > 0.0 { 1.0 } else { log_w.exp() };
        if h - h0 > DIVERGENCE_THRESHOLD {
            stats.divergent = true;
            return None;
        }
        let edge = Edge::new(&state.p, integrator.metric());
        return Some(Subtree {
            rho: state.p.clone(),
            beg: edge.clone(),
            end: edge,
            proposal: state.clone(),
            end_state: state,
            log_sum_weight: log_w,
        });
    }

    let init = build_tree(integrator, start, depth - 1, direction, h0, rng, stats)?;
    let fin = build_tree(integrator, &init.end_state, depth - 1, direction, h0, rng, stats)?;

    let log_sum_weight = log_add_exp(init.log_sum_weight, fin.log_sum_weight);
    let take_final = rng.random::<f64>() < (fin.log_sum_weight - log_sum_weight).exp();
    let proposal = if take_final { fin.proposal } else { init.proposal };

    if !persists(&init.rho, (&init.beg, &init.end), &fin.rho, (&fin.beg, &fin.end)) {
        return None;
    }
    Some(Subtree {
        rho: add(&init.rho, &fin.rho),
        end_state: fin.end_state,
        beg: init.beg,
        end: fin.end,
        proposal,
        log_sum_weight,
    })
}

/// One NUTS transition from `current` (momentum is resampled).
pub(crate) fn nuts_transition<M: LogDensityModel + ?Sized>(
    integrator: &LeapfrogIntegrator<'_, '_, M>,
    current: &HmcState,
    max_treedepth: usize,
    rng: &mut impl Rng,
) -> NutsTransition {
    let metric = integrator.metric();
    let mut state = current.clone();
    state.p = metric.sample_momentum(rng);
    let h0 = state.hamiltonian(metric);

    let mut left = state.clone();
    let mut right = state.clone();
    let mut left_edge = Edge::new(&state.p, metric);
    let mut right_edge = left_edge.clone();
    let mut rho = state.p.clone();
    let mut sample = state;
    let mut log_sum_weight = 0.0;
    let mut stats = TreeStats::default();
    let mut depth = 0;

    while depth < max_treedepth {
        let forward = rng.random::<bool>();
        let (start, direction) = if forward { (&right, 1) } else { (&left, -1) };
        let Some(sub) = build_tree(integrator, start, depth, direction, h0, rng, &mut stats) else {
            break;
        };
        depth += 1;

        if sub.log_sum_weight > log_sum_weight
            || rng.random::<f64>() < (sub.log_sum_weight - log_sum_weight).exp()
        {
            sample = sub.proposal;
        }
        log_sum_weight = log_add_exp(log_sum_weight, sub.log_sum_weight);

        let keep_going = if forward {
            persists(&rho, (&left_edge, &right_edge), &sub.rho, (&sub.beg, &sub.end))
        } else {
            persists(&sub.rho, (&sub.end, &sub.beg), &rho, (&left_edge, &right_edge))
        };
        rho = add(&rho, &sub.rho);
        if forward {
            right = sub.end_state;
            right_edge = sub.end;
        } else {
            left = sub.end_state;
            left_edge = sub.end;
        }
        if !keep_going {
            break;
        }
    }

    let n_leapfrog = stats.n_leapfrog.max(1);
    let energy = sample.hamiltonian(metric);
    NutsTransition {
        state: sample,
        depth,
        n_leapfrog: stats.n_leapfrog,
        divergent: stats.divergent,
        accept_stat: stats.sum_metro_prob / n_leapfrog as f64,
        energy,
    }
}

/// Run one NUTS chain on any [`LogDensityModel`], starting from `parameter_init()`.
pub fn sample_nuts<M: LogDensityModel + ?Sized>(
    model: &M,
    n_warmup: usize,
    n_samples: usize,
    seed: u64,
    config: &NutsConfig,
) -> Result<Chain> {
    sample_nuts_from(model, &model.parameter_init(), n_warmup, n_samples, seed, config)
}

/// Run one NUTS chain from constrained starting point `theta_init`.
///
/// Warmup follows the windowed schedule of [`WindowedAdaptation`]; after every
/// metric update the step size is re-initialized heuristically and dual
/// averaging restarts. Post-warmup draws use the smoothed step size.
pub fn sample_nuts_from<M: LogDensityModel + ?Sized>(
    model: &M,
    theta_init: &[f64],
    n_warmup: usize,
    n_samples: usize,
    seed: u64,
    config: &NutsConfig,
) -> Result<Chain> {
    config.validate()?;
    let posterior = Posterior::new(model);
    let dim = posterior.dim();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut z_init = posterior.to_unconstrained(theta_init)?;
    if config.init_jitter > 0.0 {
        let normal = Normal::new(0.0, config.init_jitter)
            .map_err(|e| Error::Validation(format!("invalid init_jitter: {e}")))?;
        for z in z_init.iter_mut() {
            *z += normal.sample(&mut rng);
        }
    }

    let metric = Metric::identity(dim);
    let eps0 = find_reasonable_step_size(&posterior, &z_init, &metric, 1.0, &mut rng);
    let mut adaptation =
        WindowedAdaptation::new(dim, n_warmup, config.target_accept, eps0, config.metric);
    let mut integrator = LeapfrogIntegrator::new(&posterior, eps0, metric);
    let mut state = integrator.init_state(z_init)?;

    let mut warmup_divergences = 0;
    for iter in 0..n_warmup {
        integrator.set_step_size(adaptation.step_size());
        let t = nuts_transition(&integrator, &state, config.max_treedepth, &mut rng);
        warmup_divergences += usize::from(t.divergent);
        state = t.state;
        if adaptation.update(iter, &state.q, t.accept_stat) {
            integrator.set_metric(adaptation.metric().clone());
            let eps = find_reasonable_step_size(
                &posterior,
                &state.q,
                adaptation.metric(),
                integrator.step_size(),
                &mut rng,
            );
            adaptation.restart_step_size(eps);
        }
    }

    let step_size = adaptation.adapted_step_size();
    integrator.set_step_size(step_size);
    integrator.set_metric(adaptation.metric().clone());
    tracing::debug!(seed, step_size, warmup_divergences, "warmup finished");

    let mut chain = Chain::with_capacity(n_samples, config.max_treedepth);
    chain.step_size = step_size;
    chain.inv_mass_diag = integrator.metric().inv_mass_diag();
    chain.warmup_divergences = warmup_divergences;
    for _ in 0..n_samples {
        let t = nuts_transition(&integrator, &state, config.max_treedepth, &mut rng);
        state = t.state;
        chain.draws_constrained.push(posterior.to_constrained(&state.q));
        chain.draws_unconstrained.push(state.q.clone());
        chain.divergences.push(t.divergent);
        chain.tree_depths.push(t.depth);
        chain.n_leapfrog.push(t.n_leapfrog);
        chain.accept_stats.push(t.accept_stat);
        chain.energies.push(t.energy);
    }
    Ok(chain)
}

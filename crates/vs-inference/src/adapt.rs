//! Warmup adaptation for NUTS: dual-averaging step size and Welford mass matrix.
//!
//! Follows the Stan schedule: an initial fast buffer (step size only), a
//! sequence of doubling slow windows (step size plus metric estimate at each
//! window end), and a terminal fast buffer.

use crate::hmc::{LeapfrogIntegrator, Metric};
use crate::posterior::Posterior;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use vs_core::traits::LogDensityModel;

/// Dual averaging for step size adaptation (Nesterov 2009, Stan variant).
#[derive(Debug, Clone)]
pub struct DualAveraging {
    target_accept: f64,
    log_eps: f64,
    log_eps_bar: f64,
    h_bar: f64,
    mu: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    step: usize,
}

impl DualAveraging {
    /// Create with target acceptance statistic and initial step size.
    pub fn new(target_accept: f64, init_eps: f64) -> Self {
        let mut da = Self {
            target_accept,
            log_eps: 0.0,
            log_eps_bar: 0.0,
            h_bar: 0.0,
            mu: 0.0,
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            step: 0,
        };
        da.restart(init_eps);
        da
    }

    /// Feed the acceptance statistic of one transition.
    pub fn update(&mut self, accept_stat: f64) {
        self.step += 1;
        let m = self.step as f64;
        let w = 1.0 / (m + self.t0);
        let a = if accept_stat.is_finite() { accept_stat.clamp(0.0, 1.0) } else { 0.0 };
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target_accept - a);
        self.log_eps = self.mu - (m.sqrt() / self.gamma) * self.h_bar;
        let m_kappa = m.powf(-self.kappa);
        self.log_eps_bar = m_kappa * self.log_eps + (1.0 - m_kappa) * self.log_eps_bar;
    }

    /// Step size to use for the next warmup transition.
    pub fn current_step_size(&self) -> f64 {
        self.log_eps.exp()
    }

    /// Smoothed step size, used after warmup.
    pub fn adapted_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }

    /// Restart the averaging around a new step size.
    pub fn restart(&mut self, init_eps: f64) {
        let l = init_eps.ln();
        self.log_eps = l;
        self.log_eps_bar = l;
        self.h_bar = 0.0;
        self.mu = (10.0 * init_eps).ln();
        self.step = 0;
    }
}

/// Online Welford variance (diagonal metric).
#[derive(Debug, Clone)]
pub struct WelfordVariance {
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: usize,
}

impl WelfordVariance {
    /// Estimator for `dim`-dimensional draws.
    pub fn new(dim: usize) -> Self {
        Self { mean: vec![0.0; dim], m2: vec![0.0; dim], count: 0 }
    }

    /// Number of draws seen.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Add one draw.
    pub fn update(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), &xi) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(x) {
            let delta = xi - *mean;
            *mean += delta / n;
            *m2 += delta * (xi - *mean);
        }
    }

    /// Sample variance; `1.0` per dimension with fewer than two draws.
    pub fn variance(&self) -> Vec<f64> {
        if self.count < 2 {
            return vec![1.0; self.mean.len()];
        }
        let n = self.count as f64;
        self.m2.iter().map(|&m| m / (n - 1.0)).collect()
    }

    /// Forget all draws.
    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

/// Online Welford covariance (dense metric).
#[derive(Debug, Clone)]
pub struct WelfordCovariance {
    mean: DVector<f64>,
    m2: DMatrix<f64>,
    count: usize,
}

impl WelfordCovariance {
    /// Estimator for `dim`-dimensional draws.
    pub fn new(dim: usize) -> Self {
        Self { mean: DVector::zeros(dim), m2: DMatrix::zeros(dim, dim), count: 0 }
    }

    /// Number of draws seen.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Add one draw.
    pub fn update(&mut self, x: &[f64]) {
        self.count += 1;
        let x = DVector::from_column_slice(x);
        let delta = &x - &self.mean;
        self.mean += &delta / self.count as f64;
        let delta2 = &x - &self.mean;
        self.m2 += &delta * delta2.transpose();
    }

    /// Sample covariance, `None` with fewer than two draws.
    pub fn covariance(&self) -> Option<DMatrix<f64>> {
        (self.count >= 2).then(|| &self.m2 / (self.count as f64 - 1.0))
    }

    /// Forget all draws.
    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

/// Kind of metric adapted during warmup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Diagonal mass matrix.
    #[default]
    Diag,
    /// Dense mass matrix.
    Dense,
}

/// Phase of one warmup iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fast,
    Slow { window_end: usize },
}

/// Windowed adaptation combining step size and metric tuning.
#[derive(Debug, Clone)]
pub struct WindowedAdaptation {
    dual_avg: DualAveraging,
    var: WelfordVariance,
    cov: Option<WelfordCovariance>,
    slow_windows: Vec<(usize, usize)>,
    metric: Metric,
}

impl WindowedAdaptation {
    /// Adaptation for `dim` parameters over `n_warmup` iterations.
    pub fn new(
        dim: usize,
        n_warmup: usize,
        target_accept: f64,
        init_eps: f64,
        kind: MetricKind,
    ) -> Self {
        Self {
            dual_avg: DualAveraging::new(target_accept, init_eps),
            var: WelfordVariance::new(dim),
            cov: (kind == MetricKind::Dense).then(|| WelfordCovariance::new(dim)),
            slow_windows: slow_windows(n_warmup),
            metric: Metric::identity(dim),
        }
    }

    fn phase(&self, iter: usize) -> Phase {
        self.slow_windows
            .iter()
            .find(|(start, end)| (*start..*end).contains(&iter))
            .map_or(Phase::Fast, |&(_, window_end)| Phase::Slow { window_end })
    }

    /// Record warmup iteration `iter` with position `q` and its acceptance statistic.
    ///
    /// Returns `true` when the metric changed; the caller should then pick a new
    /// initial step size and pass it to [`restart_step_size`](Self::restart_step_size).
    pub fn update(&mut self, iter: usize, q: &[f64], accept_stat: f64) -> bool {
        self.dual_avg.update(accept_stat);
        let Phase::Slow { window_end } = self.phase(iter) else {
            return false;
        };
        self.var.update(q);
        if let Some(cov) = self.cov.as_mut() {
            cov.update(q);
        }
        if iter + 1 < window_end {
            return false;
        }
        self.metric = self.estimate_metric();
        self.var.reset();
        if let Some(cov) = self.cov.as_mut() {
            cov.reset();
        }
        true
    }

    /// Stan-style regularization toward a small multiple of the identity.
    fn estimate_metric(&self) -> Metric {
        let n = self.var.count() as f64;
        let w = n / (n + 5.0);
        let shrink = 1e-3 * 5.0 / (n + 5.0);
        if let Some(cov) = self.cov.as_ref().and_then(|c| c.covariance()) {
            let dim = cov.nrows();
            let reg = cov * w + DMatrix::identity(dim, dim) * shrink;
            if let Ok(metric) = Metric::dense(reg) {
                return metric;
            }
            tracing::debug!("dense metric estimate not positive definite; using diagonal");
        }
        Metric::Diag(self.var.variance().iter().map(|&v| (w * v + shrink).max(1e-10)).collect())
    }

    /// Restart dual averaging around `eps` (after a metric change).
    pub fn restart_step_size(&mut self, eps: f64) {
        self.dual_avg.restart(eps);
    }

    /// Step size for the next warmup transition.
    pub fn step_size(&self) -> f64 {
        self.dual_avg.current_step_size()
    }

    /// Final smoothed step size.
    pub fn adapted_step_size(&self) -> f64 {
        self.dual_avg.adapted_step_size()
    }

    /// Current metric.
    pub fn metric(&self) -> &Metric {
        &self.metric
    }
}

/// Slow windows `[start, end)` of the Stan warmup schedule.
///
/// Default buffers are 75 (initial), 25 (first slow window) and 50 (terminal);
/// they shrink to 15% / 75% / 10% of `n_warmup` when warmup is too short. Each
/// slow window doubles the previous one, and the last absorbs any remainder
/// that could not hold another doubled window.
pub(crate) fn slow_windows(n_warmup: usize) -> Vec<(usize, usize)> {
    if n_warmup < 20 {
        return Vec::new();
    }
    let (mut init, mut base, mut term) = (75, 25, 50);
    if init + base + term > n_warmup {
        init = (0.15 * n_warmup as f64) as usize;
        term = (0.1 * n_warmup as f64) as usize;
        base = n_warmup - init - term;
    }
    let slow_end = n_warmup - term;
    let mut windows = Vec::new();
    let mut start = init;
    let mut size = base;
    while start < slow_end {
        let mut end = (start + size).min(slow_end);
        if end + 2 * size > slow_end {
            end = slow_end;
        }
        windows.push((start, end));
        start = end;
        size *= 2;
    }
    windows
}

/// Heuristic initial step size (Hoffman & Gelman 2014, Algorithm 4).
///
/// Starting from `start_eps`, doubles or halves the step until the one-step
/// acceptance `exp(H0 - H1)` crosses 0.8 with a unit-variance momentum drawn
/// from the metric.
pub fn find_reasonable_step_size<M: LogDensityModel + ?Sized>(
    posterior: &Posterior<'_, M>,
    q: &[f64],
    metric: &Metric,
    start_eps: f64,
    rng: &mut impl rand::Rng,
) -> f64 {
    let integrator = LeapfrogIntegrator::new(posterior, start_eps, metric.clone());
    let Ok(mut state) = integrator.init_state(q.to_vec()) else {
        return start_eps;
    };
    state.p = metric.sample_momentum(rng);
    let h0 = state.hamiltonian(metric);

    let log_accept = |eps: f64| -> f64 {
        let mut s = state.clone();
        match integrator.step_with_eps(&mut s, eps) {
            Ok(()) => {
                let d = h0 - s.hamiltonian(metric);
                if d.is_nan() { f64::NEG_INFINITY } else { d }
            }
            Err(_) => f64::NEG_INFINITY,
        }
    };

    let target = 0.8_f64.ln();
    let mut eps = start_eps;
    let direction = if log_accept(eps) > target { 1 } else { -1 };
    for _ in 0..100 {
        let la = log_accept(eps);
        if (direction == 1 && la <= target) || (direction == -1 && la >= target) {
            break;
        }
        let next = if direction == 1 { eps * 2.0 } else { eps * 0.5 };
        if !(1e-10..=1e7).contains(&next) {
            break;
        }
        eps = next;
    }
    eps
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_dual_averaging_adapts_direction() {
        let mut high = DualAveraging::new(0.8, 0.01);
        let mut low = DualAveraging::new(0.8, 1.0);
        for _ in 0..200 {
            high.update(0.99);
            low.update(0.1);
        }
        assert!(high.adapted_step_size() > 0.01);
        assert!(low.adapted_step_size() < 1.0);
    }

    #[test]
    fn test_dual_averaging_ignores_nan() {
        let mut da = DualAveraging::new(0.8, 0.5);
        da.update(f64::NAN);
        assert!(da.current_step_size().is_finite());
        assert!(da.current_step_size() < 0.5 * 10.0);
    }

    #[test]
    fn test_welford_variance_and_covariance() {
        let data = [[1.0, 10.0], [2.0, 20.0], [3.0, 30.0], [4.0, 40.0], [5.0, 50.0]];
        let mut w = WelfordVariance::new(2);
        let mut c = WelfordCovariance::new(2);
        for d in &data {
            w.update(d);
            c.update(d);
        }
        let var = w.variance();
        assert_relative_eq!(var[0], 2.5, epsilon = 1e-12);
        assert_relative_eq!(var[1], 250.0, epsilon = 1e-10);
        let cov = c.covariance().unwrap();
        assert_relative_eq!(cov[(0, 1)], 25.0, epsilon = 1e-10);
        assert_relative_eq!(cov[(1, 0)], 25.0, epsilon = 1e-10);
        w.reset();
        c.reset();
        assert_eq!(w.variance(), vec![1.0, 1.0]);
        assert!(c.covariance().is_none());
    }

    #[test]
    fn test_stan_windows_default() {
        let w = slow_windows(1000);
        assert_eq!(w, vec![(75, 100), (100, 150), (150, 250), (250, 450), (450, 950)]);
    }

    #[test]
    fn test_stan_windows_short_and_tiny() {
        assert!(slow_windows(10).is_empty());
        let w = slow_windows(100);
        assert_eq!(w.first().unwrap().0, 15);
        assert_eq!(w.last().unwrap().1, 90);
        for pair in w.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn test_windowed_adaptation_updates_metric_at_window_end() {
        let mut ad = WindowedAdaptation::new(1, 200, 0.8, 0.1, MetricKind::Diag);
        let windows = slow_windows(200);
        let (start, end) = windows[0];
        let mut changed_at = None;
        for it in 0..end {
            let q = [if it % 2 == 0 { 2.0 } else { -2.0 }];
            if ad.update(it, &q, 0.8) {
                changed_at = Some(it);
            }
        }
        assert_eq!(changed_at, Some(end - 1));
        assert!(start > 0);
        match ad.metric() {
            Metric::Diag(d) => assert!(d[0] > 1.0, "variance of +-2 draws should exceed 1: {}", d[0]),
            other => panic!("unexpected metric {:?}", other),
        }
    }
}

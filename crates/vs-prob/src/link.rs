//! Link functions for binomial GLMs.
//!
//! Every link maps a linear predictor `eta ∈ ℝ` to a success probability `mu ∈ (0, 1)`.
//! Log-probabilities are computed in tail-stable form so that `ln mu` and `ln(1 - mu)`
//! stay finite far beyond the point where `mu` itself rounds to 0 or 1.

use crate::math::{exp_clamped, log_sigmoid, sigmoid};
use crate::normal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use vs_core::Error;

/// Smallest probability used when a ratio needs `mu` or `1 - mu` in a denominator.
pub const PROB_FLOOR: f64 = 1e-300;

/// Inverse-link family for binomial responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Link {
    /// Logistic, `mu = 1 / (1 + exp(-eta))`.
    #[default]
    Logit,
    /// Standard normal CDF.
    Probit,
    /// Standard Cauchy CDF.
    Cauchit,
    /// Complementary log-log, `mu = 1 - exp(-exp(eta))`.
    #[serde(rename = "cloglog")]
    CLogLog,
}

impl Link {
    /// All supported links, in a stable order.
    pub const ALL: [Link; 4] = [Link::Logit, Link::Probit, Link::Cauchit, Link::CLogLog];

    /// Canonical lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Link::Logit => "logit",
            Link::Probit => "probit",
            Link::Cauchit => "cauchit",
            Link::CLogLog => "cloglog",
        }
    }

    /// Inverse link: `mu = g⁻¹(eta)`.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            Link::Logit => sigmoid(eta),
            Link::Probit => normal::cdf(eta),
            Link::Cauchit => f64::atan2(1.0, -eta) / PI,
            Link::CLogLog => -(-exp_clamped(eta)).exp_m1(),
        }
    }

    /// Link: `eta = g(mu)`, for `mu` in `(0, 1)`.
    pub fn link(self, mu: f64) -> f64 {
        let mu = mu.clamp(1e-12, 1.0 - 1e-12);
        match self {
            Link::Logit => (mu / (1.0 - mu)).ln(),
            Link::Probit => normal::quantile(mu),
            Link::Cauchit => (PI * (mu - 0.5)).tan(),
            Link::CLogLog => (-(-mu).ln_1p()).ln(),
        }
    }

    /// `(ln mu, ln(1 - mu))` at `eta`.
    pub fn log_probs(self, eta: f64) -> (f64, f64) {
        match self {
            Link::Logit => (log_sigmoid(eta), log_sigmoid(-eta)),
            Link::Probit => (normal::log_cdf(eta), normal::log_cdf(-eta)),
            Link::Cauchit => ((f64::atan2(1.0, -eta) / PI).ln(), (f64::atan2(1.0, eta) / PI).ln()),
            Link::CLogLog => {
                let e = exp_clamped(eta);
                ((-(-e).exp_m1()).max(PROB_FLOOR).ln(), -e)
            }
        }
    }

    /// Derivative `dmu/deta`.
    pub fn dmu_deta(self, eta: f64) -> f64 {
        match self {
            Link::Logit => {
                let s = sigmoid(eta);
                s * (1.0 - s)
            }
            Link::Probit => normal::log_std_pdf(eta).exp(),
            Link::Cauchit => 1.0 / (PI * (1.0 + eta * eta)),
            Link::CLogLog => (eta.min(700.0) - exp_clamped(eta)).exp(),
        }
    }

    /// `(d ln mu / d eta, d ln(1 - mu) / d eta)`.
    ///
    /// Computed as ratios in log space so the tails do not produce `0/0`.
    pub fn dlog_probs(self, eta: f64) -> (f64, f64) {
        match self {
            Link::Logit => {
                let s = sigmoid(eta);
                (1.0 - s, -s)
            }
            Link::Probit => {
                let lphi = normal::log_std_pdf(eta);
                ((lphi - normal::log_cdf(eta)).exp(), -(lphi - normal::log_cdf(-eta)).exp())
            }
            Link::Cauchit => {
                let q = 1.0 + eta * eta;
                (
                    1.0 / (q * f64::atan2(1.0, -eta).max(PROB_FLOOR)),
                    -1.0 / (q * f64::atan2(1.0, eta).max(PROB_FLOOR)),
                )
            }
            Link::CLogLog => {
                let e = exp_clamped(eta);
                let (ln_mu, _) = self.log_probs(eta);
                ((eta.min(700.0) - e - ln_mu).exp(), -e)
            }
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Link {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "logit" | "logistic" => Ok(Link::Logit),
            "probit" => Ok(Link::Probit),
            "cauchit" => Ok(Link::Cauchit),
            "cloglog" => Ok(Link::CLogLog),
            other => Err(Error::Validation(format!(
                "unknown link '{}': expected one of logit, probit, cauchit, cloglog",
                other
            ))),
        }
    }
}

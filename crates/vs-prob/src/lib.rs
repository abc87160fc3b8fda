//! Probability building blocks for varsel.
//!
//! This crate hosts the probability math shared by the GLM model, the sampler and
//! the cross-validation code:
//! - scalar log-densities (normal, Student-t / half-t, inverse-gamma, binomial)
//! - link functions mapping a linear predictor to a probability
//! - transforms/bijectors (for constrained parameterizations)
//! - small numeric helpers (stable log/exp/sigmoid primitives)

pub mod binomial;
pub mod inv_gamma;
pub mod link;
pub mod math;
pub mod normal;
pub mod student_t;
pub mod transforms;

pub use link::Link;

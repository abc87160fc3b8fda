//! Bijective transforms (bijectors) for unconstrained parameterization.
//!
//! NUTS operates in unconstrained space `z ∈ R^n`. These transforms map between
//! unconstrained `z` and constrained parameters `theta`, providing the Jacobian terms
//! needed for correct densities. GLM parameters are either unbounded (intercept,
//! coefficients, horseshoe `z`) or positive (sigma, local/global scales, slab `caux`).

/// A bijective transform from unconstrained `z` to constrained `theta`.
pub trait Bijector: Send + Sync {
    /// Map unconstrained -> constrained: `theta = forward(z)`
    fn forward(&self, z: f64) -> f64;
    /// Map constrained -> unconstrained: `z = inverse(theta)`
    fn inverse(&self, theta: f64) -> f64;
    /// Log absolute determinant of Jacobian: `log|dtheta/dz|`
    fn log_abs_det_jacobian(&self, z: f64) -> f64;
    /// Derivative of log|J| w.r.t. z
    fn grad_log_abs_det_jacobian(&self, z: f64) -> f64;
    /// Jacobian element: `dtheta/dz`
    fn jacobian(&self, z: f64) -> f64;
}

/// Identity: `(-inf, inf) -> (-inf, inf)`.
pub struct IdentityBijector;

impl Bijector for IdentityBijector {
    #[inline]
    fn forward(&self, z: f64) -> f64 {
        z
    }
    #[inline]
    fn inverse(&self, theta: f64) -> f64 {
        theta
    }
    #[inline]
    fn log_abs_det_jacobian(&self, _z: f64) -> f64 {
        0.0
    }
    #[inline]
    fn grad_log_abs_det_jacobian(&self, _z: f64) -> f64 {
        0.0
    }
    #[inline]
    fn jacobian(&self, _z: f64) -> f64 {
        1.0
    }
}

/// LowerBounded: `(-inf, inf) -> (a, inf)`, `theta = a + exp(z)`, `log|J| = z`.
///
/// With `a = 0` this is the plain exp transform used for scale parameters.
pub struct LowerBoundedBijector {
    lower: f64,
}

impl LowerBoundedBijector {
    /// Create a new lower-bounded bijector with given lower bound.
    pub fn new(lower: f64) -> Self {
        Self { lower }
    }
}

impl Bijector for LowerBoundedBijector {
    #[inline]
    fn forward(&self, z: f64) -> f64 {
        self.lower + z.exp()
    }
    #[inline]
    fn inverse(&self, theta: f64) -> f64 {
        // FP noise can put theta marginally on the bound.
        (theta - self.lower).max(1e-300).ln()
    }
    #[inline]
    fn log_abs_det_jacobian(&self, z: f64) -> f64 {
        z
    }
    #[inline]
    fn grad_log_abs_det_jacobian(&self, _z: f64) -> f64 {
        1.0
    }
    #[inline]
    fn jacobian(&self, z: f64) -> f64 {
        z.exp()
    }
}

/// Composite transform for a vector of parameters, one bijector per parameter.
pub struct ParameterTransform {
    bijectors: Vec<Box<dyn Bijector>>,
}

impl ParameterTransform {
    /// Create transforms from parameter bounds.
    ///
    /// - `(-inf, inf)` -> Identity
    /// - `(a, inf)` with finite `a` -> LowerBounded(a) (exp for `a = 0`)
    ///
    /// Finite upper bounds are not used by any GLM parameter and fall back to Identity.
    pub fn from_bounds(bounds: &[(f64, f64)]) -> Self {
        let bijectors = bounds
            .iter()
            .map(|&(lo, hi)| -> Box<dyn Bijector> {
                if lo.is_finite() && hi == f64::INFINITY {
                    Box::new(LowerBoundedBijector::new(lo))
                } else {
                    Box::new(IdentityBijector)
                }
            })
            .collect();
        Self { bijectors }
    }

    /// Number of parameters.
    pub fn dim(&self) -> usize {
        self.bijectors.len()
    }

    /// Map unconstrained -> constrained.
    pub fn forward(&self, z: &[f64]) -> Vec<f64> {
        z.iter().zip(&self.bijectors).map(|(&zi, b)| b.forward(zi)).collect()
    }

    /// Map constrained -> unconstrained.
    pub fn inverse(&self, theta: &[f64]) -> Vec<f64> {
        theta.iter().zip(&self.bijectors).map(|(&ti, b)| b.inverse(ti)).collect()
    }

    /// Sum of log|J| over all parameters.
    pub fn log_abs_det_jacobian(&self, z: &[f64]) -> f64 {
        z.iter().zip(&self.bijectors).map(|(&zi, b)| b.log_abs_det_jacobian(zi)).sum()
    }

    /// Gradient of sum(log|J|) w.r.t. z.
    pub fn grad_log_abs_det_jacobian(&self, z: &[f64]) -> Vec<f64> {
        z.iter().zip(&self.bijectors).map(|(&zi, b)| b.grad_log_abs_det_jacobian(zi)).collect()
    }

    /// Diagonal Jacobian: `dtheta_i/dz_i` for each parameter.
    pub fn jacobian_diag(&self, z: &[f64]) -> Vec<f64> {
        z.iter().zip(&self.bijectors).map(|(&zi, b)| b.jacobian(zi)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_roundtrip(b: &dyn Bijector, zs: &[f64], rtol: f64) {
        for &z in zs {
            let back = b.inverse(b.forward(z));
            assert!((z - back).abs() / z.abs().max(1.0) < rtol, "z={} back={}", z, back);
        }
    }

    fn check_grad_log_jac(b: &dyn Bijector, zs: &[f64]) {
        let eps = 1e-7;
        for &z in zs {
            let fd = (b.log_abs_det_jacobian(z + eps) - b.log_abs_det_jacobian(z - eps)) / (2.0 * eps);
            assert!((b.grad_log_abs_det_jacobian(z) - fd).abs() < 1e-6, "z={}", z);
        }
    }

    #[test]
    fn test_identity() {
        let b = IdentityBijector;
        check_roundtrip(&b, &[-3.0, 0.0, 10.0], 1e-15);
        assert_eq!(b.log_abs_det_jacobian(1.0), 0.0);
        assert_eq!(b.jacobian(1.0), 1.0);
    }

    #[test]
    fn test_lower_bounded() {
        let b = LowerBoundedBijector::new(2.5);
        check_roundtrip(&b, &[-5.0, -1.0, 0.0, 1.0, 5.0], 1e-10);
        check_grad_log_jac(&b, &[-3.0, 0.0, 3.0]);
        assert!(b.forward(-30.0) > 2.5);
    }

    #[test]
    fn test_parameter_transform_from_bounds() {
        let bounds = vec![(f64::NEG_INFINITY, f64::INFINITY), (0.0, f64::INFINITY)];
        let t = ParameterTransform::from_bounds(&bounds);
        assert_eq!(t.dim(), 2);

        let z = vec![0.5, 1.0];
        let theta = t.forward(&z);
        assert!((theta[0] - 0.5).abs() < 1e-15);
        assert!((theta[1] - 1.0f64.exp()).abs() < 1e-12);

        let z_back = t.inverse(&theta);
        for (a, b) in z.iter().zip(&z_back) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!((t.log_abs_det_jacobian(&z) - 1.0).abs() < 1e-15);
        assert_eq!(t.grad_log_abs_det_jacobian(&z), vec![0.0, 1.0]);
        let j = t.jacobian_diag(&z);
        assert!((j[1] - 1.0f64.exp()).abs() < 1e-12);
    }
}

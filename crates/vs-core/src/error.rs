//! Error types for varsel

use thiserror::Error;

/// varsel error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input (data quality, dimensions, hyperparameters)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numerical failure (singular system, non-finite density, solver did not converge)
    #[error("Computation error: {0}")]
    Computation(String),

    /// Sampler output failed its convergence gates
    #[error("Convergence error: {0}")]
    Convergence(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::Convergence("r_hat_high".to_string());
        assert_eq!(e.to_string(), "Convergence error: r_hat_high");
    }

    #[test]
    fn test_io_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.csv");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}

//! # vs-core
//!
//! Core types, traits, and error handling for varsel.
//!
//! This crate provides:
//! - The shared error type
//! - [`LogDensityModel`], the interface every sampler and optimizer works against
//! - Shared result types

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{LogDensityModel, PreparedModelRef, PreparedNll};
pub use types::FitResult;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

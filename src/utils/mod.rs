//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `harq` broker.
//!
//! It centralizes the crate-wide error type and the logging bootstrap so every
//! other module reports failures and diagnostics the same way.

pub mod error;
pub mod logging;

pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
        logging::init("nonsense");
    }
}

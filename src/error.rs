//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for the crate
///
/// Only build preconditions and resource exhaustion are surfaced; anything
/// local to a single cell (interval evaluator faults, rank-deficient QEFs) is
/// absorbed during construction.
#[derive(Error, Debug)]
pub enum Error {
    #[error("region has lower > upper (or a non-finite bound) on axis {0}")]
    InvalidRegion(usize),

    #[error("min_feature must be > 0 (got {0})")]
    InvalidMinFeature(f64),

    #[error("could not spawn worker thread: {0}")]
    ResourceExhausted(#[from] std::io::Error),
}

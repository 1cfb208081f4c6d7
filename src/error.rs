//! Crate-level error aggregate.
//!
//! Each component defines its own error enum next to the code that raises
//! it; [`BenchError`] folds them together for the driver and the binary.

use thiserror::Error;

use crate::endpoint::CompletionError;
use crate::exchange::ExchangeError;
use crate::fabric::PostError;
use crate::qp::StateTransitionError;
use crate::region::AllocationError;

/// Anything that can go wrong setting up or running a benchmark.
#[derive(Debug, Error)]
pub enum BenchError {
    /// A configuration constraint was violated.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Transition(#[from] StateTransitionError),

    #[error(transparent)]
    Post(#[from] PostError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

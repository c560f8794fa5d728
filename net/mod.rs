//! Network building blocks for neural survival models: dense layers with
//! hand-written backpropagation, feature gates, the shared trunk, the
//! multi-head network and first-order optimizers.

pub mod gate;
pub mod layers;
pub mod multitask;
pub mod optim;
pub mod trunk;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetError {
    #[error("expected {expected} input features, got {found}")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("got {found} task indices for {expected} rows")]
    TaskLengthMismatch { expected: usize, found: usize },
    #[error("task index {index} at row {row} exceeds the {num_tasks} task heads")]
    TaskIndexOutOfRange {
        row: usize,
        index: usize,
        num_tasks: usize,
    },
}

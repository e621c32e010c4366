//! Cross-replica coordination: distributed locks and leader election.

mod election;
mod lock;

pub use election::*;
pub use lock::*;

use thiserror::Error;

use crate::db::DbError;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("lock backend failure: {0}")]
    Backend(String),
    #[error("lock store error: {0}")]
    Store(#[from] DbError),
}

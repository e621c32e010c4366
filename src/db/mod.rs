//! Database module for Vigil.
//!
//! Storage contracts for targets and probe history, a SQLite store with
//! embedded migrations, and in-memory implementations.

pub mod memory;
mod models;
mod repository;
mod resilient;
mod store;

pub use models::*;
pub use repository::*;
pub use resilient::*;
pub use store::*;

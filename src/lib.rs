//! Vigil - probe execution and coordination engine.
//!
//! Probes one target per tick in round-robin order over TCP or ICMP, stores
//! the outcome, publishes it to listeners and notifies on UP/DOWN transitions.
//! Replicas sharing a database elect a single leader to run the schedule.

pub mod cache;
pub mod config;
pub mod coordination;
pub mod db;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod notification;
pub mod pool;
pub mod probe;
pub mod resilience;
pub mod scheduler;
pub mod web;

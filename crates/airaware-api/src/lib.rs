//! Operator control surface
//!
//! Small REST API over the repository: list and resolve alerts, manage
//! push subscriptions, expose runtime counters. Transport concerns stop
//! here; all state changes go through the repository.

pub mod rest;

pub use rest::{router, ApiState};

//! Core library for adaptive scanning campaigns.
//!
//! A campaign drives a remote scanning instrument with a surrogate model: the
//! instrument measures, each measurement is reduced to a task vector, the model
//! learns from the task vectors and proposes where to measure next. This crate
//! holds the instrument transports, the position store, the model contract with
//! a baseline implementation and the orchestrator running it all. It is used by
//! the `smartscan` command line application.

pub mod config;
pub mod core;
pub mod error;
pub mod error_recovery;
pub mod gp;
pub mod grid;
pub mod logging;
pub mod registry;
pub mod scan;
pub mod store;
pub mod tasks;
pub mod transport;

//! Kiln kernel — contracts and pure logic for the CI scheduler core.
//!
//! This crate holds everything the scheduler needs that does not talk to the
//! outside world: the cron evaluator, the task model and its structural
//! equality rules, runner identity and matching, the wire message shapes,
//! the store and SCM probe contracts, and the configuration types.
//!
//! Concrete implementations (sqlite store, git probe, zeromq endpoint) live
//! in `kiln-core`; the kernel must never depend on them.

// cron evaluation
pub mod cron;

// error module
pub mod error;

// JSON structural helpers
pub mod json;

// wire messages
pub mod message;

// runner identity
pub mod runner;

// SCM probe contract
pub mod scm;

// task store contract
pub mod store;

// task model
pub mod task;

// configuration types and loader
pub mod config;

pub use error::{KernelError, KernelResult};

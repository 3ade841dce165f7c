//! SCM probe implementations.
//!
//! Git is the only implemented kind; configuration referencing anything else
//! is rejected when the project registry is built.

pub mod git;

pub use git::GitProbe;

#[cfg(test)]
pub(crate) use stub::StubProbe;
